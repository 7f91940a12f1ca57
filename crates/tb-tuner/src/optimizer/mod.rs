use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use tb_types::{Gains, TuneError, TuneResult};

use crate::control::RunControl;
use crate::fitness::FitnessResult;
use crate::session::TuningObserver;
use crate::space::SearchSpace;
use crate::trial::{TrialEvaluator, TrialRecord};

mod bayes;
mod ga;
mod pso;
mod relay;

pub use bayes::{Acquisition, BayesConfig, BayesianOptimizer};
pub use ga::{GaConfig, GeneticAlgorithm};
pub use pso::{Particle, ParticleSwarm, PsoConfig};
pub use relay::{RelayConfig, RelayTuner};

/// One gain triple and its evaluation outcome. Freshly proposed
/// candidates carry an infinite fitness until a trial scores them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub gains: Gains,
    pub fitness: f64,
}

impl Candidate {
    pub fn new(gains: Gains) -> Self {
        Self {
            gains,
            fitness: f64::INFINITY,
        }
    }

    pub fn is_evaluated(&self) -> bool {
        self.fitness.is_finite()
    }
}

/// Shared machinery handed to an optimizer while it runs: the trial
/// seam, the search space, baseline gains, pause/stop switches, the
/// random stream, and trial accounting.
pub struct OptimizerContext {
    pub evaluator: Arc<dyn TrialEvaluator>,
    pub space: SearchSpace,
    pub baseline: Gains,
    pub control: RunControl,
    pub rng: ChaCha8Rng,
    observer: Arc<dyn TuningObserver>,
    trial_count: usize,
}

impl OptimizerContext {
    pub fn new(
        evaluator: Arc<dyn TrialEvaluator>,
        space: SearchSpace,
        baseline: Gains,
        control: RunControl,
        observer: Arc<dyn TuningObserver>,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            evaluator,
            space,
            baseline,
            control,
            rng,
            observer,
            trial_count: 0,
        }
    }

    /// Trials finished so far, including failed ones.
    pub fn trial_count(&self) -> usize {
        self.trial_count
    }

    /// Evaluate one candidate on the plant.
    ///
    /// Failures are handled per the recovery rules: a timed-out or
    /// under-sampled trial scores the candidate as infinite and the
    /// search continues. An emergency from the plant pauses the run,
    /// restores the baseline gains exactly once, then blocks here until
    /// the operator resumes; the same candidate is retried so the
    /// interruption never skips it. Anything else aborts the run.
    pub async fn evaluate(&mut self, gains: Gains) -> TuneResult<f64> {
        loop {
            self.control.wait_if_paused().await;
            if self.control.is_stopped() {
                return Ok(f64::INFINITY);
            }

            let started_at = Utc::now();
            match self.evaluator.evaluate(gains).await {
                Ok(result) => {
                    self.record(gains, result, started_at);
                    return Ok(result.fitness);
                }
                Err(err) if err.is_trial_local() => {
                    warn!(gains = %gains, error = %err, "trial failed; scoring candidate as infinite");
                    self.record(gains, FitnessResult::failed(), started_at);
                    return Ok(f64::INFINITY);
                }
                Err(TuneError::EmergencyInterrupt { reason }) => {
                    warn!(
                        gains = %gains,
                        reason = %reason,
                        "emergency interrupt; pausing run and restoring baseline"
                    );
                    self.control.pause();
                    self.evaluator.apply_gains(self.baseline).await?;
                    // Parked at the top of the loop until resumed; the
                    // interrupted candidate goes back on the plant then.
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn record(&mut self, gains: Gains, result: FitnessResult, started_at: DateTime<Utc>) {
        let record = TrialRecord {
            id: Uuid::new_v4(),
            index: self.trial_count,
            gains,
            result,
            started_at,
            finished_at: Utc::now(),
        };
        self.trial_count += 1;
        debug!(
            index = record.index,
            fitness = result.fitness,
            "trial recorded"
        );
        self.observer.on_trial(&record);
    }
}

/// A search algorithm over the gain space.
///
/// Implementations own their population state; the session drives them
/// through `initialize` then repeated `step` calls until `is_done`,
/// with pause/stop arriving through the context's [`RunControl`].
#[async_trait]
pub trait Optimizer: Send {
    /// Algorithm name for logs and progress reports.
    fn name(&self) -> &'static str;

    /// Total number of steps this optimizer intends to run.
    fn budget(&self) -> usize;

    /// Best candidate scored so far, if any trial has succeeded.
    fn best(&self) -> Option<Candidate>;

    /// Whether the step budget is exhausted.
    fn is_done(&self) -> bool;

    /// Build initial state (populations, seed samples) before stepping.
    async fn initialize(&mut self, ctx: &mut OptimizerContext) -> TuneResult<()>;

    /// Run one generation or iteration.
    async fn step(&mut self, ctx: &mut OptimizerContext) -> TuneResult<()>;
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::session::NullObserver;

    #[test]
    fn test_fresh_candidate_is_unevaluated() {
        let candidate = Candidate::new(Gains::new(1.0, 2.0, 3.0));
        assert!(!candidate.is_evaluated());
        assert!(candidate.fitness.is_infinite());
    }

    #[tokio::test]
    async fn test_successful_trial_returns_fitness_and_records() {
        let evaluator = Arc::new(ScriptedEvaluator::new(vec![ScriptedEvaluator::scored(3.5)]));
        let observer = Arc::new(CollectingObserver::default());
        let mut ctx = OptimizerContext::new(
            evaluator.clone(),
            SearchSpace::default(),
            Gains::new(40.0, 5.0, 2.0),
            RunControl::new(),
            observer.clone(),
            Some(1),
        );

        let gains = Gains::new(30.0, 1.0, 4.0);
        let fitness = ctx.evaluate(gains).await.unwrap();
        assert_eq!(fitness, 3.5);
        assert_eq!(ctx.trial_count(), 1);

        let trials = observer.trials.lock();
        assert_eq!(trials.len(), 1);
        assert_eq!(trials[0].index, 0);
        assert_eq!(trials[0].gains, gains);
        assert_eq!(trials[0].result.fitness, 3.5);
    }

    #[tokio::test]
    async fn test_trial_local_failures_degrade_to_infinite() {
        let evaluator = Arc::new(ScriptedEvaluator::new(vec![
            Err(TuneError::TrialTimeout { timeout_ms: 4600 }),
            Err(TuneError::InsufficientData { got: 2, need: 5 }),
        ]));
        let mut ctx = test_context(evaluator.clone(), 1);

        let first = ctx.evaluate(Gains::new(20.0, 0.0, 1.0)).await.unwrap();
        let second = ctx.evaluate(Gains::new(25.0, 0.0, 1.0)).await.unwrap();
        assert!(first.is_infinite());
        assert!(second.is_infinite());
        // Both failures are recorded and counted; nothing was retried.
        assert_eq!(ctx.trial_count(), 2);
        assert_eq!(evaluator.evaluated.lock().len(), 2);
        assert!(evaluator.restored.lock().is_empty());
    }

    #[tokio::test]
    async fn test_emergency_restores_baseline_once_and_retries_same_candidate() {
        let control = RunControl::new();
        let mut evaluator = ScriptedEvaluator::new(vec![
            Err(TuneError::EmergencyInterrupt {
                reason: "fall detected".to_string(),
            }),
            ScriptedEvaluator::scored(7.0),
        ]);
        evaluator.resume_on_restore = Some(control.clone());
        let evaluator = Arc::new(evaluator);

        let baseline = Gains::new(40.0, 5.0, 2.0);
        let mut ctx = OptimizerContext::new(
            evaluator.clone(),
            SearchSpace::default(),
            baseline,
            control.clone(),
            Arc::new(NullObserver),
            Some(1),
        );

        let candidate = Gains::new(60.0, 2.0, 6.0);
        let fitness = ctx.evaluate(candidate).await.unwrap();
        assert_eq!(fitness, 7.0);

        // Baseline went back on the plant exactly once, and the same
        // candidate was retried after the resume.
        assert_eq!(*evaluator.restored.lock(), vec![baseline]);
        assert_eq!(*evaluator.evaluated.lock(), vec![candidate, candidate]);
        // Only the successful retry is recorded as a trial.
        assert_eq!(ctx.trial_count(), 1);
        assert!(!control.is_paused());
    }

    #[tokio::test]
    async fn test_stop_while_interrupted_abandons_candidate() {
        let control = RunControl::new();
        let mut evaluator = ScriptedEvaluator::new(vec![Err(TuneError::EmergencyInterrupt {
            reason: "kill switch".to_string(),
        })]);
        evaluator.stop_on_restore = Some(control.clone());
        let evaluator = Arc::new(evaluator);

        let mut ctx = OptimizerContext::new(
            evaluator.clone(),
            SearchSpace::default(),
            Gains::new(40.0, 5.0, 2.0),
            control.clone(),
            Arc::new(NullObserver),
            Some(1),
        );

        let fitness = ctx.evaluate(Gains::new(70.0, 3.0, 1.0)).await.unwrap();
        assert!(fitness.is_infinite());
        // No retry happened after the stop.
        assert_eq!(evaluator.evaluated.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unexpected_errors_propagate() {
        let evaluator = Arc::new(ScriptedEvaluator::new(vec![Err(TuneError::Link {
            message: "radio dropped".to_string(),
        })]));
        let mut ctx = test_context(evaluator, 1);

        let err = ctx.evaluate(Gains::new(30.0, 0.5, 2.0)).await.unwrap_err();
        assert!(matches!(err, TuneError::Link { .. }));
    }

    #[tokio::test]
    async fn test_trial_indexes_are_sequential() {
        let evaluator = Arc::new(ScriptedEvaluator::new(vec![
            ScriptedEvaluator::scored(1.0),
            ScriptedEvaluator::scored(2.0),
            ScriptedEvaluator::scored(3.0),
        ]));
        let observer = Arc::new(CollectingObserver::default());
        let mut ctx = OptimizerContext::new(
            evaluator,
            SearchSpace::default(),
            Gains::new(40.0, 5.0, 2.0),
            RunControl::new(),
            observer.clone(),
            Some(1),
        );

        for kp in [10.0, 20.0, 30.0] {
            ctx.evaluate(Gains::new(kp, 0.0, 0.0)).await.unwrap();
        }
        let trials = observer.trials.lock();
        let indexes: Vec<usize> = trials.iter().map(|t| t.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }
}
