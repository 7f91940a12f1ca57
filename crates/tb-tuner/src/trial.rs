use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use tb_link::RobotLink;
use tb_types::{config_error, Gains, PidLoop, PlantEvent, TuneError, TuneResult};

use crate::fitness::{FitnessEvaluator, FitnessResult, FitnessWeights, TrialSample, MIN_SAMPLES};

/// Timing and scoring parameters for one trial
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialConfig {
    /// Transient discard window after gains are applied, milliseconds
    pub settling_ms: u64,
    /// Scored collection window after settling, milliseconds
    pub duration_ms: u64,
    /// Fitness component weights
    pub weights: FitnessWeights,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            settling_ms: 300,
            duration_ms: 2000,
            weights: FitnessWeights::default(),
        }
    }
}

impl TrialConfig {
    pub fn with_settling_ms(mut self, settling_ms: u64) -> Self {
        self.settling_ms = settling_ms;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_weights(mut self, weights: FitnessWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Full per-trial window including settling.
    pub fn window_ms(&self) -> u64 {
        self.settling_ms + self.duration_ms
    }

    /// Hard deadline after which a stalled trial is abandoned.
    pub fn timeout_ms(&self) -> u64 {
        2 * self.window_ms()
    }

    pub fn validate(&self) -> TuneResult<()> {
        if self.duration_ms == 0 {
            return Err(config_error!("trial duration must be positive"));
        }
        Ok(())
    }
}

/// One finished trial, kept for history and observer reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: Uuid,
    /// Trial number within the session, starting at zero
    pub index: usize,
    pub gains: Gains,
    pub result: FitnessResult,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Seam between the optimizers and the plant.
///
/// The production implementation is [`TrialRunner`]; tests substitute
/// scripted evaluators to exercise search logic without a robot.
#[async_trait]
pub trait TrialEvaluator: Send + Sync {
    /// Run one bounded experiment with `gains` applied and score it.
    async fn evaluate(&self, gains: Gains) -> TuneResult<FitnessResult>;

    /// Apply `gains` to the plant without running a trial.
    async fn apply_gains(&self, gains: Gains) -> TuneResult<()>;
}

/// Runs one live trial at a time against the plant.
///
/// A trial applies candidate gains, discards the settling transient,
/// collects telemetry for the scoring window, and hands the samples to
/// the fitness evaluator. Completion is driven by telemetry arrival; if
/// the stream stalls the trial is abandoned at twice the window.
#[derive(Clone)]
pub struct TrialRunner {
    link: Arc<dyn RobotLink>,
    pid_loop: PidLoop,
    config: TrialConfig,
}

impl TrialRunner {
    pub fn new(link: Arc<dyn RobotLink>, pid_loop: PidLoop, config: TrialConfig) -> Self {
        Self {
            link,
            pid_loop,
            config,
        }
    }

    pub fn config(&self) -> &TrialConfig {
        &self.config
    }

    async fn run_trial(&self, gains: Gains) -> TuneResult<FitnessResult> {
        let mut rx = self.link.subscribe();
        self.link
            .apply_gains(self.pid_loop, gains)
            .await
            .map_err(TuneError::from)?;

        let settling = Duration::from_millis(self.config.settling_ms);
        let window = Duration::from_millis(self.config.window_ms());
        let start = Instant::now();
        let mut samples: Vec<TrialSample> = Vec::new();

        let collected = timeout(window * 2, async {
            loop {
                match rx.recv().await {
                    Ok(PlantEvent::Telemetry(frame)) => {
                        let elapsed = start.elapsed();
                        if elapsed >= settling {
                            samples.push(TrialSample::new(
                                (elapsed - settling).as_secs_f64() * 1000.0,
                                frame.pitch_deg,
                                frame.speed,
                                frame.loop_time_ms,
                            ));
                        }
                        if elapsed >= window {
                            return Ok(());
                        }
                    }
                    Ok(PlantEvent::Emergency { reason }) => {
                        return Err(TuneError::EmergencyInterrupt { reason });
                    }
                    Ok(PlantEvent::RelayDone) => continue,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "telemetry receiver lagged during trial");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(TuneError::Link {
                            message: "plant event stream closed mid-trial".to_string(),
                        });
                    }
                }
            }
        })
        .await;

        match collected {
            Err(_) => Err(TuneError::TrialTimeout {
                timeout_ms: self.config.timeout_ms(),
            }),
            Ok(Err(err)) => Err(err),
            Ok(Ok(())) => {
                if samples.len() < MIN_SAMPLES {
                    return Err(TuneError::InsufficientData {
                        got: samples.len(),
                        need: MIN_SAMPLES,
                    });
                }
                let result = FitnessEvaluator::compute(&samples, &self.config.weights);
                debug!(
                    samples = samples.len(),
                    fitness = result.fitness,
                    "trial scored"
                );
                Ok(result)
            }
        }
    }
}

#[async_trait]
impl TrialEvaluator for TrialRunner {
    async fn evaluate(&self, gains: Gains) -> TuneResult<FitnessResult> {
        self.run_trial(gains).await
    }

    async fn apply_gains(&self, gains: Gains) -> TuneResult<()> {
        self.link
            .apply_gains(self.pid_loop, gains)
            .await
            .map_err(TuneError::from)
    }
}
