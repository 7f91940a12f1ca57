use serde::{Deserialize, Serialize};

/// Minimum telemetry samples a trial must collect to be scored
pub const MIN_SAMPLES: usize = 5;

/// Sign-change rate above which the oscillation penalty applies
const OSCILLATION_RATE_LIMIT: f64 = 0.3;
const OSCILLATION_PENALTY_SCALE: f64 = 20.0;
const OVERSHOOT_SCALE: f64 = 10.0;
const SSE_SCALE: f64 = 5.0;
/// Fraction of samples, by index, treated as the steady-state tail
const TAIL_FRACTION_NUM: usize = 3;
const TAIL_FRACTION_DEN: usize = 10;

/// One telemetry point collected during a trial, with the timestamp
/// relative to trial start after the settling window was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialSample {
    pub timestamp_ms: f64,
    pub angle_deg: f64,
    pub speed: f64,
    pub loop_time_ms: f64,
}

impl TrialSample {
    pub fn new(timestamp_ms: f64, angle_deg: f64, speed: f64, loop_time_ms: f64) -> Self {
        Self {
            timestamp_ms,
            angle_deg,
            speed,
            loop_time_ms,
        }
    }
}

/// Relative weights of the fitness components. Normalized by their sum,
/// so (50, 30, 20) and (5, 3, 2) score identically.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitnessWeights {
    pub itae: f64,
    pub overshoot: f64,
    pub sse: f64,
}

impl Default for FitnessWeights {
    fn default() -> Self {
        Self {
            itae: 50.0,
            overshoot: 30.0,
            sse: 20.0,
        }
    }
}

impl FitnessWeights {
    pub fn new(itae: f64, overshoot: f64, sse: f64) -> Self {
        Self {
            itae,
            overshoot,
            sse,
        }
    }

    pub fn sum(&self) -> f64 {
        self.itae + self.overshoot + self.sse
    }
}

/// Composite score for one trial, lower is better
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitnessResult {
    pub fitness: f64,
    pub itae: f64,
    pub overshoot: f64,
    pub steady_state_error: f64,
}

impl FitnessResult {
    /// Score for a trial that produced no usable data.
    pub fn failed() -> Self {
        Self {
            fitness: f64::INFINITY,
            itae: 0.0,
            overshoot: 0.0,
            steady_state_error: 0.0,
        }
    }

    pub fn is_failed(&self) -> bool {
        !self.fitness.is_finite()
    }
}

/// Scores a trial's angle response. Pure: no state, no side effects,
/// identical input always produces identical output.
pub struct FitnessEvaluator;

impl FitnessEvaluator {
    /// Compute the composite fitness of one trial.
    ///
    /// With fewer than [`MIN_SAMPLES`] points the result is an infinite
    /// fitness rather than an error, so degenerate trials rank behind
    /// every scored candidate without aborting a run.
    pub fn compute(samples: &[TrialSample], weights: &FitnessWeights) -> FitnessResult {
        if samples.len() < MIN_SAMPLES {
            return FitnessResult::failed();
        }
        let n = samples.len() as f64;

        // --- ITAE: time-weighted mean absolute error ---
        let itae = samples
            .iter()
            .map(|s| s.angle_deg.abs() * (s.timestamp_ms / 1000.0))
            .sum::<f64>()
            / n;

        // --- overshoot: worst excursion from upright ---
        let overshoot = samples
            .iter()
            .map(|s| s.angle_deg.abs())
            .fold(0.0, f64::max);

        // --- steady-state error: mean absolute angle over the tail ---
        let tail_len = (samples.len() * TAIL_FRACTION_NUM / TAIL_FRACTION_DEN).max(1);
        let tail = &samples[samples.len() - tail_len..];
        let steady_state_error =
            tail.iter().map(|s| s.angle_deg.abs()).sum::<f64>() / tail.len() as f64;

        // --- oscillation penalty ---
        let change_rate = sign_change_rate(samples);
        let oscillation_penalty = if change_rate > OSCILLATION_RATE_LIMIT {
            change_rate * OSCILLATION_PENALTY_SCALE
        } else {
            0.0
        };

        let weight_sum = weights.sum();
        let fitness = if weight_sum > 0.0 {
            (weights.itae / weight_sum) * itae
                + (weights.overshoot / weight_sum) * overshoot * OVERSHOOT_SCALE
                + (weights.sse / weight_sum) * steady_state_error * SSE_SCALE
                + oscillation_penalty
        } else {
            f64::INFINITY
        };

        FitnessResult {
            fitness,
            itae,
            overshoot,
            steady_state_error,
        }
    }
}

/// Fraction of consecutive sample pairs whose angle changes sign.
fn sign_change_rate(samples: &[TrialSample]) -> f64 {
    let changes = samples
        .windows(2)
        .filter(|pair| pair[0].angle_deg * pair[1].angle_deg < 0.0)
        .count();
    changes as f64 / (samples.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_samples(angles: &[f64]) -> Vec<TrialSample> {
        angles
            .iter()
            .enumerate()
            .map(|(i, &a)| TrialSample::new(i as f64 * 100.0, a, 0.0, 10.0))
            .collect()
    }

    #[test]
    fn test_too_few_samples_score_infinite() {
        let weights = FitnessWeights::default();
        for count in 0..MIN_SAMPLES {
            let samples = flat_samples(&vec![1.0; count]);
            let result = FitnessEvaluator::compute(&samples, &weights);
            assert!(result.is_failed(), "{count} samples must not be scored");
        }
        let samples = flat_samples(&vec![1.0; MIN_SAMPLES]);
        let result = FitnessEvaluator::compute(&samples, &weights);
        assert!(result.fitness.is_finite());
    }

    #[test]
    fn test_compute_is_pure() {
        let samples = flat_samples(&[2.0, -1.5, 1.0, -0.5, 0.25, 0.1]);
        let weights = FitnessWeights::default();
        let first = FitnessEvaluator::compute(&samples, &weights);
        let second = FitnessEvaluator::compute(&samples, &weights);
        assert_eq!(first, second);
    }

    #[test]
    fn test_oscillatory_response_hand_computed() {
        // Alternating +-1 deg: ITAE 0.2, overshoot 1, tail 1 sample,
        // every transition flips sign so the penalty applies.
        let samples = flat_samples(&[1.0, -1.0, 1.0, -1.0, 1.0]);
        let result = FitnessEvaluator::compute(&samples, &FitnessWeights::default());

        assert!((result.itae - 0.2).abs() < 1e-9);
        assert!((result.overshoot - 1.0).abs() < 1e-9);
        assert!((result.steady_state_error - 1.0).abs() < 1e-9);
        // 0.5*0.2 + 0.3*10*1 + 0.2*5*1 + 1.0*20
        assert!((result.fitness - 24.1).abs() < 1e-9);
    }

    #[test]
    fn test_decaying_response_hand_computed() {
        let samples = flat_samples(&[2.0, 1.0, 0.5, 0.25, 0.125]);
        let result = FitnessEvaluator::compute(&samples, &FitnessWeights::default());

        assert!((result.itae - 0.065).abs() < 1e-9);
        assert!((result.overshoot - 2.0).abs() < 1e-9);
        assert!((result.steady_state_error - 0.125).abs() < 1e-9);
        // 0.5*0.065 + 0.3*10*2 + 0.2*5*0.125, no oscillation penalty
        assert!((result.fitness - 6.1575).abs() < 1e-9);
    }

    #[test]
    fn test_oscillation_penalty_threshold() {
        // 11 samples, 3 sign changes: rate 0.3 is not above the limit.
        let at_limit = flat_samples(&[1.0, 1.0, 1.0, -1.0, -1.0, -1.0, 1.0, 1.0, 1.0, -1.0, -1.0]);
        let result = FitnessEvaluator::compute(&at_limit, &FitnessWeights::new(100.0, 0.0, 0.0));
        let baseline = result.itae;
        assert!((result.fitness - baseline).abs() < 1e-9, "no penalty at the limit");

        // One more flip pushes the rate to 0.4 and costs 0.4 * 20.
        let over_limit = flat_samples(&[1.0, 1.0, 1.0, -1.0, -1.0, -1.0, 1.0, 1.0, -1.0, 1.0, 1.0]);
        let result = FitnessEvaluator::compute(&over_limit, &FitnessWeights::new(100.0, 0.0, 0.0));
        assert!((result.fitness - (result.itae + 8.0)).abs() < 1e-9);
    }

    #[test]
    fn test_weights_are_normalized_by_sum() {
        let samples = flat_samples(&[2.0, 1.0, 0.5, 0.25, 0.125, 0.1, 0.05]);
        let scaled_up = FitnessEvaluator::compute(&samples, &FitnessWeights::new(50.0, 30.0, 20.0));
        let scaled_down = FitnessEvaluator::compute(&samples, &FitnessWeights::new(5.0, 3.0, 2.0));
        assert!((scaled_up.fitness - scaled_down.fitness).abs() < 1e-9);
    }

    #[test]
    fn test_zero_weight_sum_scores_infinite() {
        let samples = flat_samples(&[1.0, 0.5, 0.25, 0.1, 0.05]);
        let result = FitnessEvaluator::compute(&samples, &FitnessWeights::new(0.0, 0.0, 0.0));
        assert!(result.fitness.is_infinite());
    }

    #[test]
    fn test_tail_uses_last_thirty_percent_by_index() {
        // Ten samples: the tail is exactly the last three.
        let mut angles = vec![5.0; 7];
        angles.extend_from_slice(&[0.3, 0.2, 0.1]);
        let samples = flat_samples(&angles);
        let result = FitnessEvaluator::compute(&samples, &FitnessWeights::default());
        assert!((result.steady_state_error - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_damped_beats_sustained_oscillation() {
        let damped = flat_samples(&[3.0, -1.5, 0.8, -0.4, 0.2, -0.1, 0.05, 0.02, 0.01, 0.0]);
        let ringing = flat_samples(&[3.0, -3.0, 3.0, -3.0, 3.0, -3.0, 3.0, -3.0, 3.0, -3.0]);
        let weights = FitnessWeights::default();
        let damped_score = FitnessEvaluator::compute(&damped, &weights);
        let ringing_score = FitnessEvaluator::compute(&ringing, &weights);
        assert!(damped_score.fitness < ringing_score.fitness);
    }
}
