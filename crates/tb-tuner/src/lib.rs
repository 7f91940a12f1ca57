//! # tb-tuner
//!
//! Closed-loop PID auto-tuning for a self-balancing robot. A
//! [`TuningSession`] drives one search algorithm (genetic, particle
//! swarm, relay ultimate-gain, or Bayesian) over a bounded gain space,
//! scoring each candidate with a live trial on the plant and reporting
//! progress through an observer interface.

mod config;
mod control;
mod fitness;
mod optimizer;
mod session;
mod space;
mod trial;

pub use config::{AlgorithmConfig, TunerConfig};
pub use control::RunControl;
pub use fitness::{FitnessEvaluator, FitnessResult, FitnessWeights, TrialSample, MIN_SAMPLES};
pub use optimizer::{
    Acquisition, BayesConfig, BayesianOptimizer, Candidate, GaConfig, GeneticAlgorithm, Optimizer,
    OptimizerContext, Particle, ParticleSwarm, PsoConfig, RelayConfig, RelayTuner,
};
pub use session::{
    NullObserver, Progress, SessionEnd, SessionState, SessionStatus, TuningObserver, TuningSession,
};
pub use space::{GainBounds, SearchSpace};
pub use trial::{TrialConfig, TrialEvaluator, TrialRecord, TrialRunner};
