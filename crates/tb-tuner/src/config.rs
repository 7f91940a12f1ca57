use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tb_link::RobotLink;
use tb_types::{config_error, PidLoop, TuneError, TuneResult};

use crate::optimizer::{
    BayesConfig, BayesianOptimizer, GaConfig, GeneticAlgorithm, Optimizer, ParticleSwarm,
    PsoConfig, RelayConfig, RelayTuner,
};
use crate::space::SearchSpace;
use crate::trial::TrialConfig;

/// Which search algorithm a session runs, with its hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    Ga(GaConfig),
    Pso(PsoConfig),
    Relay(RelayConfig),
    Bayes(BayesConfig),
}

impl AlgorithmConfig {
    pub fn name(&self) -> &'static str {
        match self {
            AlgorithmConfig::Ga(_) => "genetic",
            AlgorithmConfig::Pso(_) => "particle_swarm",
            AlgorithmConfig::Relay(_) => "relay",
            AlgorithmConfig::Bayes(_) => "bayesian",
        }
    }

    /// Steps the optimizer will run: generations, iterations, or the
    /// single relay experiment.
    pub fn budget(&self) -> usize {
        match self {
            AlgorithmConfig::Ga(config) => config.generations,
            AlgorithmConfig::Pso(config) => config.iterations,
            AlgorithmConfig::Relay(_) => 1,
            AlgorithmConfig::Bayes(config) => config.iterations,
        }
    }

    pub fn validate(&self) -> TuneResult<()> {
        match self {
            AlgorithmConfig::Ga(config) => config.validate(),
            AlgorithmConfig::Pso(config) => config.validate(),
            AlgorithmConfig::Relay(config) => config.validate(),
            AlgorithmConfig::Bayes(config) => config.validate(),
        }
    }

    pub fn build(&self, link: Arc<dyn RobotLink>) -> Box<dyn Optimizer> {
        match self {
            AlgorithmConfig::Ga(config) => Box::new(GeneticAlgorithm::new(*config)),
            AlgorithmConfig::Pso(config) => Box::new(ParticleSwarm::new(*config)),
            AlgorithmConfig::Relay(config) => Box::new(RelayTuner::new(*config, link)),
            AlgorithmConfig::Bayes(config) => Box::new(BayesianOptimizer::new(*config)),
        }
    }
}

/// Everything one tuning session needs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TunerConfig {
    /// Control loop whose gains are searched
    pub pid_loop: PidLoop,
    pub space: SearchSpace,
    pub trial: TrialConfig,
    pub algorithm: AlgorithmConfig,
    /// Fixed seed for reproducible runs; None draws from entropy
    pub seed: Option<u64>,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            pid_loop: PidLoop::Balance,
            space: SearchSpace::default(),
            trial: TrialConfig::default(),
            algorithm: AlgorithmConfig::Ga(GaConfig::default()),
            seed: None,
        }
    }
}

impl TunerConfig {
    pub fn with_pid_loop(mut self, pid_loop: PidLoop) -> Self {
        self.pid_loop = pid_loop;
        self
    }

    pub fn with_space(mut self, space: SearchSpace) -> Self {
        self.space = space;
        self
    }

    pub fn with_trial(mut self, trial: TrialConfig) -> Self {
        self.trial = trial;
        self
    }

    pub fn with_algorithm(mut self, algorithm: AlgorithmConfig) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> TuneResult<()> {
        self.space.validate()?;
        self.trial.validate()?;
        if self.trial.weights.sum() <= 0.0 {
            return Err(config_error!("fitness weights must not sum to zero"));
        }
        self.algorithm.validate()
    }
}
