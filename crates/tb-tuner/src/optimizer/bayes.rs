use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tb_types::{config_error, Gains, TuneError, TuneResult};

use crate::optimizer::{Candidate, Optimizer, OptimizerContext};
use crate::space::{GainBounds, SearchSpace};

/// Grid resolution per searched dimension during acquisition
const LATTICE_STEPS: usize = 8;
/// Tikhonov term keeping the normal equations solvable when samples
/// are few or collinear
const RIDGE: f64 = 1e-6;
const PIVOT_EPS: f64 = 1e-12;
const UCB_EXPLORATION: f64 = 2.0;
const FEATURE_COUNT: usize = 10;

/// Acquisition function scoring lattice points against the surrogate
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acquisition {
    #[default]
    ExpectedImprovement,
    UpperConfidenceBound,
    ProbabilityOfImprovement,
}

/// Bayesian optimizer parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BayesConfig {
    /// Random probes evaluated up front, in addition to the baseline
    pub initial_samples: usize,
    /// Acquisition iterations after the initial probes
    pub iterations: usize,
    pub acquisition: Acquisition,
    /// Exploration margin for improvement-based acquisitions
    pub xi: f64,
}

impl Default for BayesConfig {
    fn default() -> Self {
        Self {
            initial_samples: 5,
            iterations: 15,
            acquisition: Acquisition::ExpectedImprovement,
            xi: 0.01,
        }
    }
}

impl BayesConfig {
    pub fn validate(&self) -> TuneResult<()> {
        if self.initial_samples == 0 {
            return Err(config_error!("initial sample count must be positive"));
        }
        if self.iterations == 0 {
            return Err(config_error!("iteration budget must be positive"));
        }
        if !self.xi.is_finite() || self.xi < 0.0 {
            return Err(config_error!("xi must be finite and non-negative, got {}", self.xi));
        }
        Ok(())
    }
}

fn normalized_axis(bounds: GainBounds, value: f64) -> f64 {
    let range = bounds.range();
    if range > 0.0 {
        (value - bounds.min) / range
    } else {
        0.0
    }
}

/// Gains mapped onto the unit cube of the search space.
fn normalize(space: &SearchSpace, gains: Gains) -> [f64; 3] {
    [
        normalized_axis(space.kp, gains.kp),
        normalized_axis(space.ki, gains.ki),
        normalized_axis(space.kd, gains.kd),
    ]
}

fn features(x: [f64; 3]) -> [f64; FEATURE_COUNT] {
    let [p, i, d] = x;
    [1.0, p, i, d, p * p, i * i, d * d, p * i, p * d, i * d]
}

/// Quadratic response surface fitted by ridge-regularized least squares.
#[derive(Debug, Clone, Copy)]
struct Surrogate {
    weights: [f64; FEATURE_COUNT],
}

impl Surrogate {
    /// Fit on normalized points via the normal equations.
    fn fit(points: &[([f64; 3], f64)]) -> Option<Self> {
        let mut ata = [[0.0; FEATURE_COUNT]; FEATURE_COUNT];
        let mut aty = [0.0; FEATURE_COUNT];
        for (x, y) in points {
            let f = features(*x);
            for j in 0..FEATURE_COUNT {
                aty[j] += f[j] * y;
                for k in 0..FEATURE_COUNT {
                    ata[j][k] += f[j] * f[k];
                }
            }
        }
        for j in 0..FEATURE_COUNT {
            ata[j][j] += RIDGE;
        }
        solve(ata, aty).map(|weights| Self { weights })
    }

    fn predict(&self, x: [f64; 3]) -> f64 {
        let f = features(x);
        self.weights
            .iter()
            .zip(f.iter())
            .map(|(w, f)| w * f)
            .sum()
    }
}

/// Gaussian elimination with partial pivoting.
fn solve(
    mut a: [[f64; FEATURE_COUNT]; FEATURE_COUNT],
    mut b: [f64; FEATURE_COUNT],
) -> Option<[f64; FEATURE_COUNT]> {
    for col in 0..FEATURE_COUNT {
        let pivot = (col..FEATURE_COUNT).max_by(|&i, &j| {
            a[i][col]
                .abs()
                .partial_cmp(&a[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot][col].abs() < PIVOT_EPS {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..FEATURE_COUNT {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..FEATURE_COUNT {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = [0.0; FEATURE_COUNT];
    for col in (0..FEATURE_COUNT).rev() {
        let mut sum = b[col];
        for k in col + 1..FEATURE_COUNT {
            sum -= a[col][k] * x[k];
        }
        x[col] = sum / a[col][col];
    }
    Some(x)
}

/// Bayesian optimization over the gain space.
///
/// Keeps every evaluated (gains, fitness) pair, fits a quadratic
/// surrogate to the finite-fitness ones, and picks each next candidate
/// by maximizing the acquisition function over a coarse lattice spanning
/// the search space. Until two valid samples exist there is nothing to
/// fit, and candidates fall back to uniform random draws.
pub struct BayesianOptimizer {
    config: BayesConfig,
    samples: Vec<(Gains, f64)>,
    surrogate: Option<Surrogate>,
    iteration: usize,
    best: Option<Candidate>,
}

impl BayesianOptimizer {
    pub fn new(config: BayesConfig) -> Self {
        Self {
            config,
            samples: Vec::new(),
            surrogate: None,
            iteration: 0,
            best: None,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Record an outcome; returns true when it is a new best.
    fn note(&mut self, gains: Gains, fitness: f64) -> bool {
        self.samples.push((gains, fitness));
        if fitness.is_finite() && self.best.map_or(true, |b| fitness < b.fitness) {
            self.best = Some(Candidate { gains, fitness });
            return true;
        }
        false
    }

    fn train(&mut self, space: &SearchSpace) {
        let points: Vec<([f64; 3], f64)> = self
            .samples
            .iter()
            .filter(|(_, fitness)| fitness.is_finite())
            .map(|&(gains, fitness)| (normalize(space, gains), fitness))
            .collect();
        if points.len() < 2 {
            debug!(valid = points.len(), "too few valid samples to fit surrogate");
            return;
        }
        match Surrogate::fit(&points) {
            Some(model) => self.surrogate = Some(model),
            None => warn!("surrogate fit was degenerate; keeping previous model"),
        }
    }

    fn uncertainty(&self, space: &SearchSpace, point: [f64; 3]) -> f64 {
        self.samples
            .iter()
            .map(|&(gains, _)| {
                let x = normalize(space, gains);
                ((x[0] - point[0]).powi(2) + (x[1] - point[1]).powi(2) + (x[2] - point[2]).powi(2))
                    .sqrt()
            })
            .fold(f64::INFINITY, f64::min)
    }

    /// Next candidate: the acquisition maximizer over the lattice, or a
    /// random draw while no surrogate exists.
    fn acquire(&self, ctx: &mut OptimizerContext) -> Gains {
        let Some(surrogate) = &self.surrogate else {
            return ctx.space.sample(&mut ctx.rng, ctx.baseline.ki);
        };
        // A fitted surrogate implies at least one finite sample.
        let best_fitness = self.best.map_or(f64::INFINITY, |b| b.fitness);

        let ki_steps = if ctx.space.search_ki { LATTICE_STEPS } else { 1 };
        let grid = |bounds: GainBounds, index: usize| {
            bounds.lerp(index as f64 / (LATTICE_STEPS - 1) as f64)
        };

        let mut best_score = f64::NEG_INFINITY;
        let mut best_gains = ctx.space.clamp(ctx.baseline, ctx.baseline.ki);
        for pi in 0..LATTICE_STEPS {
            for ii in 0..ki_steps {
                for di in 0..LATTICE_STEPS {
                    let gains = Gains {
                        kp: grid(ctx.space.kp, pi),
                        ki: if ctx.space.search_ki {
                            grid(ctx.space.ki, ii)
                        } else {
                            ctx.baseline.ki
                        },
                        kd: grid(ctx.space.kd, di),
                    };
                    let point = normalize(&ctx.space, gains);
                    let predicted = surrogate.predict(point);
                    let score = match self.config.acquisition {
                        Acquisition::ExpectedImprovement => {
                            (best_fitness - predicted + self.config.xi).max(0.0)
                        }
                        Acquisition::UpperConfidenceBound => {
                            -predicted + UCB_EXPLORATION * self.uncertainty(&ctx.space, point)
                        }
                        Acquisition::ProbabilityOfImprovement => {
                            if predicted < best_fitness - self.config.xi {
                                1.0
                            } else {
                                0.0
                            }
                        }
                    };
                    if score > best_score {
                        best_score = score;
                        best_gains = gains;
                    }
                }
            }
        }
        best_gains
    }
}

#[async_trait]
impl Optimizer for BayesianOptimizer {
    fn name(&self) -> &'static str {
        "bayesian"
    }

    fn budget(&self) -> usize {
        self.config.iterations
    }

    fn best(&self) -> Option<Candidate> {
        self.best
    }

    fn is_done(&self) -> bool {
        self.iteration >= self.config.iterations
    }

    /// Probe the baseline plus `initial_samples` random candidates and
    /// fit the first surrogate.
    async fn initialize(&mut self, ctx: &mut OptimizerContext) -> TuneResult<()> {
        self.samples.clear();
        self.surrogate = None;
        self.iteration = 0;
        self.best = None;

        let mut probes = Vec::with_capacity(self.config.initial_samples + 1);
        probes.push(ctx.space.clamp(ctx.baseline, ctx.baseline.ki));
        for _ in 0..self.config.initial_samples {
            probes.push(ctx.space.sample(&mut ctx.rng, ctx.baseline.ki));
        }

        for gains in probes {
            if ctx.control.is_stopped() {
                return Ok(());
            }
            let fitness = ctx.evaluate(gains).await?;
            if self.note(gains, fitness) {
                info!(gains = %gains, fitness, "new best candidate");
            }
        }
        self.train(&ctx.space);
        debug!(samples = self.samples.len(), "bayesian probing complete");
        Ok(())
    }

    async fn step(&mut self, ctx: &mut OptimizerContext) -> TuneResult<()> {
        if ctx.control.is_stopped() {
            return Ok(());
        }
        let gains = self.acquire(ctx);
        let fitness = ctx.evaluate(gains).await?;
        if self.note(gains, fitness) {
            info!(
                iteration = self.iteration,
                gains = %gains,
                fitness,
                "new best candidate"
            );
        }
        self.train(&ctx.space);
        self.iteration += 1;
        debug!(iteration = self.iteration, "bayesian iteration complete");
        Ok(())
    }
}
