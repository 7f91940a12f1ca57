use async_trait::async_trait;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, info, warn};

use tb_types::{config_error, Gains, TuneError, TuneResult};

use crate::optimizer::{Candidate, Optimizer, OptimizerContext};
use crate::space::SearchSpace;

/// Mutation steps are drawn from +-5% of each gene's range
const MUTATION_SPAN: f64 = 0.1;
const TOURNAMENT_SIZE: usize = 3;

/// Genetic algorithm parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaConfig {
    pub population_size: usize,
    pub generations: usize,
    /// Per-gene mutation probability
    pub mutation_rate: f64,
    /// Per-pair crossover probability
    pub crossover_rate: f64,
    /// Carry the best candidate into the next generation unchanged
    pub elitism: bool,
}

impl Default for GaConfig {
    fn default() -> Self {
        Self {
            population_size: 20,
            generations: 10,
            mutation_rate: 0.1,
            crossover_rate: 0.7,
            elitism: true,
        }
    }
}

impl GaConfig {
    pub fn validate(&self) -> TuneResult<()> {
        if self.population_size == 0 {
            return Err(config_error!("population size must be positive"));
        }
        if self.generations == 0 {
            return Err(config_error!("generation count must be positive"));
        }
        if !(0.0..=1.0).contains(&self.mutation_rate) {
            return Err(config_error!(
                "mutation rate must be within [0, 1], got {}",
                self.mutation_rate
            ));
        }
        if !(0.0..=1.0).contains(&self.crossover_rate) {
            return Err(config_error!(
                "crossover rate must be within [0, 1], got {}",
                self.crossover_rate
            ));
        }
        Ok(())
    }
}

/// Population-based search with tournament selection, arithmetic
/// crossover, and bounded per-gene mutation. One `step` is one
/// generation: score the unevaluated members, rank, then breed.
pub struct GeneticAlgorithm {
    config: GaConfig,
    population: Vec<Candidate>,
    generation: usize,
    best: Option<Candidate>,
}

impl GeneticAlgorithm {
    pub fn new(config: GaConfig) -> Self {
        Self {
            config,
            population: Vec::new(),
            generation: 0,
            best: None,
        }
    }

    pub fn population(&self) -> &[Candidate] {
        &self.population
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Fresh random population, with the baseline in slot zero so it is
    /// always scored once.
    fn seed_population(config: &GaConfig, ctx: &mut OptimizerContext) -> Vec<Candidate> {
        let mut population = Vec::with_capacity(config.population_size);
        let baseline = ctx.space.clamp(ctx.baseline, ctx.baseline.ki);
        population.push(Candidate::new(baseline));
        while population.len() < config.population_size {
            let gains = ctx.space.sample(&mut ctx.rng, ctx.baseline.ki);
            population.push(Candidate::new(gains));
        }
        population
    }

    fn tournament(&self, rng: &mut ChaCha8Rng) -> Candidate {
        let mut winner = self.population[rng.gen_range(0..self.population.len())];
        for _ in 1..TOURNAMENT_SIZE {
            let challenger = self.population[rng.gen_range(0..self.population.len())];
            if challenger.fitness < winner.fitness {
                winner = challenger;
            }
        }
        winner
    }

    /// Arithmetic blend of two parents with one mixing coefficient per
    /// pair, yielding complementary children.
    fn crossover(
        a: Gains,
        b: Gains,
        alpha: f64,
        space: &SearchSpace,
        baseline_ki: f64,
    ) -> (Gains, Gains) {
        let blend = |x: f64, y: f64| alpha * x + (1.0 - alpha) * y;
        let ki_pair = if space.search_ki {
            (blend(a.ki, b.ki), blend(b.ki, a.ki))
        } else {
            (baseline_ki, baseline_ki)
        };
        (
            Gains::new(blend(a.kp, b.kp), ki_pair.0, blend(a.kd, b.kd)),
            Gains::new(blend(b.kp, a.kp), ki_pair.1, blend(b.kd, a.kd)),
        )
    }

    fn mutate(
        mut gains: Gains,
        rng: &mut ChaCha8Rng,
        rate: f64,
        space: &SearchSpace,
        baseline_ki: f64,
    ) -> Gains {
        if rng.gen::<f64>() < rate {
            let delta = (rng.gen::<f64>() - 0.5) * space.kp.range() * MUTATION_SPAN;
            gains.kp = space.kp.clamp(gains.kp + delta);
        }
        if space.search_ki {
            if rng.gen::<f64>() < rate {
                let delta = (rng.gen::<f64>() - 0.5) * space.ki.range() * MUTATION_SPAN;
                gains.ki = space.ki.clamp(gains.ki + delta);
            }
        } else {
            gains.ki = baseline_ki;
        }
        if rng.gen::<f64>() < rate {
            let delta = (rng.gen::<f64>() - 0.5) * space.kd.range() * MUTATION_SPAN;
            gains.kd = space.kd.clamp(gains.kd + delta);
        }
        gains
    }
}

#[async_trait]
impl Optimizer for GeneticAlgorithm {
    fn name(&self) -> &'static str {
        "genetic"
    }

    fn budget(&self) -> usize {
        self.config.generations
    }

    fn best(&self) -> Option<Candidate> {
        self.best
    }

    fn is_done(&self) -> bool {
        self.generation >= self.config.generations
    }

    async fn initialize(&mut self, ctx: &mut OptimizerContext) -> TuneResult<()> {
        self.generation = 0;
        self.best = None;
        self.population = Self::seed_population(&self.config, ctx);
        debug!(
            population = self.population.len(),
            generations = self.config.generations,
            "genetic search initialized"
        );
        Ok(())
    }

    async fn step(&mut self, ctx: &mut OptimizerContext) -> TuneResult<()> {
        if self.population.is_empty() {
            warn!("population empty at generation start; reseeding");
            self.population = Self::seed_population(&self.config, ctx);
        }

        // Score everything that has not survived from a previous
        // generation with a finite fitness.
        for i in 0..self.population.len() {
            if ctx.control.is_stopped() {
                return Ok(());
            }
            if self.population[i].is_evaluated() {
                continue;
            }
            let fitness = ctx.evaluate(self.population[i].gains).await?;
            self.population[i].fitness = fitness;
        }
        if ctx.control.is_stopped() {
            return Ok(());
        }

        self.population
            .sort_by(|a, b| a.fitness.partial_cmp(&b.fitness).unwrap_or(Ordering::Equal));

        if let Some(front) = self.population.first().copied() {
            if front.is_evaluated() && self.best.map_or(true, |b| front.fitness < b.fitness) {
                info!(
                    generation = self.generation,
                    fitness = front.fitness,
                    kp = front.gains.kp,
                    ki = front.gains.ki,
                    kd = front.gains.kd,
                    "new best candidate"
                );
                self.best = Some(front);
            }
        }

        // Breed the next generation.
        let mut next = Vec::with_capacity(self.config.population_size);
        if self.config.elitism {
            if let Some(front) = self.population.first().copied() {
                next.push(front);
            }
        }
        while next.len() < self.config.population_size {
            let parent_a = self.tournament(&mut ctx.rng);
            let parent_b = self.tournament(&mut ctx.rng);
            let (child_a, child_b) = if ctx.rng.gen::<f64>() < self.config.crossover_rate {
                let alpha = ctx.rng.gen::<f64>();
                Self::crossover(
                    parent_a.gains,
                    parent_b.gains,
                    alpha,
                    &ctx.space,
                    ctx.baseline.ki,
                )
            } else {
                (parent_a.gains, parent_b.gains)
            };
            for child in [child_a, child_b] {
                if next.len() >= self.config.population_size {
                    break;
                }
                let mutated = Self::mutate(
                    child,
                    &mut ctx.rng,
                    self.config.mutation_rate,
                    &ctx.space,
                    ctx.baseline.ki,
                );
                next.push(Candidate::new(ctx.space.clamp(mutated, ctx.baseline.ki)));
            }
        }
        self.population = next;
        self.generation += 1;
        debug!(generation = self.generation, "generation complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::test_support::{test_context, QuadraticEvaluator};
    use crate::space::GainBounds;
    use std::sync::Arc;

    fn small_config() -> GaConfig {
        GaConfig {
            population_size: 4,
            generations: 2,
            mutation_rate: 0.1,
            crossover_rate: 0.7,
            elitism: true,
        }
    }

    fn bowl_space() -> SearchSpace {
        SearchSpace {
            kp: GainBounds::new(10.0, 100.0),
            ki: GainBounds::new(0.0, 1.0),
            kd: GainBounds::new(0.0, 10.0),
            search_ki: true,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(GaConfig::default().validate().is_ok());

        let bad = GaConfig {
            population_size: 0,
            ..GaConfig::default()
        };
        assert!(matches!(bad.validate(), Err(TuneError::Config(_))));

        let bad = GaConfig {
            generations: 0,
            ..GaConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = GaConfig {
            mutation_rate: 1.5,
            ..GaConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_baseline_seeds_first_slot() {
        let evaluator = Arc::new(QuadraticEvaluator::new());
        let mut ctx = test_context(evaluator, 9);
        let mut ga = GeneticAlgorithm::new(small_config());

        ga.initialize(&mut ctx).await.unwrap();
        assert_eq!(ga.population().len(), 4);
        assert_eq!(ga.population()[0].gains, ctx.baseline);
        assert!(ga.population().iter().all(|c| !c.is_evaluated()));
    }

    #[tokio::test]
    async fn test_two_generations_with_elitism_evaluate_seven() {
        let evaluator = Arc::new(QuadraticEvaluator::new());
        let mut ctx = test_context(evaluator.clone(), 42);
        ctx.space = bowl_space();
        ctx.baseline = Gains::new(40.0, 0.5, 2.0);

        let mut ga = GeneticAlgorithm::new(small_config());
        ga.initialize(&mut ctx).await.unwrap();
        let initial_best_distance = ga
            .population()
            .iter()
            .map(|c| (c.gains.kp - 50.0).abs())
            .fold(f64::INFINITY, f64::min);

        ga.step(&mut ctx).await.unwrap();
        ga.step(&mut ctx).await.unwrap();
        assert!(ga.is_done());

        // Four trials in the first generation, three in the second
        // because the elite keeps its score.
        assert_eq!(evaluator.call_count(), 7);

        let best = ga.best().expect("best candidate after two generations");
        assert!(best.is_evaluated());
        assert!((best.gains.kp - 50.0).abs() <= initial_best_distance);
    }

    #[tokio::test]
    async fn test_without_elitism_every_member_is_rescored() {
        let evaluator = Arc::new(QuadraticEvaluator::new());
        let mut ctx = test_context(evaluator.clone(), 42);
        ctx.space = bowl_space();

        let mut ga = GeneticAlgorithm::new(GaConfig {
            elitism: false,
            ..small_config()
        });
        ga.initialize(&mut ctx).await.unwrap();
        ga.step(&mut ctx).await.unwrap();
        ga.step(&mut ctx).await.unwrap();

        assert_eq!(evaluator.call_count(), 8);
    }

    #[tokio::test]
    async fn test_elite_survives_unchanged() {
        let evaluator = Arc::new(QuadraticEvaluator::new());
        let mut ctx = test_context(evaluator, 5);
        let mut ga = GeneticAlgorithm::new(GaConfig {
            population_size: 6,
            generations: 3,
            ..GaConfig::default()
        });

        ga.initialize(&mut ctx).await.unwrap();
        ga.step(&mut ctx).await.unwrap();

        let best = ga.best().unwrap();
        // The elite sits in slot zero of the bred population with its
        // fitness intact.
        assert_eq!(ga.population()[0].gains, best.gains);
        assert_eq!(ga.population()[0].fitness, best.fitness);
        assert!(ga.population()[0].is_evaluated());
    }

    #[tokio::test]
    async fn test_candidates_stay_in_bounds_with_frozen_ki() {
        let evaluator = Arc::new(QuadraticEvaluator::new());
        let mut ctx = test_context(evaluator.clone(), 17);
        ctx.space = bowl_space().with_fixed_ki();
        ctx.baseline = Gains::new(40.0, 5.0, 2.0);

        let mut ga = GeneticAlgorithm::new(GaConfig {
            population_size: 6,
            generations: 3,
            mutation_rate: 0.8,
            ..GaConfig::default()
        });
        ga.initialize(&mut ctx).await.unwrap();
        for _ in 0..3 {
            for candidate in ga.population() {
                assert!(ctx.space.contains(&candidate.gains));
                assert_eq!(candidate.gains.ki, 5.0);
            }
            ga.step(&mut ctx).await.unwrap();
        }
        // Every plant-facing evaluation respected the freeze too.
        for gains in evaluator.evaluated.lock().iter() {
            assert_eq!(gains.ki, 5.0);
        }
    }

    #[tokio::test]
    async fn test_best_fitness_is_monotonic() {
        let evaluator = Arc::new(QuadraticEvaluator::new());
        let mut ctx = test_context(evaluator, 23);
        ctx.space = bowl_space();

        let mut ga = GeneticAlgorithm::new(GaConfig {
            population_size: 5,
            generations: 4,
            ..GaConfig::default()
        });
        ga.initialize(&mut ctx).await.unwrap();

        let mut last_best = f64::INFINITY;
        for _ in 0..4 {
            ga.step(&mut ctx).await.unwrap();
            let best = ga.best().unwrap().fitness;
            assert!(best <= last_best, "best fitness regressed");
            last_best = best;
        }
    }

    #[tokio::test]
    async fn test_empty_population_is_reseeded_before_stepping() {
        let evaluator = Arc::new(QuadraticEvaluator::new());
        let mut ctx = test_context(evaluator.clone(), 2);
        let mut ga = GeneticAlgorithm::new(small_config());

        // Step without initialize: the guard reseeds instead of
        // running a generation over nothing.
        ga.step(&mut ctx).await.unwrap();
        assert_eq!(ga.population().len(), 4);
        assert_eq!(evaluator.call_count(), 4);
    }
}
