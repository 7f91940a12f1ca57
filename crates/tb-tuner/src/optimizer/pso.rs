use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tb_types::{config_error, Gains, TuneError, TuneResult};

use crate::optimizer::{Candidate, Optimizer, OptimizerContext};

/// Velocity is clamped to this fraction of each dimension's range
const VELOCITY_LIMIT_FRACTION: f64 = 0.2;

/// Particle swarm parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PsoConfig {
    pub swarm_size: usize,
    pub iterations: usize,
    /// Velocity carry-over (w)
    pub inertia: f64,
    /// Pull toward each particle's own best (c1)
    pub cognitive: f64,
    /// Pull toward the swarm's best (c2)
    pub social: f64,
}

impl Default for PsoConfig {
    fn default() -> Self {
        Self {
            swarm_size: 15,
            iterations: 15,
            inertia: 0.7,
            cognitive: 1.5,
            social: 1.5,
        }
    }
}

impl PsoConfig {
    pub fn validate(&self) -> TuneResult<()> {
        if self.swarm_size == 0 {
            return Err(config_error!("swarm size must be positive"));
        }
        if self.iterations == 0 {
            return Err(config_error!("iteration count must be positive"));
        }
        for (name, value) in [
            ("inertia", self.inertia),
            ("cognitive", self.cognitive),
            ("social", self.social),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(config_error!(
                    "{} coefficient must be finite and non-negative, got {}",
                    name,
                    value
                ));
            }
        }
        Ok(())
    }
}

/// One swarm member: current position with its score, velocity, and the
/// best position this particle has visited.
#[derive(Debug, Clone, Copy)]
pub struct Particle {
    pub current: Candidate,
    /// Per-dimension velocity, stored as a gain triple
    pub velocity: Gains,
    pub best: Candidate,
}

impl Particle {
    fn at(gains: Gains) -> Self {
        let candidate = Candidate::new(gains);
        Self {
            current: candidate,
            velocity: Gains::zero(),
            best: candidate,
        }
    }
}

/// Swarm search: particles drift under inertia plus pulls toward their
/// personal best and the swarm best, clamped to the space each move.
/// One `step` scores any moved particles, updates the bests, and moves
/// the swarm.
pub struct ParticleSwarm {
    config: PsoConfig,
    particles: Vec<Particle>,
    iteration: usize,
    best: Option<Candidate>,
}

impl ParticleSwarm {
    pub fn new(config: PsoConfig) -> Self {
        Self {
            config,
            particles: Vec::new(),
            iteration: 0,
            best: None,
        }
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }
}

#[async_trait]
impl Optimizer for ParticleSwarm {
    fn name(&self) -> &'static str {
        "particle_swarm"
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

    async fn initialize(&mut self, ctx: &mut OptimizerContext) -> TuneResult<()> {
        self.iteration = 0;
        self.best = None;
        self.particles = Vec::with_capacity(self.config.swarm_size);
        // Particle zero starts on the baseline; all velocities start at
        // zero so the first iteration scores the seeded positions.
        self.particles.push(Particle::at(
            ctx.space.clamp(ctx.baseline, ctx.baseline.ki),
        ));
        while self.particles.len() < self.config.swarm_size {
            let gains = ctx.space.sample(&mut ctx.rng, ctx.baseline.ki);
            self.particles.push(Particle::at(gains));
        }
        debug!(
            swarm = self.particles.len(),
            iterations = self.config.iterations,
            "swarm initialized"
        );
        Ok(())
    }

    async fn step(&mut self, ctx: &mut OptimizerContext) -> TuneResult<()> {
        // Score particles that moved since the last iteration.
        for i in 0..self.particles.len() {
            if ctx.control.is_stopped() {
                return Ok(());
            }
            if !self.particles[i].current.is_evaluated() {
                let fitness = ctx.evaluate(self.particles[i].current.gains).await?;
                self.particles[i].current.fitness = fitness;
            }
            let current = self.particles[i].current;
            if current.fitness < self.particles[i].best.fitness {
                self.particles[i].best = current;
            }
            if current.is_evaluated() && self.best.map_or(true, |g| current.fitness < g.fitness) {
                info!(
                    iteration = self.iteration,
                    fitness = current.fitness,
                    kp = current.gains.kp,
                    ki = current.gains.ki,
                    kd = current.gains.kd,
                    "new swarm best"
                );
                self.best = Some(current);
            }
        }
        if ctx.control.is_stopped() {
            return Ok(());
        }

        // Without a finite swarm best there is nothing to steer toward;
        // hold positions and rescore next iteration.
        let Some(swarm_best) = self.best else {
            self.iteration += 1;
            return Ok(());
        };

        let limits = Gains::new(
            ctx.space.kp.range() * VELOCITY_LIMIT_FRACTION,
            ctx.space.ki.range() * VELOCITY_LIMIT_FRACTION,
            ctx.space.kd.range() * VELOCITY_LIMIT_FRACTION,
        );
        for particle in &mut self.particles {
            let r1: f64 = ctx.rng.gen();
            let r2: f64 = ctx.rng.gen();
            let w = self.config.inertia;
            let c1 = self.config.cognitive;
            let c2 = self.config.social;
            let pbest = particle.best.gains;
            let gbest = swarm_best.gains;
            let position = particle.current.gains;

            particle.velocity.kp = (w * particle.velocity.kp
                + c1 * r1 * (pbest.kp - position.kp)
                + c2 * r2 * (gbest.kp - position.kp))
                .clamp(-limits.kp, limits.kp);
            particle.velocity.kd = (w * particle.velocity.kd
                + c1 * r1 * (pbest.kd - position.kd)
                + c2 * r2 * (gbest.kd - position.kd))
                .clamp(-limits.kd, limits.kd);
            particle.velocity.ki = if ctx.space.search_ki {
                (w * particle.velocity.ki
                    + c1 * r1 * (pbest.ki - position.ki)
                    + c2 * r2 * (gbest.ki - position.ki))
                    .clamp(-limits.ki, limits.ki)
            } else {
                0.0
            };

            let moved = Gains::new(
                position.kp + particle.velocity.kp,
                position.ki + particle.velocity.ki,
                position.kd + particle.velocity.kd,
            );
            particle.current = Candidate::new(ctx.space.clamp(moved, ctx.baseline.ki));
        }
        self.iteration += 1;
        debug!(iteration = self.iteration, "swarm iteration complete");
        Ok(())
    }
}
