use rand::Rng;
use serde::{Deserialize, Serialize};

use tb_types::{config_error, Gains, TuneError, TuneResult};

/// Inclusive bounds for one gain dimension
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainBounds {
    pub min: f64,
    pub max: f64,
}

impl GainBounds {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn range(&self) -> f64 {
        self.max - self.min
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Point at `t` in [0, 1] across the bounds.
    pub fn lerp(&self, t: f64) -> f64 {
        self.min + self.range() * t
    }

    fn validate(&self, name: &str) -> TuneResult<()> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(config_error!("{} bounds must be finite", name));
        }
        if self.min > self.max {
            return Err(config_error!(
                "{} bounds are inverted: min {} > max {}",
                name,
                self.min,
                self.max
            ));
        }
        Ok(())
    }
}

/// Bounded (kp, ki, kd) search region.
///
/// When `search_ki` is false the integral dimension is frozen: sampling
/// and clamping hold ki at the caller-supplied baseline value and the
/// ki bounds are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub kp: GainBounds,
    pub ki: GainBounds,
    pub kd: GainBounds,
    pub search_ki: bool,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            kp: GainBounds::new(10.0, 100.0),
            ki: GainBounds::new(0.0, 20.0),
            kd: GainBounds::new(0.0, 10.0),
            search_ki: true,
        }
    }
}

impl SearchSpace {
    pub fn new(kp: GainBounds, ki: GainBounds, kd: GainBounds) -> Self {
        Self {
            kp,
            ki,
            kd,
            search_ki: true,
        }
    }

    /// Freeze the integral gain at the baseline value.
    pub fn with_fixed_ki(mut self) -> Self {
        self.search_ki = false;
        self
    }

    pub fn validate(&self) -> TuneResult<()> {
        self.kp.validate("kp")?;
        if self.search_ki {
            self.ki.validate("ki")?;
        }
        self.kd.validate("kd")?;
        Ok(())
    }

    /// Draw a uniform random gain triple from the space.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, baseline_ki: f64) -> Gains {
        Gains {
            kp: rng.gen_range(self.kp.min..=self.kp.max),
            ki: if self.search_ki {
                rng.gen_range(self.ki.min..=self.ki.max)
            } else {
                baseline_ki
            },
            kd: rng.gen_range(self.kd.min..=self.kd.max),
        }
    }

    /// Clamp a gain triple into the space.
    pub fn clamp(&self, gains: Gains, baseline_ki: f64) -> Gains {
        Gains {
            kp: self.kp.clamp(gains.kp),
            ki: if self.search_ki {
                self.ki.clamp(gains.ki)
            } else {
                baseline_ki
            },
            kd: self.kd.clamp(gains.kd),
        }
    }

    /// True if the triple lies inside the space. The ki dimension is
    /// only checked when it is being searched.
    pub fn contains(&self, gains: &Gains) -> bool {
        self.kp.contains(gains.kp)
            && (!self.search_ki || self.ki.contains(gains.ki))
            && self.kd.contains(gains.kd)
    }
}
