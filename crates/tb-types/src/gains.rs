use serde::{Deserialize, Serialize};
use std::fmt;

/// One PID gain triple (proportional, integral, derivative)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Gains {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// Returns true if every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.kp.is_finite() && self.ki.is_finite() && self.kd.is_finite()
    }

    /// Component-wise copy with the integral gain replaced.
    pub fn with_ki(mut self, ki: f64) -> Self {
        self.ki = ki;
        self
    }
}

impl fmt::Display for Gains {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kp={:.3} ki={:.3} kd={:.3}",
            self.kp, self.ki, self.kd
        )
    }
}

/// Control loops exposed by the balance firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PidLoop {
    Balance,
    Speed,
    Position,
}

impl PidLoop {
    /// Firmware parameter identifiers for (kp, ki, kd) of this loop.
    pub fn param_ids(&self) -> [&'static str; 3] {
        match self {
            PidLoop::Balance => ["kp_b", "ki_b", "kd_b"],
            PidLoop::Speed => ["kp_s", "ki_s", "kd_s"],
            PidLoop::Position => ["kp_p", "ki_p", "kd_p"],
        }
    }
}

impl fmt::Display for PidLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PidLoop::Balance => "balance",
            PidLoop::Speed => "speed",
            PidLoop::Position => "position",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gains_constructors() {
        let g = Gains::new(40.0, 5.0, 2.0);
        assert_eq!(g.kp, 40.0);
        assert_eq!(g.ki, 5.0);
        assert_eq!(g.kd, 2.0);
        assert!(g.is_finite());

        let z = Gains::zero();
        assert_eq!(z, Gains::new(0.0, 0.0, 0.0));

        let held = g.with_ki(0.0);
        assert_eq!(held.kp, 40.0);
        assert_eq!(held.ki, 0.0);
    }

    #[test]
    fn test_gains_finite_check() {
        assert!(!Gains::new(f64::NAN, 0.0, 0.0).is_finite());
        assert!(!Gains::new(0.0, f64::INFINITY, 0.0).is_finite());
    }

    #[test]
    fn test_param_ids_per_loop() {
        assert_eq!(PidLoop::Balance.param_ids(), ["kp_b", "ki_b", "kd_b"]);
        assert_eq!(PidLoop::Speed.param_ids(), ["kp_s", "ki_s", "kd_s"]);
        assert_eq!(PidLoop::Position.param_ids(), ["kp_p", "ki_p", "kd_p"]);
    }

    #[test]
    fn test_display_formats() {
        let g = Gains::new(40.0, 5.0, 2.125);
        assert_eq!(g.to_string(), "kp=40.000 ki=5.000 kd=2.125");
        assert_eq!(PidLoop::Balance.to_string(), "balance");
    }

    #[test]
    fn test_gains_serde_round_trip() {
        let g = Gains::new(12.5, 0.25, 1.0);
        let json = serde_json::to_string(&g).unwrap();
        let back: Gains = serde_json::from_str(&json).unwrap();
        assert_eq!(g, back);
    }
}
