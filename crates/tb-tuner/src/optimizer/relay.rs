use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, info, warn};

use tb_link::RobotLink;
use tb_types::{config_error, Gains, PlantEvent, TuneError, TuneResult};

use crate::optimizer::{Candidate, Optimizer, OptimizerContext};

/// Extrema closer together than this are the same one (debounce)
const DEBOUNCE_S: f64 = 0.1;

// Classic Ziegler-Nichols PID factors from the ultimate gain and period.
const ZN_KP_FACTOR: f64 = 0.6;
const ZN_KI_FACTOR: f64 = 1.2;
const ZN_KD_FACTOR: f64 = 0.075;

/// Relay experiment parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Bang-bang drive amplitude in command units
    pub amplitude: f64,
    /// Full oscillation cycles to observe before identifying
    pub min_cycles: usize,
    /// Hard limit on the experiment
    pub timeout_s: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            amplitude: 30.0,
            min_cycles: 3,
            timeout_s: 30,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> TuneResult<()> {
        if !self.amplitude.is_finite() || self.amplitude <= 0.0 {
            return Err(config_error!(
                "relay amplitude must be positive, got {}",
                self.amplitude
            ));
        }
        if self.min_cycles < 2 {
            return Err(config_error!(
                "relay identification needs at least 2 cycles, got {}",
                self.min_cycles
            ));
        }
        if self.timeout_s == 0 {
            return Err(config_error!("relay timeout must be positive"));
        }
        Ok(())
    }
}

/// Collects (time, angle) points and finds oscillation extrema.
///
/// A sample is a peak when it exceeds both neighbors, a valley when it
/// is below both; extrema within the debounce window of the previous
/// one of the same kind are dropped.
#[derive(Debug, Default)]
struct OscillationProbe {
    points: Vec<(f64, f64)>,
    peaks: Vec<(f64, f64)>,
    valleys: Vec<(f64, f64)>,
}

impl OscillationProbe {
    fn push(&mut self, t_s: f64, angle_deg: f64) {
        self.points.push((t_s, angle_deg));
        let n = self.points.len();
        if n < 3 {
            return;
        }
        let (_, before) = self.points[n - 3];
        let (t_mid, mid) = self.points[n - 2];
        let (_, after) = self.points[n - 1];
        if mid > before && mid > after {
            if self
                .peaks
                .last()
                .map_or(true, |&(t_prev, _)| t_mid - t_prev >= DEBOUNCE_S)
            {
                self.peaks.push((t_mid, mid));
                debug!(t = t_mid, angle = mid, "relay peak");
            }
        } else if mid < before && mid < after {
            if self
                .valleys
                .last()
                .map_or(true, |&(t_prev, _)| t_mid - t_prev >= DEBOUNCE_S)
            {
                self.valleys.push((t_mid, mid));
                debug!(t = t_mid, angle = mid, "relay valley");
            }
        }
    }

    fn cycles_complete(&self, min_cycles: usize) -> bool {
        self.peaks.len() >= min_cycles && self.valleys.len() >= min_cycles
    }

    /// Ultimate gain and period from the recorded extrema.
    fn identify(&self, drive_amplitude: f64, min_cycles: usize) -> TuneResult<(f64, f64)> {
        if self.peaks.len() < 2 || self.valleys.len() < 2 {
            return Err(TuneError::RelayFailed {
                reason: format!(
                    "too few oscillation cycles: {} peaks, {} valleys",
                    self.peaks.len(),
                    self.valleys.len()
                ),
            });
        }
        let high = tail_mean(&self.peaks, min_cycles);
        let low = tail_mean(&self.valleys, min_cycles);
        let amplitude = (high - low) / 2.0;
        if amplitude <= 0.0 {
            return Err(TuneError::RelayFailed {
                reason: "degenerate oscillation amplitude".to_string(),
            });
        }
        let ku = 4.0 * drive_amplitude / (PI * amplitude);
        let tu = self
            .peaks
            .windows(2)
            .map(|pair| pair[1].0 - pair[0].0)
            .sum::<f64>()
            / (self.peaks.len() - 1) as f64;
        if tu <= 0.0 {
            return Err(TuneError::RelayFailed {
                reason: "degenerate oscillation period".to_string(),
            });
        }
        Ok((ku, tu))
    }
}

/// Mean of the last `count` extremum values.
fn tail_mean(extrema: &[(f64, f64)], count: usize) -> f64 {
    let take = count.min(extrema.len()).max(1);
    extrema[extrema.len() - take..]
        .iter()
        .map(|&(_, value)| value)
        .sum::<f64>()
        / take as f64
}

fn zn_gains(ku: f64, tu: f64) -> Gains {
    Gains::new(
        ZN_KP_FACTOR * ku,
        ZN_KI_FACTOR * ku / tu,
        ZN_KD_FACTOR * ku * tu,
    )
}

/// Relay (ultimate gain) tuner.
///
/// Drives the plant bang-bang to provoke a sustained oscillation,
/// measures its amplitude and period, maps them through the
/// Ziegler-Nichols rules, and scores the mapped gains with one
/// verification trial. The whole experiment is a single step.
pub struct RelayTuner {
    config: RelayConfig,
    link: Arc<dyn RobotLink>,
    probe: OscillationProbe,
    result: Option<Candidate>,
    done: bool,
}

impl RelayTuner {
    pub fn new(config: RelayConfig, link: Arc<dyn RobotLink>) -> Self {
        Self {
            config,
            link,
            probe: OscillationProbe::default(),
            result: None,
            done: false,
        }
    }

    async fn collect(&mut self, rx: &mut broadcast::Receiver<PlantEvent>) -> TuneResult<()> {
        let start = Instant::now();
        let deadline = start + Duration::from_secs(self.config.timeout_s);
        loop {
            match timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    return Err(TuneError::RelayFailed {
                        reason: format!(
                            "timed out after {}s with {} peaks, {} valleys",
                            self.config.timeout_s,
                            self.probe.peaks.len(),
                            self.probe.valleys.len()
                        ),
                    });
                }
                Ok(Ok(PlantEvent::Telemetry(frame))) => {
                    self.probe
                        .push(start.elapsed().as_secs_f64(), frame.pitch_deg);
                    if self.probe.cycles_complete(self.config.min_cycles) {
                        return Ok(());
                    }
                }
                Ok(Ok(PlantEvent::RelayDone)) => {
                    debug!("plant signalled relay completion");
                    return Ok(());
                }
                Ok(Ok(PlantEvent::Emergency { reason })) => {
                    return Err(TuneError::RelayFailed {
                        reason: format!("emergency during relay experiment: {reason}"),
                    });
                }
                Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    warn!(missed, "telemetry receiver lagged during relay experiment");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(TuneError::Link {
                        message: "plant event stream closed during relay experiment".to_string(),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl Optimizer for RelayTuner {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn budget(&self) -> usize {
        1
    }

    fn best(&self) -> Option<Candidate> {
        self.result
    }

    fn is_done(&self) -> bool {
        self.done
    }

    async fn initialize(&mut self, _ctx: &mut OptimizerContext) -> TuneResult<()> {
        self.probe = OscillationProbe::default();
        self.result = None;
        self.done = false;
        Ok(())
    }

    async fn step(&mut self, ctx: &mut OptimizerContext) -> TuneResult<()> {
        let mut rx = self.link.subscribe();
        self.link
            .set_relay(true, self.config.amplitude)
            .await
            .map_err(TuneError::from)?;
        info!(
            amplitude = self.config.amplitude,
            min_cycles = self.config.min_cycles,
            "relay experiment started"
        );

        let collected = self.collect(&mut rx).await;

        // Relay off and baseline back on the plant before results are
        // even looked at.
        let relay_off = self.link.set_relay(false, 0.0).await.map_err(TuneError::from);
        let restored = ctx.evaluator.apply_gains(ctx.baseline).await;
        collected?;
        relay_off?;
        restored?;

        let (ku, tu) = self
            .probe
            .identify(self.config.amplitude, self.config.min_cycles)?;
        let gains = ctx.space.clamp(zn_gains(ku, tu), ctx.baseline.ki);
        info!(
            ku,
            tu,
            kp = gains.kp,
            ki = gains.ki,
            kd = gains.kd,
            "ultimate gain identified"
        );

        // One verification trial scores the mapped gains.
        let fitness = ctx.evaluate(gains).await?;
        self.result = Some(Candidate { gains, fitness });
        self.done = true;
        Ok(())
    }
}
