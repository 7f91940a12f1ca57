use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use async_trait::async_trait;
use tb_types::{config_error, Gains, PidLoop, PlantEvent, Telemetry, TuneError, TuneResult};

use crate::link::{ConnectionStatus, LinkError, LinkResult, RobotLink, CMD_RELAY, CMD_SET_PARAM};

// Linearized inverted-pendulum constants, scaled so the stability
// boundary falls inside the default balance-loop search space.
const GRAVITY_GAIN: f64 = 15.0; // pitch acceleration per degree of tilt, deg/s^2
const MOTOR_GAIN: f64 = 2.0; // correcting acceleration per command unit, deg/s^2
const DAMPING: f64 = 1.5; // passive pitch-rate decay, 1/s
const SPEED_GAIN: f64 = 0.05; // wheel speed response per command unit
const SPEED_LAG: f64 = 0.1; // first-order wheel speed filter coefficient
const INTEGRAL_LIMIT: f64 = 50.0; // anti-windup clamp on the integral term
const RELAY_HYSTERESIS_DEG: f64 = 0.5; // relay switching band; keeps the limit cycle above the noise floor

/// Configuration for the simulated balance robot
#[derive(Debug, Clone)]
pub struct SimRobotConfig {
    /// Physics and telemetry rate in Hz
    pub tick_hz: u32,
    /// Tilt the robot starts at, and is re-righted to after a fall
    pub initial_pitch_deg: f64,
    /// Center-of-gravity offset; leaves a steady-state error for ki to remove
    pub cg_offset_deg: f64,
    /// Measurement noise amplitude on reported pitch, degrees
    pub noise_deg: f64,
    /// Pitch magnitude beyond which the robot falls
    pub fall_limit_deg: f64,
    /// Relay output flips before the plant signals relay completion
    pub relay_switch_limit: u32,
    /// Broadcast buffer size for plant events
    pub channel_capacity: usize,
    /// Fixed noise seed; None draws from entropy
    pub seed: Option<u64>,
}

impl Default for SimRobotConfig {
    fn default() -> Self {
        Self {
            tick_hz: 50,
            initial_pitch_deg: 2.0,
            cg_offset_deg: 0.5,
            noise_deg: 0.02,
            fall_limit_deg: 35.0,
            relay_switch_limit: 16,
            channel_capacity: 512,
            seed: None,
        }
    }
}

impl SimRobotConfig {
    /// Check the rate and physical limits before they reach the physics
    /// task.
    pub fn validate(&self) -> TuneResult<()> {
        if self.tick_hz == 0 {
            return Err(config_error!("tick rate must be positive"));
        }
        if !self.fall_limit_deg.is_finite() || self.fall_limit_deg <= 0.0 {
            return Err(config_error!(
                "fall limit must be positive, got {}",
                self.fall_limit_deg
            ));
        }
        if !self.initial_pitch_deg.is_finite()
            || self.initial_pitch_deg.abs() >= self.fall_limit_deg
        {
            return Err(config_error!(
                "initial pitch {} is at or past the fall limit {}",
                self.initial_pitch_deg,
                self.fall_limit_deg
            ));
        }
        if !self.cg_offset_deg.is_finite() {
            return Err(config_error!("cg offset must be finite"));
        }
        if !self.noise_deg.is_finite() || self.noise_deg < 0.0 {
            return Err(config_error!("noise amplitude must be non-negative"));
        }
        if self.relay_switch_limit == 0 {
            return Err(config_error!("relay switch limit must be positive"));
        }
        if self.channel_capacity == 0 {
            return Err(config_error!("channel capacity must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct PlantState {
    params: HashMap<String, f64>,
    pitch_deg: f64,
    pitch_rate: f64,
    speed: f64,
    integral: f64,
    prev_error: f64,
    relay_on: bool,
    relay_amplitude: f64,
    relay_sign: f64,
    relay_switches: u32,
    uptime_ms: u64,
}

impl PlantState {
    fn new(config: &SimRobotConfig) -> Self {
        let mut params = HashMap::new();
        // Factory gains for the balance loop; other loops read as zero
        // until the host sets them.
        params.insert("kp_b".to_string(), 40.0);
        params.insert("ki_b".to_string(), 5.0);
        params.insert("kd_b".to_string(), 2.0);
        Self {
            params,
            pitch_deg: config.initial_pitch_deg,
            pitch_rate: 0.0,
            speed: 0.0,
            integral: 0.0,
            prev_error: config.initial_pitch_deg,
            relay_on: false,
            relay_amplitude: 0.0,
            relay_sign: 0.0,
            relay_switches: 0,
            uptime_ms: 0,
        }
    }

    fn param(&self, id: &str) -> f64 {
        self.params.get(id).copied().unwrap_or(0.0)
    }

    fn re_right(&mut self, config: &SimRobotConfig) {
        self.pitch_deg = config.initial_pitch_deg;
        self.pitch_rate = 0.0;
        self.speed = 0.0;
        self.integral = 0.0;
        self.prev_error = config.initial_pitch_deg;
    }
}

/// Simulated self-balancing robot behind the [`RobotLink`] interface.
///
/// Runs a linearized inverted-pendulum model with a PID balance loop at
/// `tick_hz`, streaming telemetry exactly like the firmware would. Only
/// the balance loop drives the dynamics; speed and position parameters
/// are accepted and stored but inert. Supports relay (bang-bang) drive
/// for ultimate-gain experiments and raises an emergency event when the
/// pitch passes the fall limit, after which the rig re-rights it.
#[derive(Debug)]
pub struct SimRobot {
    state: Arc<Mutex<PlantState>>,
    tx: broadcast::Sender<PlantEvent>,
    running: Arc<AtomicBool>,
}

impl SimRobot {
    /// Validate the configuration, then start a simulated robot and its
    /// physics task.
    pub fn spawn(config: SimRobotConfig) -> TuneResult<Self> {
        config.validate()?;
        Ok(Self::spawn_inner(config))
    }

    pub fn with_defaults() -> Self {
        Self::spawn_inner(SimRobotConfig::default())
    }

    fn spawn_inner(config: SimRobotConfig) -> Self {
        let (tx, _) = broadcast::channel(config.channel_capacity);
        let state = Arc::new(Mutex::new(PlantState::new(&config)));
        let running = Arc::new(AtomicBool::new(true));

        info!(
            tick_hz = config.tick_hz,
            fall_limit_deg = config.fall_limit_deg,
            "simulated robot started"
        );
        let task_state = Arc::clone(&state);
        let task_tx = tx.clone();
        let task_running = Arc::clone(&running);
        tokio::spawn(async move {
            run_plant(config, task_state, task_tx, task_running).await;
        });

        Self { state, tx, running }
    }

    /// Gains currently loaded for one control loop.
    pub fn gains(&self, pid_loop: PidLoop) -> Gains {
        let [kp_id, ki_id, kd_id] = pid_loop.param_ids();
        let state = self.state.lock();
        Gains::new(state.param(kp_id), state.param(ki_id), state.param(kd_id))
    }

    /// True pitch of the simulated plant, without measurement noise.
    pub fn pitch_deg(&self) -> f64 {
        self.state.lock().pitch_deg
    }

    pub fn is_relay_on(&self) -> bool {
        self.state.lock().relay_on
    }

    /// Stop the physics task. The event stream ends shortly after.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for SimRobot {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl RobotLink for SimRobot {
    async fn send_command(&self, kind: &str, payload: serde_json::Value) -> LinkResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        match kind {
            CMD_SET_PARAM => {
                let id = payload
                    .get("id")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| LinkError::CommandRejected {
                        reason: "set_param requires a string id".to_string(),
                    })?;
                let value = payload
                    .get("value")
                    .and_then(serde_json::Value::as_f64)
                    .ok_or_else(|| LinkError::CommandRejected {
                        reason: "set_param requires a numeric value".to_string(),
                    })?;
                self.state.lock().params.insert(id.to_string(), value);
                debug!(id, value, "sim parameter set");
                Ok(())
            }
            CMD_RELAY => {
                let enabled = payload
                    .get("enabled")
                    .and_then(serde_json::Value::as_bool)
                    .ok_or_else(|| LinkError::CommandRejected {
                        reason: "relay requires an enabled flag".to_string(),
                    })?;
                let amplitude = payload
                    .get("amplitude")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(0.0);
                let mut state = self.state.lock();
                state.relay_on = enabled;
                state.relay_amplitude = amplitude;
                state.relay_sign = 0.0;
                state.relay_switches = 0;
                debug!(enabled, amplitude, "sim relay drive updated");
                Ok(())
            }
            other => {
                debug!(kind = other, "sim ignoring unknown command");
                Ok(())
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<PlantEvent> {
        self.tx.subscribe()
    }

    fn status(&self) -> ConnectionStatus {
        if self.running.load(Ordering::SeqCst) {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }
}

async fn run_plant(
    config: SimRobotConfig,
    state: Arc<Mutex<PlantState>>,
    tx: broadcast::Sender<PlantEvent>,
    running: Arc<AtomicBool>,
) {
    let mut rng = match config.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    };
    let dt = 1.0 / config.tick_hz as f64;
    let tick_ms = (1000 / config.tick_hz.max(1)) as u64;
    let mut ticker = interval(Duration::from_millis(tick_ms.max(1)));

    loop {
        ticker.tick().await;
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let (telemetry, extra) = {
            let mut plant = state.lock();
            step_plant(&mut plant, &config, dt, tick_ms, &mut rng)
        };
        let _ = tx.send(PlantEvent::Telemetry(telemetry));
        if let Some(event) = extra {
            if event.is_emergency() {
                warn!("sim robot fell; emergency raised and rig re-righted it");
            }
            let _ = tx.send(event);
        }
    }
    debug!("sim physics task stopped");
}

fn step_plant(
    plant: &mut PlantState,
    config: &SimRobotConfig,
    dt: f64,
    tick_ms: u64,
    rng: &mut ChaCha8Rng,
) -> (Telemetry, Option<PlantEvent>) {
    // Control output: relay drive overrides the PID when enabled.
    let control = if plant.relay_on {
        // Bang-bang with a hysteresis band on the switching threshold.
        let sign = if plant.relay_sign == 0.0 {
            if plant.pitch_deg >= 0.0 {
                1.0
            } else {
                -1.0
            }
        } else if plant.relay_sign > 0.0 && plant.pitch_deg < -RELAY_HYSTERESIS_DEG {
            -1.0
        } else if plant.relay_sign < 0.0 && plant.pitch_deg > RELAY_HYSTERESIS_DEG {
            1.0
        } else {
            plant.relay_sign
        };
        if plant.relay_sign != 0.0 && sign != plant.relay_sign {
            plant.relay_switches += 1;
        }
        plant.relay_sign = sign;
        sign * plant.relay_amplitude
    } else {
        let error = plant.pitch_deg;
        plant.integral = (plant.integral + error * dt).clamp(-INTEGRAL_LIMIT, INTEGRAL_LIMIT);
        let derivative = (error - plant.prev_error) / dt;
        plant.prev_error = error;
        plant.param("kp_b") * error + plant.param("ki_b") * plant.integral
            + plant.param("kd_b") * derivative
    };

    // Pendulum dynamics with a torque offset from the CG error.
    let tilt = plant.pitch_deg + config.cg_offset_deg;
    plant.pitch_rate +=
        (GRAVITY_GAIN * tilt - MOTOR_GAIN * control - DAMPING * plant.pitch_rate) * dt;
    plant.pitch_deg += plant.pitch_rate * dt;
    plant.speed += SPEED_LAG * (SPEED_GAIN * control - plant.speed);
    plant.uptime_ms += tick_ms;

    let noise = (rng.gen::<f64>() - 0.5) * 2.0 * config.noise_deg;
    let telemetry = Telemetry::new(
        plant.uptime_ms,
        plant.pitch_deg + noise,
        plant.speed,
        tick_ms as f64 * (0.95 + 0.1 * rng.gen::<f64>()),
    );

    let mut extra = None;
    if plant.pitch_deg.abs() > config.fall_limit_deg {
        extra = Some(PlantEvent::Emergency {
            reason: format!("pitch {:.1} deg exceeds fall limit", plant.pitch_deg),
        });
        plant.re_right(config);
    } else if plant.relay_on && plant.relay_switches == config.relay_switch_limit {
        plant.relay_switches += 1;
        extra = Some(PlantEvent::RelayDone);
    }

    (telemetry, extra)
}
