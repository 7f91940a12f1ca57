use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use tb_link::{SimRobot, SimRobotConfig};
use tb_tuner::{
    AlgorithmConfig, GaConfig, GainBounds, SearchSpace, TrialConfig, TunerConfig, TuningSession,
};
use tb_types::PidLoop;

/// Runs a genetic-algorithm tuning session against the simulated robot
/// and logs the winning gains.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let seed = std::env::var("TILTBENCH_SEED")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(42);

    let robot = Arc::new(SimRobot::spawn(SimRobotConfig {
        seed: Some(seed),
        ..SimRobotConfig::default()
    })?);
    let baseline = robot.gains(PidLoop::Balance);
    info!(baseline = %baseline, "tuning the balance loop from factory gains");

    // Bounds chosen so every candidate keeps the simulated robot
    // upright; widen them when chasing aggressive gains.
    let config = TunerConfig::default()
        .with_space(SearchSpace::new(
            GainBounds::new(25.0, 80.0),
            GainBounds::new(0.0, 6.0),
            GainBounds::new(0.0, 10.0),
        ))
        .with_trial(
            TrialConfig::default()
                .with_settling_ms(200)
                .with_duration_ms(1000),
        )
        .with_algorithm(AlgorithmConfig::Ga(GaConfig {
            population_size: 6,
            generations: 3,
            ..GaConfig::default()
        }))
        .with_seed(seed);

    let session = TuningSession::new(robot.clone(), config, baseline);
    session.start()?;

    let status = session.wait().await;
    match status.best {
        Some(best) => info!(
            gains = %best.gains,
            fitness = best.fitness,
            trials = status.trials,
            "tuning finished"
        ),
        None => info!(
            trials = status.trials,
            "tuning finished without a usable candidate"
        ),
    }

    robot.shutdown();
    Ok(())
}
