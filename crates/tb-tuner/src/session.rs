use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tb_link::RobotLink;
use tb_types::{session_error, Gains, PidLoop, TuneError, TuneResult};

use crate::config::TunerConfig;
use crate::control::RunControl;
use crate::optimizer::{Candidate, Optimizer, OptimizerContext};
use crate::trial::{TrialRecord, TrialRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SessionEnd {
    Completed,
    Stopped,
    Failed { message: String },
}

/// One progress report, emitted after each optimizer step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub step: usize,
    pub total: usize,
    pub best: Option<Candidate>,
}

/// Snapshot of a session for host polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub id: Uuid,
    pub state: SessionState,
    pub algorithm: String,
    pub step: usize,
    pub budget: usize,
    pub trials: usize,
    pub best: Option<Candidate>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Host-side hooks for progress, trial history, and session end.
/// All callbacks default to no-ops and are invoked from the session
/// task, so implementations must not block.
pub trait TuningObserver: Send + Sync {
    fn on_progress(&self, _progress: &Progress) {}

    fn on_trial(&self, _record: &TrialRecord) {}

    fn on_session_end(&self, _end: &SessionEnd) {}
}

/// Observer that ignores every event.
pub struct NullObserver;

impl TuningObserver for NullObserver {}

/// One auto-tuning run against a plant.
///
/// `Idle -> Running -> {Paused <-> Running} -> Stopped`: `start` spawns
/// the optimizer loop, `pause` parks it at the next trial boundary with
/// the baseline gains back on the plant, `stop` cancels any in-flight
/// trial and discards its result. Whatever way the run ends, the relay
/// drive is disabled and the baseline gains are restored. A session is
/// one-shot; a finished session cannot be restarted.
pub struct TuningSession {
    link: Arc<dyn RobotLink>,
    config: TunerConfig,
    baseline: Gains,
    control: RunControl,
    status: Arc<Mutex<SessionStatus>>,
    observer: Arc<dyn TuningObserver>,
    handle: Mutex<Option<JoinHandle<()>>>,
    ended: Arc<AtomicBool>,
}

impl TuningSession {
    /// Session with no observer. `baseline` is the gain set currently on
    /// the plant; it seeds the search and is what every recovery path
    /// restores.
    pub fn new(link: Arc<dyn RobotLink>, config: TunerConfig, baseline: Gains) -> Self {
        Self::with_observer(link, config, baseline, Arc::new(NullObserver))
    }

    pub fn with_observer(
        link: Arc<dyn RobotLink>,
        config: TunerConfig,
        baseline: Gains,
        observer: Arc<dyn TuningObserver>,
    ) -> Self {
        let status = SessionStatus {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            algorithm: config.algorithm.name().to_string(),
            step: 0,
            budget: config.algorithm.budget(),
            trials: 0,
            best: None,
            started_at: None,
            finished_at: None,
            error: None,
        };
        Self {
            link,
            config,
            baseline,
            control: RunControl::new(),
            status: Arc::new(Mutex::new(status)),
            observer,
            handle: Mutex::new(None),
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.status.lock().id
    }

    /// Validate the configuration and spawn the optimizer loop.
    pub fn start(&self) -> TuneResult<()> {
        {
            let status = self.status.lock();
            if status.state != SessionState::Idle {
                return Err(session_error!(
                    "session already started (state {:?})",
                    status.state
                ));
            }
        }
        self.config.validate()?;

        let mut optimizer = self.config.algorithm.build(Arc::clone(&self.link));
        let runner = TrialRunner::new(
            Arc::clone(&self.link),
            self.config.pid_loop,
            self.config.trial,
        );
        let mut ctx = OptimizerContext::new(
            Arc::new(runner),
            self.config.space,
            self.baseline,
            self.control.clone(),
            Arc::clone(&self.observer),
            self.config.seed,
        );

        {
            let mut status = self.status.lock();
            status.state = SessionState::Running;
            status.started_at = Some(Utc::now());
        }
        info!(
            session = %self.id(),
            algorithm = optimizer.name(),
            budget = optimizer.budget(),
            baseline = %self.baseline,
            "tuning session started"
        );

        let status = Arc::clone(&self.status);
        let observer = Arc::clone(&self.observer);
        let control = self.control.clone();
        let link = Arc::clone(&self.link);
        let pid_loop = self.config.pid_loop;
        let baseline = self.baseline;
        let ended = Arc::clone(&self.ended);
        let handle = tokio::spawn(async move {
            let result = drive(optimizer.as_mut(), &mut ctx, &status, observer.as_ref()).await;
            restore_plant(&link, pid_loop, baseline).await;
            // Nothing awaits past this point, so a claimed finalization
            // always runs to completion; an abort landing during the
            // restore above leaves the claim to stop().
            if ended.swap(true, Ordering::SeqCst) {
                return;
            }

            let end = match result {
                Ok(()) if control.is_stopped() => SessionEnd::Stopped,
                Ok(()) => SessionEnd::Completed,
                Err(err) => SessionEnd::Failed {
                    message: err.to_string(),
                },
            };
            {
                let mut status = status.lock();
                status.state = SessionState::Stopped;
                status.finished_at = Some(Utc::now());
                match &end {
                    SessionEnd::Completed => info!(
                        best = ?status.best,
                        trials = status.trials,
                        "tuning session completed"
                    ),
                    SessionEnd::Stopped => info!("tuning session stopped"),
                    SessionEnd::Failed { message } => {
                        status.error = Some(message.clone());
                        error!(error = %message, "tuning session failed");
                    }
                }
            }
            observer.on_session_end(&end);
        });
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Park the run at the next trial boundary and put the baseline
    /// gains back on the plant while it waits.
    pub async fn pause(&self) -> TuneResult<()> {
        if self.status().state != SessionState::Running {
            return Err(session_error!("no running session to pause"));
        }
        self.control.pause();
        self.link
            .apply_gains(self.config.pid_loop, self.baseline)
            .await
            .map_err(TuneError::from)?;
        info!("session paused; baseline gains restored");
        Ok(())
    }

    pub fn resume(&self) -> TuneResult<()> {
        if self.status().state != SessionState::Paused {
            return Err(session_error!("no paused session to resume"));
        }
        self.control.resume();
        info!("session resumed");
        Ok(())
    }

    /// Stop the run from any state. Cancels the in-flight trial (its
    /// result is discarded), disables the relay drive, and restores the
    /// baseline gains.
    pub async fn stop(&self) -> TuneResult<()> {
        self.control.stop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        if self.ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        restore_plant(&self.link, self.config.pid_loop, self.baseline).await;
        {
            let mut status = self.status.lock();
            status.state = SessionState::Stopped;
            status.finished_at = Some(Utc::now());
        }
        self.observer.on_session_end(&SessionEnd::Stopped);
        info!(session = %self.id(), "tuning session stopped");
        Ok(())
    }

    /// Current snapshot. A running session with the pause flag raised
    /// reports `Paused`, which also surfaces emergency pauses.
    pub fn status(&self) -> SessionStatus {
        let mut status = self.status.lock().clone();
        if status.state == SessionState::Running && self.control.is_paused() {
            status.state = SessionState::Paused;
        }
        status
    }

    /// Wait for the optimizer loop to finish and return the final
    /// snapshot.
    pub async fn wait(&self) -> SessionStatus {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.await.is_err() && !self.ended.swap(true, Ordering::SeqCst) {
                // The task can only vanish without finalizing if it
                // panicked; surface that instead of hanging callers.
                let mut status = self.status.lock();
                status.state = SessionState::Stopped;
                status.finished_at = Some(Utc::now());
                status.error = Some("optimizer task aborted".to_string());
            }
        }
        self.status()
    }
}

/// Run the optimizer to completion, publishing progress as it goes.
async fn drive(
    optimizer: &mut dyn Optimizer,
    ctx: &mut OptimizerContext,
    status: &Mutex<SessionStatus>,
    observer: &dyn TuningObserver,
) -> TuneResult<()> {
    optimizer.initialize(ctx).await?;
    let total = optimizer.budget();
    let mut step = 0;
    observer.on_progress(&publish(status, step, total, optimizer.best(), ctx.trial_count()));

    while !optimizer.is_done() {
        if ctx.control.is_stopped() {
            break;
        }
        ctx.control.wait_if_paused().await;
        if ctx.control.is_stopped() {
            break;
        }

        optimizer.step(ctx).await?;
        step += 1;
        let progress = publish(status, step, total, optimizer.best(), ctx.trial_count());
        observer.on_progress(&progress);
        debug!(
            step,
            total,
            trials = ctx.trial_count(),
            "optimizer step complete"
        );
    }
    Ok(())
}

fn publish(
    status: &Mutex<SessionStatus>,
    step: usize,
    total: usize,
    best: Option<Candidate>,
    trials: usize,
) -> Progress {
    let mut snapshot = status.lock();
    snapshot.step = step;
    snapshot.budget = total;
    snapshot.trials = trials;
    snapshot.best = best;
    Progress { step, total, best }
}

/// Leave the plant in a safe state: relay drive off, baseline gains on.
async fn restore_plant(link: &Arc<dyn RobotLink>, pid_loop: PidLoop, baseline: Gains) {
    if let Err(err) = link.set_relay(false, 0.0).await {
        warn!(error = %err, "failed to disable relay drive during restore");
    }
    match link.apply_gains(pid_loop, baseline).await {
        Ok(()) => info!(gains = %baseline, "baseline gains restored"),
        Err(err) => warn!(error = %err, "failed to restore baseline gains"),
    }
}
