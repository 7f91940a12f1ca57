use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;

use tb_types::{Gains, PidLoop, PlantEvent, TuneError};

/// Command kind for setting one firmware parameter
pub const CMD_SET_PARAM: &str = "set_param";
/// Command kind for toggling relay (bang-bang) drive
pub const CMD_RELAY: &str = "relay";

/// Connection state of a plant link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Errors surfaced by link implementations
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("not connected to plant")]
    NotConnected,

    #[error("command rejected: {reason}")]
    CommandRejected { reason: String },

    #[error("event stream closed")]
    StreamClosed,

    #[error("link failure: {message}")]
    Internal { message: String },
}

/// Result type for link operations
pub type LinkResult<T> = Result<T, LinkError>;

impl From<LinkError> for TuneError {
    fn from(err: LinkError) -> Self {
        TuneError::Link {
            message: err.to_string(),
        }
    }
}

/// Narrow interface between the tuner and a balance robot.
///
/// Everything the tuner does to the plant flows through `send_command`;
/// everything it learns back arrives on the broadcast event stream. The
/// helpers below encode the firmware command shapes so callers never
/// build payloads by hand.
#[async_trait]
pub trait RobotLink: Send + Sync {
    // -- Command path ----------------------------------------------------

    /// Send one fire-and-forget command to the plant.
    async fn send_command(&self, kind: &str, payload: serde_json::Value) -> LinkResult<()>;

    // -- Event path ------------------------------------------------------

    /// Subscribe to the plant's event stream (telemetry, emergencies,
    /// relay completion). Each subscriber gets an independent cursor.
    fn subscribe(&self) -> broadcast::Receiver<PlantEvent>;

    // -- Health ----------------------------------------------------------

    /// Current connection state.
    fn status(&self) -> ConnectionStatus;

    // -- Firmware command helpers ----------------------------------------

    /// Apply a gain triple to one control loop as three parameter-set
    /// commands, in (kp, ki, kd) order.
    async fn apply_gains(&self, pid_loop: PidLoop, gains: Gains) -> LinkResult<()> {
        let [kp_id, ki_id, kd_id] = pid_loop.param_ids();
        for (id, value) in [(kp_id, gains.kp), (ki_id, gains.ki), (kd_id, gains.kd)] {
            self.send_command(CMD_SET_PARAM, json!({ "id": id, "value": value }))
                .await?;
        }
        Ok(())
    }

    /// Enable or disable relay drive at the given command amplitude.
    async fn set_relay(&self, enabled: bool, amplitude: f64) -> LinkResult<()> {
        self.send_command(
            CMD_RELAY,
            json!({ "enabled": enabled, "amplitude": amplitude }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::Value;

    struct RecordingLink {
        sent: Mutex<Vec<(String, Value)>>,
        tx: broadcast::Sender<PlantEvent>,
    }

    impl RecordingLink {
        fn new() -> Self {
            let (tx, _) = broadcast::channel(16);
            Self {
                sent: Mutex::new(Vec::new()),
                tx,
            }
        }
    }

    #[async_trait]
    impl RobotLink for RecordingLink {
        async fn send_command(&self, kind: &str, payload: Value) -> LinkResult<()> {
            self.sent.lock().push((kind.to_string(), payload));
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<PlantEvent> {
            self.tx.subscribe()
        }

        fn status(&self) -> ConnectionStatus {
            ConnectionStatus::Connected
        }
    }

    #[tokio::test]
    async fn test_apply_gains_sends_three_param_commands() {
        let link = RecordingLink::new();
        link.apply_gains(PidLoop::Balance, Gains::new(40.0, 5.0, 2.0))
            .await
            .unwrap();

        let sent = link.sent.lock();
        assert_eq!(sent.len(), 3);
        for (kind, _) in sent.iter() {
            assert_eq!(kind, CMD_SET_PARAM);
        }
        assert_eq!(sent[0].1["id"], "kp_b");
        assert_eq!(sent[0].1["value"], 40.0);
        assert_eq!(sent[1].1["id"], "ki_b");
        assert_eq!(sent[1].1["value"], 5.0);
        assert_eq!(sent[2].1["id"], "kd_b");
        assert_eq!(sent[2].1["value"], 2.0);
    }

    #[tokio::test]
    async fn test_apply_gains_uses_loop_param_ids() {
        let link = RecordingLink::new();
        link.apply_gains(PidLoop::Speed, Gains::zero())
            .await
            .unwrap();

        let sent = link.sent.lock();
        assert_eq!(sent[0].1["id"], "kp_s");
        assert_eq!(sent[1].1["id"], "ki_s");
        assert_eq!(sent[2].1["id"], "kd_s");
    }

    #[tokio::test]
    async fn test_set_relay_payload() {
        let link = RecordingLink::new();
        link.set_relay(true, 30.0).await.unwrap();
        link.set_relay(false, 0.0).await.unwrap();

        let sent = link.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, CMD_RELAY);
        assert_eq!(sent[0].1["enabled"], true);
        assert_eq!(sent[0].1["amplitude"], 30.0);
        assert_eq!(sent[1].1["enabled"], false);
    }

    #[test]
    fn test_link_error_converts_to_tune_error() {
        let err: TuneError = LinkError::NotConnected.into();
        match err {
            TuneError::Link { message } => assert_eq!(message, "not connected to plant"),
            other => panic!("unexpected error: {other}"),
        }

        let err: TuneError = LinkError::CommandRejected {
            reason: "bad payload".to_string(),
        }
        .into();
        assert!(err.to_string().contains("bad payload"));
    }
}
