use thiserror::Error;

/// Top-level error type for the TiltBench tuning stack
#[derive(Error, Debug)]
pub enum TuneError {
    #[error("Trial timed out after {timeout_ms} ms without completing")]
    TrialTimeout { timeout_ms: u64 },

    #[error("Insufficient telemetry: collected {got} samples, need {need}")]
    InsufficientData { got: usize, need: usize },

    #[error("Emergency interrupt from plant: {reason}")]
    EmergencyInterrupt { reason: String },

    #[error("Relay experiment failed: {reason}")]
    RelayFailed { reason: String },

    #[error("Link error: {message}")]
    Link { message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TuneError {
    /// True for failures of a single trial that degrade the candidate's
    /// fitness instead of aborting the whole run.
    pub fn is_trial_local(&self) -> bool {
        matches!(
            self,
            TuneError::TrialTimeout { .. } | TuneError::InsufficientData { .. }
        )
    }
}

/// Result type alias for tuning operations
pub type TuneResult<T> = Result<T, TuneError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        TuneError::Config(format!($($arg)*))
    };
}

/// Macro for creating session errors
#[macro_export]
macro_rules! session_error {
    ($($arg:tt)*) => {
        TuneError::Session(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        TuneError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TuneError::TrialTimeout { timeout_ms: 4600 };
        assert_eq!(
            err.to_string(),
            "Trial timed out after 4600 ms without completing"
        );

        let err = TuneError::InsufficientData { got: 3, need: 5 };
        assert_eq!(
            err.to_string(),
            "Insufficient telemetry: collected 3 samples, need 5"
        );

        let err = TuneError::EmergencyInterrupt {
            reason: "fall detected".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Emergency interrupt from plant: fall detected"
        );
    }

    #[test]
    fn test_error_macros() {
        let err = config_error!("population size must be positive, got {}", 0);
        assert!(matches!(err, TuneError::Config(_)));
        assert_eq!(
            err.to_string(),
            "Configuration error: population size must be positive, got 0"
        );

        let err = session_error!("session is not running");
        assert!(matches!(err, TuneError::Session(_)));

        let err = internal_error!("optimizer state out of sync");
        assert!(matches!(err, TuneError::Internal(_)));
    }

    #[test]
    fn test_trial_local_classification() {
        assert!(TuneError::TrialTimeout { timeout_ms: 1 }.is_trial_local());
        assert!(TuneError::InsufficientData { got: 0, need: 5 }.is_trial_local());
        assert!(!TuneError::EmergencyInterrupt {
            reason: "fall".to_string()
        }
        .is_trial_local());
        assert!(!TuneError::Config("bad".to_string()).is_trial_local());
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("not json");
        let err: TuneError = parse.unwrap_err().into();
        assert!(matches!(err, TuneError::Serialization(_)));
    }
}
