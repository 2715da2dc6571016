//! Error types for loadramp

use thiserror::Error;

/// Result type alias for run-level operations
pub type Result<T> = std::result::Result<T, LoadError>;

/// Run-level errors. These are the only errors that end a run; everything
/// that happens inside an iteration is converted into metric samples.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    /// Ramp profile violates one of its invariants
    #[error("Invalid ramp profile: {0}")]
    InvalidProfile(String),

    /// Threshold rule could not be parsed
    #[error("Invalid threshold for metric `{metric}`: {reason}")]
    InvalidThreshold { metric: String, reason: String },

    /// Workload parameters are unusable
    #[error("Invalid workload: {0}")]
    InvalidWorkload(String),

    /// Anything else wrong with the run configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failure of a single broker call or connection attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Could not establish a channel to the broker
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Broker answered with a non-OK status
    #[error("Call returned status {code}: {message}")]
    Status { code: String, message: String },

    /// Transport broke down mid-call
    #[error("Transport error: {0}")]
    Transport(String),

    /// Call did not answer within its deadline
    #[error("Call timed out after {0}ms")]
    Timeout(u64),
}

impl CallError {
    /// Whether the error happened while connecting rather than during an RPC
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Self::Connect(_))
    }

    /// Whether the broker answered with an `Unavailable` status
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Status { code, .. } if code == "Unavailable")
    }

    /// Short label used for error tallies
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Status { .. } => "status",
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LoadError::InvalidThreshold {
            metric: "checks".to_string(),
            reason: "missing operator".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("checks"));
        assert!(msg.contains("missing operator"));
    }

    #[test]
    fn test_connect_classification() {
        assert!(CallError::Connect("refused".into()).is_connect_failure());
        assert!(!CallError::Timeout(50).is_connect_failure());
        assert_eq!(
            CallError::Status {
                code: "Unavailable".into(),
                message: "down".into()
            }
            .kind(),
            "status"
        );
    }

    #[test]
    fn test_unavailable_classification() {
        let unavailable = CallError::Status {
            code: "Unavailable".into(),
            message: "draining".into(),
        };
        assert!(unavailable.is_unavailable());
        assert!(!CallError::Transport("reset".into()).is_unavailable());
        assert!(!CallError::Status {
            code: "InvalidArgument".into(),
            message: "expired".into()
        }
        .is_unavailable());
    }
}
