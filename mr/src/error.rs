use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MrError>;

#[derive(Error, Debug)]
pub enum MrError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid job payload: {0}")]
    Validation(String),

    #[error("activity {activity} failed transiently: {message}")]
    TransientActivity { activity: String, message: String },

    #[error("activity {activity} failed: {message}")]
    FatalActivity { activity: String, message: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("non-deterministic orchestration at step {seq}: {message}")]
    NonDeterministic { seq: u64, message: String },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A failure replayed from the checkpoint log, kept exactly as recorded.
    #[error("{0}")]
    Recorded(ErrorReport),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse error classification reported to status callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ConfigurationError,
    ValidationError,
    TransientActivityError,
    FatalActivityError,
    Cancelled,
    NonDeterminismError,
    CheckpointError,
}

impl MrError {
    pub fn transient(activity: impl Into<String>, message: impl Into<String>) -> Self {
        MrError::TransientActivity {
            activity: activity.into(),
            message: message.into(),
        }
    }

    pub fn fatal(activity: impl Into<String>, message: impl Into<String>) -> Self {
        MrError::FatalActivity {
            activity: activity.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MrError::Configuration(_) => ErrorKind::ConfigurationError,
            MrError::Validation(_) => ErrorKind::ValidationError,
            MrError::TransientActivity { .. } => ErrorKind::TransientActivityError,
            MrError::FatalActivity { .. } => ErrorKind::FatalActivityError,
            MrError::Cancelled => ErrorKind::Cancelled,
            MrError::NonDeterministic { .. } => ErrorKind::NonDeterminismError,
            MrError::Recorded(report) => report.kind,
            MrError::Checkpoint(_) | MrError::Io(_) | MrError::Serialization(_) => {
                ErrorKind::CheckpointError
            }
        }
    }

    /// Only transient activity failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MrError::TransientActivity { .. })
    }

    pub fn report(&self) -> ErrorReport {
        if let MrError::Recorded(report) = self {
            return report.clone();
        }
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// The verbatim kind + message pair carried in status replies and the
/// checkpoint log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
