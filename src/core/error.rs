use std::process::ExitStatus;
use thiserror::Error;

/// Error type for every transport-level failure of a `p4` invocation.
///
/// Failures reported by `p4` itself (bad credentials, unknown files, ...) are
/// never surfaced here; they arrive as `error` records inside a successful
/// [`P4Result`](crate::core::P4Result).
#[derive(Error, Debug)]
pub enum Error {
    #[error("Timeout {timeout_ms}ms reached.")]
    Timeout { timeout_ms: u64 },

    #[error("Failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` terminated abnormally: {status}")]
    Terminated { program: String, status: ExitStatus },

    #[error("Command cancelled")]
    Cancelled,

    #[error("Unbalanced quotes in command: {0}")]
    UnbalancedQuotes(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Async task error: {0}")]
    AsyncTask(#[from] tokio::task::JoinError),
}

impl Error {
    /// Create a timeout error for the given duration
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create a launch error for `program`
    pub fn spawn<S: Into<String>>(program: S, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The configured duration carried by a timeout error
    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            Self::Timeout { timeout_ms } => Some(*timeout_ms),
            _ => None,
        }
    }

    /// Nothing is retried automatically; callers that want retries decide
    /// themselves, and only a timeout is a plausible candidate.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Get user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            Self::Timeout { timeout_ms } => format!(
                "p4 did not answer within {}ms. Check P4PORT or raise P4API_TIMEOUT.",
                timeout_ms
            ),
            Self::Spawn { program, source } => match source.kind() {
                std::io::ErrorKind::NotFound => {
                    format!("`{}` was not found. Is it installed and on PATH?", program)
                }
                std::io::ErrorKind::PermissionDenied => {
                    format!("`{}` could not be executed: permission denied.", program)
                }
                _ => self.to_string(),
            },
            Self::UnbalancedQuotes(cmd) => {
                format!("Command '{}' has an unclosed double quote.", cmd)
            }
            _ => self.to_string(),
        }
    }
}

/// Convenient result type for the crate
pub type Result<T> = std::result::Result<T, Error>;
