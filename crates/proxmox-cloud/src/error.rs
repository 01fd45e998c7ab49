//! Error types for driver operations.

use thiserror::Error;

/// Errors that can occur during driver operations.
#[derive(Error, Debug)]
pub enum CloudError {
    /// No VM matched a lookup.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A task did not reach a terminal state before the deadline.
    #[error("Timeout to wait for task '{upid}' reached after {timeout_secs}s")]
    ExecutionTimeout { upid: String, timeout_secs: u64 },

    /// Operation invoked with the wrong calling convention or bad input.
    #[error("{0}")]
    Usage(String),

    /// A required parameter was not given.
    #[error("The required parameter '{0}' was not given.")]
    MissingParameter(String),

    /// A new VM never showed up in the inventory.
    #[error("Failed to start the VM '{name}' after {attempts} attempts.")]
    NotPropagated { name: String, attempts: u32 },

    /// The hypervisor reported the task as failed.
    #[error("Task did not finish successfully: {exit_status}")]
    TaskFailed { upid: String, exit_status: String },

    /// API returned an error response.
    #[error("API error: {status} {reason} - {message}")]
    Api {
        status: u16,
        reason: String,
        message: String,
    },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Task handle could not be decoded.
    #[error("Invalid task handle '{0}'")]
    InvalidUpid(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Guest bootstrap failed.
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),
}

/// Coarse classification the orchestration framework reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lookup failure.
    NotFound,
    /// Polling exceeded its deadline.
    Timeout,
    /// Usage, logic, remote task or transport failure.
    Fatal,
}

impl CloudError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ExecutionTimeout { .. } => ErrorKind::Timeout,
            _ => ErrorKind::Fatal,
        }
    }

    /// Whether this is a lookup failure.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(CloudError::NotFound("vm".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            CloudError::ExecutionTimeout {
                upid: "UPID:pve:".into(),
                timeout_secs: 300
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(CloudError::Usage("bad".into()).kind(), ErrorKind::Fatal);
        assert_eq!(
            CloudError::TaskFailed {
                upid: "UPID:pve:".into(),
                exit_status: "command failed".into()
            }
            .kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_task_failed_message_carries_exit_status() {
        let err = CloudError::TaskFailed {
            upid: "UPID:pve:".into(),
            exit_status: "clone failed: disk busy".into(),
        };
        assert!(err.to_string().contains("clone failed: disk busy"));
    }
}
