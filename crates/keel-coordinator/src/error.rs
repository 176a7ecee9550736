use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub type CoordinationResult<T> = Result<T, CoordinationError>;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("job submission failed: {0}")]
    JobSubmission(String),
    #[error("job execution failed: {0}")]
    JobExecution(String),
    #[error("job cancelled: {0}")]
    JobCancellation(String),
    #[error("error in JSON serialization: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("error in IO: {0}")]
    IoError(#[from] std::io::Error),
}

impl CoordinationError {
    pub fn invalid(message: impl Into<String>) -> Self {
        CoordinationError::InvalidArgument(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CoordinationError::InternalError(message.into())
    }

    /// Wraps an arbitrary failure as a job execution error unless it already
    /// carries one of the job-facing kinds.
    pub fn into_job_error(self) -> Self {
        match self {
            x @ (CoordinationError::JobSubmission(_)
            | CoordinationError::JobExecution(_)
            | CoordinationError::JobCancellation(_)) => x,
            other => CoordinationError::JobExecution(other.to_string()),
        }
    }

    pub fn to_failure_cause(&self) -> JobFailureCause {
        let kind = match self {
            CoordinationError::JobSubmission(_) => JobFailureKind::Submission,
            CoordinationError::JobCancellation(_) => JobFailureKind::Cancellation,
            _ => JobFailureKind::Execution,
        };
        JobFailureCause {
            kind,
            message: self.to_string(),
        }
    }
}

impl<T> From<mpsc::error::SendError<T>> for CoordinationError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        CoordinationError::InternalError("the actor mailbox has been closed".to_string())
    }
}

impl From<oneshot::error::RecvError> for CoordinationError {
    fn from(_: oneshot::error::RecvError) -> Self {
        CoordinationError::InternalError("the reply channel has been closed".to_string())
    }
}

/// The structured failure payload delivered to clients in place of a
/// serialized exception.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailureCause {
    pub kind: JobFailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobFailureKind {
    Submission,
    Execution,
    Cancellation,
}

impl std::fmt::Display for JobFailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}
