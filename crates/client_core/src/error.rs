use shared::{domain::SourceId, error::ApiError};
use thiserror::Error;

/// Outcome classification for a call dispatched through the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("remote call timed out: {0}")]
    TimedOut(ApiError),
    #[error("remote call failed: {0}")]
    Failed(ApiError),
    #[error("call bridge is saturated")]
    Saturated,
    #[error("call worker aborted: {0}")]
    Aborted(String),
}

impl CallError {
    pub fn from_api(err: ApiError) -> Self {
        if err.is_timeout() {
            CallError::TimedOut(err)
        } else {
            CallError::Failed(err)
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::TimedOut(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("checksum mismatch for downloaded item")]
    ChecksumMismatch,
    #[error("failed to send reply {reply_uuid}: {message}")]
    ReplyFailed {
        reply_uuid: String,
        timed_out: bool,
        message: String,
    },
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("job queue has no authenticated api handle")]
    NotAuthenticated,
    #[error("job was dropped without an outcome")]
    Dropped,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller task has stopped")]
    Stopped,
    #[error("unknown source {0}")]
    UnknownSource(SourceId),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
