//! Errors returned to callers of the session intents.

use crate::backends::BackendError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A turn is already streaming or being aborted.
    #[error("session {0} is busy with another turn")]
    SessionBusy(String),

    #[error("session {0} is shutting down")]
    SessionClosing(String),

    #[error("permission request not found: {0}")]
    PermissionNotFound(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
