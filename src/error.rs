//! Engine error taxonomy.

use crate::persist::StoreError;
use crate::protocol::ErrorCode;
use crate::pty::PtyError;
use crate::workspace::WorkspaceError;
use thiserror::Error;

/// Errors surfaced by engine operations.
///
/// `ProvisioningFailed`, `ParseSkipped` and `PersistenceWriteFailed` are
/// recovered where they occur (logged, never returned to a client); they
/// exist so the recovery sites log a typed error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("session {0} already has a running process")]
    AlreadyRunning(String),

    #[error("session {0} has no running process")]
    NotRunning(String),

    #[error("workspace provisioning failed: {0}")]
    ProvisioningFailed(#[from] WorkspaceError),

    #[error("payload skipped: {0}")]
    ParseSkipped(String),

    #[error("failed to persist state: {0}")]
    PersistenceWriteFailed(#[from] StoreError),

    #[error("failed to load persisted state: {0}")]
    StateUnreadable(#[source] StoreError),

    #[error("failed to spawn process: {0}")]
    ProcessSpawnFailed(#[source] PtyError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("terminal I/O failed: {0}")]
    Io(#[source] PtyError),
}

impl EngineError {
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "session",
            id: id.into(),
        }
    }

    pub fn category_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "category",
            id: id.into(),
        }
    }

    /// Wire code reported to clients.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::AlreadyRunning(_) => ErrorCode::AlreadyRunning,
            Self::NotRunning(_) => ErrorCode::NotRunning,
            Self::ProcessSpawnFailed(_) => ErrorCode::SpawnFailed,
            Self::InvalidRequest(_) | Self::ParseSkipped(_) => ErrorCode::InvalidRequest,
            Self::ProvisioningFailed(_)
            | Self::PersistenceWriteFailed(_)
            | Self::StateUnreadable(_)
            | Self::Io(_) => {
                ErrorCode::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(EngineError::session_not_found("x").code(), ErrorCode::NotFound);
        assert_eq!(EngineError::AlreadyRunning("x".into()).code(), ErrorCode::AlreadyRunning);
        assert_eq!(
            EngineError::ProcessSpawnFailed(PtyError::EmptyCommand).code(),
            ErrorCode::SpawnFailed
        );
    }

    #[test]
    fn test_messages_name_the_kind() {
        assert_eq!(
            EngineError::category_not_found("c1").to_string(),
            "category not found: c1"
        );
    }
}
