//! Error types for Kronos.

use thiserror::Error;

use crate::backend::BackendFailure;
use crate::config::ConfigError;
use crate::dispatcher::TerminalReason;
use crate::lifecycle::{LifecycleRequest, LifecycleState};
use crate::types::{SessionId, SessionKind};

pub type Result<T> = std::result::Result<T, KronosError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KronosError {
    #[error("backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("backend rate limited the request")]
    RateLimited,

    #[error("not authorized")]
    NotAuthorized,

    #[error("session full: {id}")]
    SessionFull { id: SessionId },

    #[error("session not found: {id}")]
    SessionNotFound { id: SessionId },

    #[error("operation timed out after {attempts} attempt(s)")]
    OperationTimeout { attempts: u32 },

    #[error("session busy: {id} already has a pending operation")]
    Busy { id: SessionId },

    #[error("host migration exhausted all candidates for {id}")]
    MigrationExhausted { id: SessionId },

    #[error("cannot {request} while {from}")]
    InvalidTransition {
        from: LifecycleState,
        request: LifecycleRequest,
    },

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("already in a {kind} session")]
    AlreadyInSession { kind: SessionKind },

    #[error("operation superseded by teardown")]
    Superseded,

    #[error("banned from session")]
    Banned,

    #[error("matchmaking canceled")]
    Canceled,

    #[error("matchmaking for a {kind} session is already running")]
    MatchmakingInProgress { kind: SessionKind },

    #[error("lobby coordination task has shut down")]
    Shutdown,

    #[error("configuration error: {0}")]
    Config(String),
}

impl KronosError {
    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::InvalidParams(reason.into())
    }

    pub fn session_not_found(id: &SessionId) -> Self {
        Self::SessionNotFound { id: id.clone() }
    }

    pub fn busy(id: &SessionId) -> Self {
        Self::Busy { id: id.clone() }
    }

    pub fn invalid_transition(from: LifecycleState, request: LifecycleRequest) -> Self {
        Self::InvalidTransition { from, request }
    }

    /// Map an adapter failure for an operation on `id`.
    pub fn from_backend(failure: BackendFailure, id: Option<&SessionId>) -> Self {
        let id = id.cloned().unwrap_or_else(SessionId::unknown);
        match failure {
            BackendFailure::BackendUnavailable { reason } => Self::BackendUnavailable { reason },
            BackendFailure::RateLimited => Self::RateLimited,
            BackendFailure::NotAuthorized => Self::NotAuthorized,
            BackendFailure::SessionFull => Self::SessionFull { id },
            BackendFailure::SessionNotFound => Self::SessionNotFound { id },
        }
    }

    /// What a caller still waiting on `id` learns when the session ends.
    pub fn session_ended(id: &SessionId, reason: TerminalReason) -> Self {
        match reason {
            TerminalReason::MigrationExhausted => Self::MigrationExhausted { id: id.clone() },
            TerminalReason::BackendClosed | TerminalReason::Removed => Self::session_not_found(id),
            _ => Self::Superseded,
        }
    }

    /// Whether the orchestrator retries this error locally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OperationTimeout { .. })
    }
}

impl From<BackendFailure> for KronosError {
    fn from(failure: BackendFailure) -> Self {
        Self::from_backend(failure, None)
    }
}

impl From<ConfigError> for KronosError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_failure_mapping() {
        let id = SessionId::new("s-1");
        assert_eq!(
            KronosError::from_backend(BackendFailure::SessionFull, Some(&id)),
            KronosError::SessionFull { id: id.clone() }
        );
        assert_eq!(
            KronosError::from(BackendFailure::NotAuthorized),
            KronosError::NotAuthorized
        );
        assert!(matches!(
            KronosError::from(BackendFailure::unavailable("down")),
            KronosError::BackendUnavailable { reason } if reason == "down"
        ));
    }

    #[test]
    fn test_only_timeouts_retry() {
        assert!(KronosError::OperationTimeout { attempts: 1 }.is_retryable());
        assert!(!KronosError::RateLimited.is_retryable());
        assert!(!KronosError::busy(&SessionId::new("x")).is_retryable());
    }

    #[test]
    fn test_session_ended_mapping() {
        let id = SessionId::new("s-1");
        assert_eq!(
            KronosError::session_ended(&id, TerminalReason::MigrationExhausted),
            KronosError::MigrationExhausted { id: id.clone() }
        );
        assert_eq!(
            KronosError::session_ended(&id, TerminalReason::BackendClosed),
            KronosError::session_not_found(&id)
        );
        assert_eq!(
            KronosError::session_ended(&id, TerminalReason::Left),
            KronosError::Superseded
        );
    }

    #[test]
    fn test_display() {
        let err = KronosError::invalid_transition(LifecycleState::Filling, LifecycleRequest::Start);
        assert_eq!(err.to_string(), "cannot start while filling");
    }
}
