/// Errors surfaced by the session service.
///
/// Validation failures are returned to the caller verbatim; backend
/// failures are wrapped with the name of the failing operation. Not-found
/// reads are not errors (they return `Ok(None)`), and not-found deletes
/// succeed silently.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("app name is required")]
    MissingAppName,

    #[error("user id is required")]
    MissingUserId,

    #[error("session id is required")]
    MissingSessionId,

    #[error("state key is required")]
    MissingKey,

    #[error("state key {0:?} uses a reserved prefix")]
    ForbiddenPrefix(String),

    #[error("app {0} not found")]
    AppNotFound(String),

    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} has expired")]
    SessionExpired(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{op}: backend failure: {message}")]
    Backend { op: &'static str, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl SessionError {
    /// Wrap a backend client error with the operation that hit it.
    pub fn backend(op: &'static str, err: impl std::fmt::Display) -> Self {
        SessionError::Backend { op, message: err.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SessionError::MissingAppName;
        assert_eq!(err.to_string(), "app name is required");

        let err = SessionError::SessionNotFound("s1".to_string());
        assert_eq!(err.to_string(), "session s1 not found");
    }

    #[test]
    fn test_backend_wrapping() {
        let err = SessionError::backend("get_session", "connection refused");
        assert_eq!(err.to_string(), "get_session: backend failure: connection refused");
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err: SessionError = serde_err.into();
        assert!(matches!(err, SessionError::Serde(_)));
    }
}
