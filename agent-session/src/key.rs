use crate::error::{Result, SessionError};

/// Full address of a session: `(app_name, user_id, session_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self { app_name: app_name.into(), user_id: user_id.into(), session_id: session_id.into() }
    }

    /// All three components must be present.
    pub fn validate(&self) -> Result<()> {
        self.validate_for_create()?;
        if self.session_id.is_empty() {
            return Err(SessionError::MissingSessionId);
        }
        Ok(())
    }

    /// An empty `session_id` is allowed on the create path; a fresh id is
    /// generated by the service.
    pub fn validate_for_create(&self) -> Result<()> {
        if self.app_name.is_empty() {
            return Err(SessionError::MissingAppName);
        }
        if self.user_id.is_empty() {
            return Err(SessionError::MissingUserId);
        }
        Ok(())
    }

    /// Composite `app:user:session` form, used for worker shard selection.
    pub fn composite(&self) -> String {
        format!("{}:{}:{}", self.app_name, self.user_id, self.session_id)
    }

    pub fn user_key(&self) -> UserKey {
        UserKey { app_name: self.app_name.clone(), user_id: self.user_id.clone() }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.app_name, self.user_id, self.session_id)
    }
}

/// Address of a user's data within an app; drops the session component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserKey {
    pub app_name: String,
    pub user_id: String,
}

impl UserKey {
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self { app_name: app_name.into(), user_id: user_id.into() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_name.is_empty() {
            return Err(SessionError::MissingAppName);
        }
        if self.user_id.is_empty() {
            return Err(SessionError::MissingUserId);
        }
        Ok(())
    }
}

impl std::fmt::Display for UserKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.app_name, self.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_full_key() {
        assert!(SessionKey::new("app", "u1", "s1").validate().is_ok());

        let err = SessionKey::new("", "u1", "s1").validate().unwrap_err();
        assert!(matches!(err, SessionError::MissingAppName));

        let err = SessionKey::new("app", "", "s1").validate().unwrap_err();
        assert!(matches!(err, SessionError::MissingUserId));

        let err = SessionKey::new("app", "u1", "").validate().unwrap_err();
        assert!(matches!(err, SessionError::MissingSessionId));
    }

    #[test]
    fn test_validate_for_create_allows_empty_session_id() {
        assert!(SessionKey::new("app", "u1", "").validate_for_create().is_ok());
        assert!(SessionKey::new("", "u1", "").validate_for_create().is_err());
    }

    #[test]
    fn test_user_key_validation() {
        assert!(UserKey::new("app", "u1").validate().is_ok());
        assert!(matches!(UserKey::new("", "u1").validate(), Err(SessionError::MissingAppName)));
        assert!(matches!(UserKey::new("app", "").validate(), Err(SessionError::MissingUserId)));
    }

    #[test]
    fn test_composite_form() {
        let key = SessionKey::new("app", "u1", "s1");
        assert_eq!(key.composite(), "app:u1:s1");
        assert_eq!(key.user_key(), UserKey::new("app", "u1"));
    }
}
