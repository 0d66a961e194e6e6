//! Identifier and state-key validation.

use crate::error::{Result, SessionError};

/// Reserved prefixes for merged-view namespaces in `SessionState.state`.
pub const APP_STATE_PREFIX: &str = "app:";
pub const USER_STATE_PREFIX: &str = "user:";

/// The triple identifying a conversation: `(app, user, session_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub app: String,
    pub user: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(app: impl Into<String>, user: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            user: user.into(),
            session_id: session_id.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier("app", &self.app)?;
        validate_identifier("user", &self.user)?;
        validate_identifier("session_id", &self.session_id)?;
        Ok(())
    }

    /// Deterministic string used for hash-sharding and logging.
    pub fn shard_key(&self) -> String {
        format!("{}|{}|{}", self.app, self.user, self.session_id)
    }
}

/// `(app, user)` pair identifying a user's aggregate state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserKey {
    pub app: String,
    pub user: String,
}

impl UserKey {
    pub fn new(app: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            user: user.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier("app", &self.app)?;
        validate_identifier("user", &self.user)?;
        Ok(())
    }
}

fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(SessionError::invalid(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Rejects state-delta keys that collide with the reserved merged-view namespaces.
pub fn validate_state_delta_keys<'a>(keys: impl IntoIterator<Item = &'a String>) -> Result<()> {
    for key in keys {
        if key.starts_with(APP_STATE_PREFIX) || key.starts_with(USER_STATE_PREFIX) {
            return Err(SessionError::invalid(format!(
                "state key '{key}' uses a reserved prefix ('app:' or 'user:')"
            )));
        }
    }
    Ok(())
}

/// Validates and normalizes a table prefix: `[A-Za-z0-9_]+`, trailing underscore appended.
pub fn validate_table_prefix(prefix: &str) -> Result<String> {
    if prefix.is_empty() {
        return Err(SessionError::invalid("table prefix must not be empty"));
    }
    if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SessionError::invalid(format!(
            "table prefix '{prefix}' must match [A-Za-z0-9_]+"
        )));
    }
    if prefix.ends_with('_') {
        Ok(prefix.to_string())
    } else {
        Ok(format!("{prefix}_"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_identifiers() {
        let key = SessionKey::new("", "u", "s1");
        assert!(matches!(key.validate(), Err(SessionError::InvalidArgument(_))));
    }

    #[test]
    fn rejects_reserved_state_prefixes() {
        let keys = vec!["app:foo".to_string()];
        assert!(validate_state_delta_keys(&keys).is_err());
    }

    #[test]
    fn normalizes_table_prefix() {
        assert_eq!(validate_table_prefix("acme").unwrap(), "acme_");
        assert_eq!(validate_table_prefix("acme_").unwrap(), "acme_");
        assert!(validate_table_prefix("acme-co").is_err());
    }
}
