//! Operator credentials
//!
//! Plain HTTP Basic semantics: the stored pair is compared byte for byte on
//! every request, nothing is cached between requests.

use crate::config::AuthConfig;

#[derive(Clone, Default)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Authentication is enforced only when a username is configured
    pub fn auth_required(&self) -> bool {
        !self.username.is_empty()
    }

    /// Compare supplied Basic credentials with the stored pair
    ///
    /// A missing password is treated as the empty password.
    pub fn matches(&self, user_id: &str, password: Option<&str>) -> bool {
        user_id.as_bytes() == self.username.as_bytes()
            && password.unwrap_or_default().as_bytes() == self.password.as_bytes()
    }
}

impl From<&AuthConfig> for Credentials {
    fn from(config: &AuthConfig) -> Self {
        Self::new(config.username.clone(), config.password.clone())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_username_disables_auth() {
        assert!(!Credentials::new("", "ignored").auth_required());
        assert!(Credentials::new("admin", "").auth_required());
    }

    #[test]
    fn matches_requires_exact_pair() {
        let credentials = Credentials::new("admin", "knx");

        assert!(credentials.matches("admin", Some("knx")));
        assert!(!credentials.matches("admin", Some("KNX")));
        assert!(!credentials.matches("Admin", Some("knx")));
        assert!(!credentials.matches("admin", None));
        assert!(!credentials.matches("admin ", Some("knx")));
    }

    #[test]
    fn missing_password_matches_empty_password() {
        let credentials = Credentials::new("admin", "");

        assert!(credentials.matches("admin", None));
        assert!(credentials.matches("admin", Some("")));
    }
}
