//! Credential checks for incoming connections.

use subtle::ConstantTimeEq;

/// Decides whether a user/password pair may open a connection.
pub trait CredentialCheck: Send + Sync {
    fn check_password(&self, user: &str, password: &[u8]) -> bool;
}

/// A single fixed user and password.
#[derive(Clone)]
pub struct PasswordCredentials {
    user: String,
    password: String,
}

impl PasswordCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for PasswordCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordCredentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl CredentialCheck for PasswordCredentials {
    fn check_password(&self, user: &str, password: &[u8]) -> bool {
        // Both comparisons always run.
        let user_ok = user.as_bytes().ct_eq(self.user.as_bytes());
        let password_ok = password.ct_eq(self.password.as_bytes());
        (user_ok & password_ok).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_credentials() {
        let creds = PasswordCredentials::new("admin", "s3cret");
        assert!(creds.check_password("admin", b"s3cret"));
    }

    #[test]
    fn rejects_wrong_password() {
        let creds = PasswordCredentials::new("admin", "s3cret");
        assert!(!creds.check_password("admin", b"s3cre"));
        assert!(!creds.check_password("admin", b""));
    }

    #[test]
    fn rejects_wrong_user() {
        let creds = PasswordCredentials::new("admin", "s3cret");
        assert!(!creds.check_password("root", b"s3cret"));
    }

    #[test]
    fn debug_hides_password() {
        let creds = PasswordCredentials::new("admin", "s3cret");
        assert!(!format!("{creds:?}").contains("s3cret"));
    }
}
