//! HTTP credential value object.

use std::fmt;

use zeroize::Zeroizing;

/// Username and password answered to `401` authentication challenges.
///
/// The password is wiped from memory when the credential is dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    username: String,
    password: Zeroizing<String>,
}

impl Credential {
    /// Creates a new credential.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    /// Returns the username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}
