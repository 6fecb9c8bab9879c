use headers::{authorization::Basic, Authorization, HeaderMapExt};
use http::HeaderMap;

/// Credentials sent as Basic Auth on every request
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Typed `Authorization: Basic ...` header for these credentials
    pub fn authorization(&self) -> Authorization<Basic> {
        Authorization::basic(&self.username, &self.password)
    }

    /// Insert the Basic Auth header into an outgoing header map
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.typed_insert(self.authorization());
    }
}

// Never print the password.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
