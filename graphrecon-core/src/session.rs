//! Authenticated session handle.

use std::fmt;

/// Read-only bearer-token capability handed to the HTTP transport at startup.
///
/// Token acquisition and refresh happen outside this crate.
#[derive(Clone)]
pub struct Session {
    token: String,
    user_agent: String,
}

impl Session {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_agent: concat!("graphrecon/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .finish()
    }
}
