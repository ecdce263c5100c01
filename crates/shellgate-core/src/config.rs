//! Runtime session configuration.
//!
//! No file I/O here -- the CLI (or an embedding application) resolves
//! flags, environment, and stored profiles into a [`SessionConfig`] and
//! hands it to [`crate::session::ShellSession`].

use std::time::Duration;

use secrecy::SecretString;
use shellgate_api::ReconnectConfig;
use url::Url;

/// Everything a session needs to reach and talk to a shell backend.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base http(s) URL of the backend; the socket endpoint is derived
    /// from it.
    pub base_url: Url,

    /// Backend user to authenticate as. `None` means the backend runs in
    /// single-user mode and no `authenticate` handshake is sent.
    pub username: Option<String>,

    /// Password for `username`. Kept wrapped so it never lands in logs.
    pub password: Option<SecretString>,

    /// Deadline for a terminal response per request. `None` disables
    /// request expiry.
    pub request_timeout: Option<Duration>,

    /// Socket reconnection backoff.
    pub reconnect: ReconnectConfig,
}

impl SessionConfig {
    /// Config with defaults: no credentials, 30s request timeout,
    /// default backoff.
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            username: None,
            password: None,
            request_timeout: Some(Duration::from_secs(30)),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: SecretString,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_no_credentials() {
        let config = SessionConfig::new(Url::parse("http://localhost:8000").unwrap());
        assert!(config.username.is_none());
        assert!(config.password.is_none());
        assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn builder_sets_credentials() {
        let config = SessionConfig::new(Url::parse("http://localhost:8000").unwrap())
            .with_credentials("LocalAdministrator", SecretString::from("hunter2"))
            .with_request_timeout(None);
        assert_eq!(config.username.as_deref(), Some("LocalAdministrator"));
        assert!(config.password.is_some());
        assert!(config.request_timeout.is_none());
    }
}
