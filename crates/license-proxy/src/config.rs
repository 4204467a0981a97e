//! Proxy Configuration

use std::time::Duration;

/// Runtime configuration for the proxy
///
/// The backend credential lives here and nowhere else; handlers read it from
/// the shared state rather than from the environment.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Address to listen on
    pub bind_addr: String,

    /// License backend generate endpoint
    pub backend_url: String,

    /// Credential sent as `X-API-Token` (None = not configured)
    pub api_token: Option<String>,

    /// Backend request timeout
    pub timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".into(),
            backend_url: "http://localhost:8080/api/license/generate".into(),
            api_token: None,
            timeout: Duration::from_secs(15),
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            backend_url: std::env::var("LICENSE_BACKEND_URL").unwrap_or(defaults.backend_url),
            api_token: std::env::var("LICENSE_API_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            timeout: std::env::var("LICENSE_BACKEND_TIMEOUT_SECS")
                .ok()
                .and_then(|t| t.parse().ok())
                .map_or(defaults.timeout, Duration::from_secs),
        }
    }

    pub fn credential_configured(&self) -> bool {
        self.api_token.is_some()
    }
}
