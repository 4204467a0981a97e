//! Application State

use std::sync::Arc;

use crate::config::ProxyConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Proxy configuration, including the backend credential
    pub config: Arc<ProxyConfig>,

    /// HTTP client for the license backend
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(config: ProxyConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }
}
