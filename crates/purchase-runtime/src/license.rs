//! License Proxy Client
//!
//! Implementation of `LicenseBackend` that calls the credential-injecting
//! license proxy. The proxy holds the backend credential, so this client
//! carries none.

use std::time::Duration;

use async_trait::async_trait;
use purchase_core::{
    error::IssuanceError,
    license::{LicenseBackend, LicenseRequest, LicenseResponse},
};

/// License proxy client configuration
#[derive(Clone, Debug)]
pub struct LicenseClientConfig {
    /// Full URL of the proxy's generate endpoint
    pub proxy_url: String,

    pub timeout_secs: u64,
}

impl Default for LicenseClientConfig {
    fn default() -> Self {
        Self {
            proxy_url: "http://localhost:3000/api/license/generate".into(),
            timeout_secs: 15,
        }
    }
}

impl LicenseClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let proxy_url = std::env::var("LICENSE_PROXY_URL").unwrap_or(defaults.proxy_url);
        let timeout_secs = std::env::var("LICENSE_PROXY_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse().ok())
            .unwrap_or(defaults.timeout_secs);

        Self {
            proxy_url,
            timeout_secs,
        }
    }
}

/// License backend reached through the proxy
pub struct HttpLicenseBackend {
    client: reqwest::Client,
    config: LicenseClientConfig,
}

impl HttpLicenseBackend {
    pub fn new(config: LicenseClientConfig) -> Result<Self, IssuanceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IssuanceError::Unavailable(e.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, IssuanceError> {
        Self::new(LicenseClientConfig::from_env())
    }
}

#[async_trait]
impl LicenseBackend for HttpLicenseBackend {
    async fn generate(&self, request: &LicenseRequest) -> Result<LicenseResponse, IssuanceError> {
        let response = self
            .client
            .post(&self.config.proxy_url)
            .json(request)
            .send()
            .await
            .map_err(|e| IssuanceError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IssuanceError::Transport(e.to_string()))?;
        let parsed = serde_json::from_str::<LicenseResponse>(&body);

        if !status.is_success() {
            let message = parsed
                .ok()
                .and_then(|r| r.message)
                .unwrap_or_else(|| status.to_string());

            return Err(if status.is_server_error() {
                IssuanceError::Unavailable(format!("HTTP {}: {message}", status.as_u16()))
            } else {
                IssuanceError::Rejected {
                    status: status.as_u16(),
                    message,
                }
            });
        }

        parsed.map_err(|e| IssuanceError::Malformed(e.to_string()))
    }
}
