//! HTTP Payment Gateway
//!
//! Implementation of `PaymentGateway` for the native-QR payment API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use purchase_core::{
    error::{GatewayError, Result},
    gateway::{CreateIntentRequest, PaymentGateway},
    order::{PaymentIntent, PaymentStatus},
};
use serde::{Deserialize, Serialize};

const CREATE_PATH: &str = "/api/wechat/pay/native";
const QUERY_PATH: &str = "/api/wechat/pay/query";
const CANCEL_PATH: &str = "/api/wechat/pay/cancel";

/// Gateway client configuration
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Base URL of the payment API
    pub base_url: String,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            timeout_secs: 10,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let base_url = std::env::var("PAYMENT_API_BASE_URL").unwrap_or(defaults.base_url);
        let timeout_secs = std::env::var("PAYMENT_API_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse().ok())
            .unwrap_or(defaults.timeout_secs);

        Self {
            base_url,
            timeout_secs,
        }
    }
}

#[derive(Serialize)]
struct NativePayRequest<'a> {
    description: &'a str,
    amount: u64,
    remarks: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NativePayResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    out_trade_no: String,
    #[serde(default)]
    code_url: String,
    #[serde(default)]
    qr_code_image: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<PaymentStatus>,
}

/// Native-QR payment gateway over HTTP
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpPaymentGateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        reqwest::Url::parse(&config.base_url)
            .map_err(|e| GatewayError::Unavailable(format!("invalid base URL {}: {e}", config.base_url)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(GatewayConfig::from_env())
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Send a request and decode a 2xx JSON body; anything else is transport-level
    async fn send_json<T: for<'de> Deserialize<'de>>(request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Transport(format!("HTTP {status}")));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Transport(format!("invalid response body: {e}")))
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_intent(&self, request: &CreateIntentRequest) -> Result<PaymentIntent> {
        let body = NativePayRequest {
            description: &request.description,
            amount: request.amount_minor_units,
            remarks: &request.remarks,
        };

        let response: NativePayResponse =
            Self::send_json(self.client.post(self.endpoint(CREATE_PATH)).json(&body)).await?;

        if response.code != 0 {
            return Err(GatewayError::Rejected {
                code: response.code,
                message: response.message,
            });
        }
        if response.out_trade_no.is_empty() || response.code_url.is_empty() {
            return Err(GatewayError::Rejected {
                code: response.code,
                message: "response is missing the order reference or QR payload".into(),
            });
        }

        tracing::debug!(reference = %response.out_trade_no, "Gateway created intent");

        Ok(PaymentIntent {
            external_reference: response.out_trade_no,
            redeemable_payload: response.code_url,
            qr_image: response.qr_code_image.filter(|img| !img.is_empty()),
            created_at: Utc::now(),
        })
    }

    async fn query_status(&self, external_reference: &str) -> Result<PaymentStatus> {
        let request = self
            .client
            .get(self.endpoint(QUERY_PATH))
            .query(&[("outTradeNo", external_reference)]);
        let response: QueryResponse = Self::send_json(request).await?;

        if response.code != 0 {
            return Err(GatewayError::Rejected {
                code: response.code,
                message: response.message,
            });
        }

        response.status.ok_or_else(|| GatewayError::Rejected {
            code: response.code,
            message: "response is missing the payment status".into(),
        })
    }

    async fn cancel_intent(&self, external_reference: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(CANCEL_PATH))
            .query(&[("outTradeNo", external_reference)])
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Transport(format!("HTTP {status}")));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "wechat-native"
    }
}
