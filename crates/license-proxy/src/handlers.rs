//! HTTP Handlers

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::state::AppState;

/// Header carrying the backend credential
pub const API_TOKEN_HEADER: &str = "X-API-Token";

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub credential_configured: bool,
}

/// Only used for validation; the original body is forwarded untouched
///
/// Field types are left to the backend. A field counts as present when it is
/// not null, false, zero or an empty string.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateLicenseRequest {
    #[serde(default)]
    license_type: Value,
    #[serde(default)]
    months: Value,
}

impl GenerateLicenseRequest {
    fn is_complete(&self) -> bool {
        is_present(&self.license_type) && is_present(&self.months)
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

/// Failures surfaced to the caller as `{success: false, message}`
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("licenseType and months are required")]
    MissingFields,

    #[error("Server configuration error")]
    CredentialMissing,

    #[error("License backend unreachable: {0}")]
    BackendUnreachable(String),
}

impl ProxyError {
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MissingFields => StatusCode::BAD_REQUEST,
            Self::CredentialMissing => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BackendUnreachable(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Message safe to show to the caller
    pub fn user_message(&self) -> String {
        match self {
            Self::BackendUnreachable(_) => "License backend unreachable".into(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(ErrorResponse {
                success: false,
                message: self.user_message(),
            }),
        )
            .into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        credential_configured: state.config.credential_configured(),
    })
}

/// Forward a license generation request to the backend
///
/// The body is validated, then sent on unchanged with the credential header.
/// Backend status and body are relayed as-is.
pub async fn generate_license(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let request: GenerateLicenseRequest = serde_json::from_slice(&body).unwrap_or_default();
    if !request.is_complete() {
        return Err(ProxyError::MissingFields);
    }

    let Some(token) = state.config.api_token.as_deref() else {
        tracing::error!("LICENSE_API_TOKEN not configured");
        return Err(ProxyError::CredentialMissing);
    };

    let backend = state
        .client
        .post(&state.config.backend_url)
        .header(header::CONTENT_TYPE, "application/json")
        .header(API_TOKEN_HEADER, token)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            tracing::error!("License backend unreachable: {}", e);
            ProxyError::BackendUnreachable(e.to_string())
        })?;

    let status = backend.status();
    let content_type = backend
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));

    let bytes = backend.bytes().await.map_err(|e| {
        tracing::error!("Failed to read license backend response: {}", e);
        ProxyError::BackendUnreachable(e.to_string())
    })?;

    if status.is_success() {
        tracing::info!(status = status.as_u16(), "License request forwarded");
    } else {
        tracing::warn!(status = status.as_u16(), "License backend returned an error");
    }

    Ok((status, [(header::CONTENT_TYPE, content_type)], bytes).into_response())
}
