//! License Issuance
//!
//! Turns a successful payment into exactly one license code. The backend is
//! asked once; any failure falls back to a locally synthesized placeholder so
//! a paying user is never left without a code.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IssuanceError;
use crate::order::{OrderContext, Tier};

/// Log target for placeholder codes awaiting reconciliation
pub const FALLBACK_LOG_TARGET: &str = "license_fallback";

/// Default prefix for placeholder codes
pub const DEFAULT_FALLBACK_PREFIX: &str = "XHS";

/// An issued license
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseRecord {
    pub code: String,
    pub tier: Tier,
    pub duration_months: u32,
    pub issued_at: DateTime<Utc>,
}

/// Where a license code came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LicenseOrigin {
    /// Issued by the license backend
    Primary,

    /// Synthesized locally after the backend failed; not a real entitlement
    Fallback,
}

/// Issuance outcome handed to the presentation layer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedLicense {
    pub record: LicenseRecord,
    pub origin: LicenseOrigin,
}

impl IssuedLicense {
    pub fn code(&self) -> &str {
        &self.record.code
    }

    pub fn is_fallback(&self) -> bool {
        self.origin == LicenseOrigin::Fallback
    }
}

/// Request body understood by the license proxy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseRequest {
    pub license_type: Tier,
    pub months: u32,
    pub notes: String,
}

impl LicenseRequest {
    pub fn for_order(order: &OrderContext, session_reference: &str) -> Self {
        Self {
            license_type: order.tier(),
            months: order.duration_months(),
            notes: format!("Order: {session_reference}"),
        }
    }
}

/// Response body returned by the license backend
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseResponse {
    #[serde(default)]
    pub success: bool,

    #[serde(default)]
    pub license_code: Option<String>,

    #[serde(default)]
    pub message: Option<String>,
}

/// License backend trait
///
/// Implementations only report transport-level outcomes; deciding whether a
/// response carries a usable code is the issuer's job.
#[async_trait]
pub trait LicenseBackend: Send + Sync {
    async fn generate(&self, request: &LicenseRequest) -> Result<LicenseResponse, IssuanceError>;
}

/// License Issuance Coordinator
pub struct LicenseIssuer {
    backend: Arc<dyn LicenseBackend>,
    fallback_prefix: String,
}

impl LicenseIssuer {
    pub fn new(backend: Arc<dyn LicenseBackend>) -> Self {
        Self {
            backend,
            fallback_prefix: DEFAULT_FALLBACK_PREFIX.into(),
        }
    }

    /// Use a different prefix for placeholder codes
    pub fn with_fallback_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.fallback_prefix = prefix.into();
        self
    }

    /// Issue a license for a paid order. Always yields a code.
    pub async fn issue(&self, order: &OrderContext, session_reference: &str) -> IssuedLicense {
        let request = LicenseRequest::for_order(order, session_reference);

        match self.request_primary(&request).await {
            Ok(code) => {
                tracing::info!(
                    reference = %session_reference,
                    tier = %order.tier().as_str(),
                    months = order.duration_months(),
                    "Issued license from backend"
                );
                Self::record(order, code, LicenseOrigin::Primary)
            }
            Err(e) => {
                let code = fallback_code(&self.fallback_prefix, Utc::now());
                tracing::warn!(
                    target: FALLBACK_LOG_TARGET,
                    reference = %session_reference,
                    code = %code,
                    tier = %order.tier().as_str(),
                    months = order.duration_months(),
                    error = %e,
                    error_kind = ?e.kind(),
                    "Backend issuance failed, handed out placeholder code"
                );
                Self::record(order, code, LicenseOrigin::Fallback)
            }
        }
    }

    async fn request_primary(&self, request: &LicenseRequest) -> Result<String, IssuanceError> {
        let response = self.backend.generate(request).await?;

        match response.license_code {
            Some(code) if response.success && !code.trim().is_empty() => Ok(code),
            _ => Err(IssuanceError::Declined(
                response
                    .message
                    .unwrap_or_else(|| "no license code in response".into()),
            )),
        }
    }

    fn record(order: &OrderContext, code: String, origin: LicenseOrigin) -> IssuedLicense {
        IssuedLicense {
            record: LicenseRecord {
                code,
                tier: order.tier(),
                duration_months: order.duration_months(),
                issued_at: Utc::now(),
            },
            origin,
        }
    }
}

/// Placeholder code: `<PREFIX>-<8 random chars>-<base36 millis>`
pub fn fallback_code(prefix: &str, now: DateTime<Utc>) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    let millis = u64::try_from(now.timestamp_millis()).unwrap_or_default();
    format!("{}-{}-{}", prefix, &random[0..8], to_base36(millis))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

    if value == 0 {
        return "0".into();
    }

    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
