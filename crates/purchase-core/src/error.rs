//! Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Coarse classification shared by gateway and issuance failures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Network or HTTP-level failure; expected to be transient
    Transport,

    /// The remote side answered and explicitly declined
    Rejected,

    /// A required collaborator is not configured
    Unavailable,
}

/// Payment gateway errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Request never produced a usable HTTP exchange
    #[error("Gateway transport error: {0}")]
    Transport(String),

    /// Gateway returned a non-zero application code
    #[error("Gateway rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },

    /// Gateway client cannot be used as configured
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Transport(_) => ErrorKind::Transport,
            GatewayError::Rejected { .. } => ErrorKind::Rejected,
            GatewayError::Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> &str {
        match self {
            GatewayError::Transport(_) => "Could not reach the payment service. Please try again.",
            GatewayError::Rejected { .. } => "The payment was declined. Please start the purchase again.",
            GatewayError::Unavailable(_) => "Payments are temporarily unavailable.",
        }
    }
}

/// License issuance errors (primary path only; the fallback never fails)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IssuanceError {
    #[error("License backend transport error: {0}")]
    Transport(String),

    #[error("License backend returned HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("License backend unavailable: {0}")]
    Unavailable(String),

    #[error("License backend response malformed: {0}")]
    Malformed(String),

    /// Backend answered 2xx but did not hand out a code
    #[error("License backend declined: {0}")]
    Declined(String),
}

impl IssuanceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IssuanceError::Transport(_) => ErrorKind::Transport,
            IssuanceError::Unavailable(_) => ErrorKind::Unavailable,
            IssuanceError::Rejected { .. }
            | IssuanceError::Malformed(_)
            | IssuanceError::Declined(_) => ErrorKind::Rejected,
        }
    }
}

/// Session controller errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// `initiate` called while another attempt is still live
    #[error("A payment session is already in progress")]
    AlreadyActive,

    /// Intent creation failed; the session is now FAILED
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The user abandoned the session before the intent was ready
    #[error("Payment session was abandoned")]
    Abandoned,
}

impl SessionError {
    pub fn user_message(&self) -> &str {
        match self {
            SessionError::AlreadyActive => "A payment is already in progress.",
            SessionError::Gateway(e) => e.user_message(),
            SessionError::Abandoned => "",
        }
    }
}

/// Pricing and order validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PricingError {
    #[error("Unsupported duration: {0} months")]
    UnsupportedDuration(u32),

    #[error("Duration must be at least one month")]
    ZeroDuration,

    #[error("Amount cannot be represented in minor units: {0}")]
    InvalidAmount(String),

    #[error("Unknown license tier: {0}")]
    UnknownTier(String),
}
