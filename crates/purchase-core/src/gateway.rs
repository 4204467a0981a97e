//! Payment Gateway Strategy
//!
//! Defines the three gateway operations the session controller depends on.
//! Implementations are thin request/response wrappers: no retries, no
//! business interpretation beyond mapping failures onto [`GatewayError`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use purchase_core::gateway::{CreateIntentRequest, PaymentGateway};
//!
//! let intent = gateway.create_intent(&CreateIntentRequest::for_order(&order)).await?;
//! let status = gateway.query_status(&intent.external_reference).await?;
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::order::{OrderContext, PaymentIntent, PaymentStatus};

/// Parameters for creating a payment intent
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateIntentRequest {
    pub description: String,

    /// Amount in minor currency units
    pub amount_minor_units: u64,

    /// Free-form metadata shown in the merchant console
    pub remarks: String,
}

impl CreateIntentRequest {
    pub fn for_order(order: &OrderContext) -> Self {
        Self {
            description: order.description(),
            amount_minor_units: order.amount_minor_units(),
            remarks: order.remarks(),
        }
    }
}

/// Payment gateway trait (Strategy pattern)
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a payment intent and return its redeemable reference
    async fn create_intent(&self, request: &CreateIntentRequest) -> Result<PaymentIntent>;

    /// Query the current status of an intent
    async fn query_status(&self, external_reference: &str) -> Result<PaymentStatus>;

    /// Ask the gateway to release an intent (best-effort)
    async fn cancel_intent(&self, external_reference: &str) -> Result<()>;

    /// Gateway name for logs
    fn name(&self) -> &str;
}
