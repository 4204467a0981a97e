//! Order and Payment Data Model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PricingError;
use crate::pricing;

/// License tiers on sale
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Standard,
    Premium,
}

impl Tier {
    /// Wire name used by the license backend
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Standard => "STANDARD",
            Tier::Premium => "PREMIUM",
        }
    }

    /// Display name used in order descriptions
    pub fn display_name(&self) -> &'static str {
        match self {
            Tier::Standard => "Standard",
            Tier::Premium => "Premium",
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = PricingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" => Ok(Tier::Standard),
            "premium" => Ok(Tier::Premium),
            _ => Err(PricingError::UnknownTier(s.to_string())),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Immutable snapshot of what is being purchased
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderContext {
    tier: Tier,
    duration_months: u32,
    amount_minor_units: u64,
}

impl OrderContext {
    /// Create an order with an explicit amount in minor currency units
    pub fn new(tier: Tier, duration_months: u32, amount_minor_units: u64) -> Result<Self, PricingError> {
        if duration_months == 0 {
            return Err(PricingError::ZeroDuration);
        }

        Ok(Self {
            tier,
            duration_months,
            amount_minor_units,
        })
    }

    /// Create an order priced from the catalog
    pub fn priced(tier: Tier, duration_months: u32) -> Result<Self, PricingError> {
        let major = pricing::quote(tier, duration_months)?;
        Self::new(tier, duration_months, pricing::to_minor_units(major)?)
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn duration_months(&self) -> u32 {
        self.duration_months
    }

    pub fn amount_minor_units(&self) -> u64 {
        self.amount_minor_units
    }

    /// Short description shown by the payment app
    pub fn description(&self) -> String {
        format!("{} license - {}", self.tier, months_label(self.duration_months))
    }

    /// Free-form remarks attached to the payment intent
    pub fn remarks(&self) -> String {
        format!(
            "License type: {}, duration: {}",
            self.tier,
            months_label(self.duration_months)
        )
    }
}

fn months_label(months: u32) -> String {
    if months == 1 {
        "1 month".into()
    } else {
        format!("{months} months")
    }
}

/// Gateway-side record of an expected payment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    /// Gateway-assigned order id
    pub external_reference: String,

    /// QR-encodable string consumed by the user's payment app
    pub redeemable_payload: String,

    /// Pre-rendered QR image (data URL), when the gateway supplies one
    pub qr_image: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// What the gateway reports for an intent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}
