//! Pricing Catalog
//!
//! Prices are kept in major currency units as `Decimal` and converted to
//! minor units exactly once, by [`to_minor_units`], before they reach the
//! gateway.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use crate::error::PricingError;
use crate::order::Tier;

/// Durations offered for purchase, in months
pub const DURATIONS: [u32; 4] = [1, 3, 6, 12];

/// Minor units per major unit
pub const MINOR_UNIT_SCALE: u64 = 100;

impl Tier {
    /// Monthly base price in major units
    pub fn base_price(&self) -> Decimal {
        match self {
            Tier::Standard => dec!(15),
            Tier::Premium => dec!(25),
        }
    }
}

/// Discount multiplier applied to longer commitments
pub fn discount_rate(months: u32) -> Decimal {
    match months {
        6 => dec!(0.95),
        12 => dec!(0.90),
        _ => Decimal::ONE,
    }
}

/// Total price in major units for a tier and duration
pub fn quote(tier: Tier, months: u32) -> Result<Decimal, PricingError> {
    if !DURATIONS.contains(&months) {
        return Err(PricingError::UnsupportedDuration(months));
    }

    let total = tier.base_price() * Decimal::from(months) * discount_rate(months);
    Ok(total.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}

/// Convert a major-unit amount into minor units (×100)
pub fn to_minor_units(major: Decimal) -> Result<u64, PricingError> {
    if major.is_sign_negative() && !major.is_zero() {
        return Err(PricingError::InvalidAmount(major.to_string()));
    }

    let minor = major * Decimal::from(MINOR_UNIT_SCALE);
    if minor.fract() != Decimal::ZERO {
        return Err(PricingError::InvalidAmount(major.to_string()));
    }

    minor
        .to_u64()
        .ok_or_else(|| PricingError::InvalidAmount(major.to_string()))
}
