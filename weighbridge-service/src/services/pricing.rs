//! Pricing resolution for a completed weighing.
//!
//! Each rate is taken from the client override when set, otherwise from the branch
//! default tier, otherwise zero. The minimum charge is applied before the override's
//! discount. Amounts are never rounded here; two-decimal rounding only happens in the
//! human-readable breakdown.

use crate::models::{ClientPricing, PricingTier};
use serde::{Deserialize, Serialize};

/// The rates that were actually used.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AppliedRates {
    pub price_per_weighing: f64,
    pub price_per_kg: f64,
    pub minimum_charge: f64,
    pub discount_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingResult {
    pub net_weight: f64,
    pub subtotal: f64,
    pub breakdown: String,
    pub applied_rates: AppliedRates,
}

pub fn resolve(
    net_weight: f64,
    default_tier: Option<&PricingTier>,
    client_override: Option<&ClientPricing>,
) -> PricingResult {
    let pick = |over: Option<f64>, tier: Option<f64>| over.or(tier).unwrap_or(0.0);

    let rates = AppliedRates {
        price_per_weighing: pick(
            client_override.and_then(|o| o.price_per_weighing),
            default_tier.map(|t| t.price_per_weighing),
        ),
        price_per_kg: pick(
            client_override.and_then(|o| o.price_per_kg),
            default_tier.map(|t| t.price_per_kg),
        ),
        minimum_charge: pick(
            client_override.and_then(|o| o.minimum_charge),
            default_tier.map(|t| t.minimum_charge),
        ),
        discount_percentage: client_override
            .and_then(|o| o.discount_percentage)
            .filter(|d| *d > 0.0)
            .unwrap_or(0.0),
    };

    let weight_charge = net_weight * rates.price_per_kg;
    let raw = rates.price_per_weighing + weight_charge;
    let clamped = raw < rates.minimum_charge;
    let before_discount = if clamped { rates.minimum_charge } else { raw };

    let subtotal = if rates.discount_percentage > 0.0 {
        before_discount * (1.0 - rates.discount_percentage / 100.0)
    } else {
        before_discount
    };

    let mut parts = vec![
        format!("Base fee: {:.2}", rates.price_per_weighing),
        format!(
            "Weight: {:.2} kg x {:.2}/kg = {:.2}",
            net_weight, rates.price_per_kg, weight_charge
        ),
    ];
    if clamped {
        parts.push(format!("Minimum charge applied: {:.2}", rates.minimum_charge));
    }
    if rates.discount_percentage > 0.0 {
        parts.push(format!(
            "Discount: {:.2}% (-{:.2})",
            rates.discount_percentage,
            before_discount - subtotal
        ));
    }
    parts.push(format!("Subtotal: {:.2}", subtotal));

    PricingResult {
        net_weight,
        subtotal,
        breakdown: parts.join("; "),
        applied_rates: rates,
    }
}
