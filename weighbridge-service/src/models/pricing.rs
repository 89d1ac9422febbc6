//! Pricing tier and client override rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Branch-wide rate card. At most one active default per branch.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PricingTier {
    pub id: Uuid,
    pub branch_id: Uuid,
    pub name: String,
    pub price_per_weighing: f64,
    pub price_per_kg: f64,
    pub minimum_charge: f64,
    pub is_default: bool,
    pub is_active: bool,
}

/// Client-specific rates. Unset fields fall back to the default tier.
#[derive(Debug, Clone, Default, FromRow, Serialize, Deserialize)]
pub struct ClientPricing {
    pub id: Uuid,
    pub branch_id: Uuid,
    pub client_id: Uuid,
    pub price_per_weighing: Option<f64>,
    pub price_per_kg: Option<f64>,
    pub minimum_charge: Option<f64>,
    pub discount_percentage: Option<f64>,
    pub effective_from: DateTime<Utc>,
    pub effective_until: Option<DateTime<Utc>>,
    pub is_active: bool,
}
