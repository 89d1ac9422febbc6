use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The branch fields the weighing workflow depends on.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Branch {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    /// Percentage, e.g. `12.0` for 12%.
    pub tax_rate: f64,
    pub payment_terms: String,
}

/// Caller role as supplied by the upstream auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Operator,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Self::Admin),
            "manager" => Some(Self::Manager),
            "operator" => Some(Self::Operator),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Operator => "operator",
        }
    }
}

/// The authenticated user a write is performed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
}

impl Caller {
    /// Operators may only act on their own transactions.
    pub fn may_act_for(&self, operator_id: Uuid) -> bool {
        self.role != Role::Operator || self.user_id == operator_id
    }
}
