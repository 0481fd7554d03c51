use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// How a plan's quota replenishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleType {
    Daily,
    Monthly,
    /// Fixed-length cycles stepping from the plan's creation time.
    Custom,
}

impl CycleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleType::Daily => "daily",
            CycleType::Monthly => "monthly",
            CycleType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(CycleType::Daily),
            "monthly" => Some(CycleType::Monthly),
            "custom" => Some(CycleType::Custom),
            _ => None,
        }
    }
}

/// The unit in which a plan's quota is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaMetric {
    Requests,
    Tokens,
}

impl QuotaMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaMetric::Requests => "requests",
            QuotaMetric::Tokens => "tokens",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requests" => Some(QuotaMetric::Requests),
            "tokens" => Some(QuotaMetric::Tokens),
            _ => None,
        }
    }
}

/// What happens to unused quota at a cycle boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarryPolicy {
    /// Unused quota is forfeited.
    #[default]
    None,
    /// The full unused amount carries into the next cycle.
    CarryAll,
    /// The unused amount carries, capped at `cap_percent` of the plan quota.
    Cap,
}

impl CarryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CarryPolicy::None => "none",
            CarryPolicy::CarryAll => "carry_all",
            CarryPolicy::Cap => "cap",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(CarryPolicy::None),
            "carry_all" => Some(CarryPolicy::CarryAll),
            "cap" => Some(CarryPolicy::Cap),
            _ => None,
        }
    }
}

/// A billing plan: a replenishing quota of `quota_amount` units of
/// `quota_metric` per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: i64,
    /// Unique business code among non-deleted plans.
    pub code: String,
    pub name: String,
    pub description: String,
    pub cycle_type: CycleType,
    /// Length of a custom cycle; ignored for daily/monthly.
    pub cycle_length_days: i32,
    pub quota_metric: QuotaMetric,
    pub quota_amount: i64,
    pub carry_policy: CarryPolicy,
    /// Cap for `CarryPolicy::Cap`, as a percentage of `quota_amount`.
    pub carry_cap_percent: i32,
    /// Upstream aliases this plan may be billed against; None means all.
    pub upstream_alias_whitelist: Option<Vec<String>>,
    /// Model aliases this plan admits. None or empty means **all models
    /// allowed**; this is distinct from "none allowed", which cannot be
    /// expressed (deactivate the plan instead).
    pub allowed_models: Option<Vec<String>>,
    pub token_limit: i64,
    /// Default assignment lifetime in days; 0 means no expiry.
    pub validity_days: i32,
    pub is_active: bool,
    pub is_public: bool,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    /// Whether the plan admits the given model alias.
    ///
    /// An absent or empty whitelist means every model is allowed.
    pub fn is_model_allowed(&self, model_alias: &str) -> bool {
        match &self.allowed_models {
            None => true,
            Some(models) if models.is_empty() => true,
            Some(models) => {
                let wanted = model_alias.trim();
                models.iter().any(|m| m.trim().eq_ignore_ascii_case(wanted))
            }
        }
    }
}

/// Input for creating a plan.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreatePlan {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub cycle_type: CycleType,
    /// Required (>= 1) when `cycle_type` is custom.
    #[serde(default)]
    pub cycle_length_days: i32,
    pub quota_metric: QuotaMetric,
    #[validate(range(min = 0))]
    pub quota_amount: i64,
    #[serde(default)]
    pub carry_policy: CarryPolicy,
    #[validate(range(min = 0, max = 100))]
    #[serde(default)]
    pub carry_cap_percent: i32,
    #[serde(default)]
    pub upstream_alias_whitelist: Option<Vec<String>>,
    #[serde(default)]
    pub allowed_models: Option<Vec<String>>,
    #[serde(default)]
    pub token_limit: i64,
    #[validate(range(min = 0))]
    #[serde(default)]
    pub validity_days: i32,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_system: bool,
}

/// Partial update. Only fields that are mutable after creation: cycle shape
/// and metric are frozen once assignments may reference the plan.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdatePlan {
    #[validate(length(min = 1, max = 128))]
    pub name: Option<String>,
    pub description: Option<String>,
    /// Takes effect for prospective cycles only; open cycles keep the
    /// ceiling they were admitted under.
    #[validate(range(min = 0))]
    pub quota_amount: Option<i64>,
    pub carry_policy: Option<CarryPolicy>,
    #[validate(range(min = 0, max = 100))]
    pub carry_cap_percent: Option<i32>,
    pub is_active: Option<bool>,
}

/// Filter for plan listings.
#[derive(Debug, Clone, Default)]
pub struct PlanFilter {
    pub include_inactive: bool,
    pub only_public: bool,
    pub include_system: bool,
}
