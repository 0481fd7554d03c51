use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::Subject;

/// What a redeemed voucher grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// A fixed credit amount.
    #[default]
    Credit,
    /// A plan assignment for a fixed duration.
    Plan,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::Credit => "credit",
            GrantType::Plan => "plan",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credit" => Some(GrantType::Credit),
            "plan" => Some(GrantType::Plan),
            _ => None,
        }
    }
}

/// Lifecycle of a single voucher code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoucherCodeStatus {
    Available,
    Issued,
    Redeemed,
    Expired,
}

impl VoucherCodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoucherCodeStatus::Available => "available",
            VoucherCodeStatus::Issued => "issued",
            VoucherCodeStatus::Redeemed => "redeemed",
            VoucherCodeStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(VoucherCodeStatus::Available),
            "issued" => Some(VoucherCodeStatus::Issued),
            "redeemed" => Some(VoucherCodeStatus::Redeemed),
            "expired" => Some(VoucherCodeStatus::Expired),
            _ => None,
        }
    }
}

/// A voucher campaign. Codes are minted under the batch's prefix and share
/// its grant and redemption rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoucherBatch {
    pub id: i64,
    /// Unique among non-deleted batches; every code starts with it.
    pub code_prefix: String,
    pub label: String,
    pub grant_type: GrantType,
    pub credit_amount: i64,
    pub plan_grant_id: Option<i64>,
    pub plan_grant_duration_days: Option<i32>,
    /// Whether a subject may redeem a second code that grants a plan it
    /// already holds.
    pub is_stackable: bool,
    /// Total redemptions across the batch; 0 means unlimited.
    pub max_redemptions: i64,
    /// Redemptions per subject; 0 means unlimited.
    pub max_per_subject: i64,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub created_by: String,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VoucherBatch {
    /// Whether the batch's validity window admits the given instant.
    pub fn is_within_validity(&self, at: DateTime<Utc>) -> bool {
        if let Some(from) = self.valid_from {
            if at < from {
                return false;
            }
        }
        if let Some(until) = self.valid_until {
            if at >= until {
                return false;
            }
        }
        true
    }
}

/// One mintable code within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoucherCode {
    pub id: i64,
    pub voucher_batch_id: i64,
    pub code: String,
    pub status: VoucherCodeStatus,
    pub issued_at: Option<DateTime<Utc>>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub redeemed_by: Option<Subject>,
    /// The assignment created by redemption, if the grant produced one.
    pub plan_assignment_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Audit record of a completed redemption. At most one per code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoucherRedemption {
    pub id: i64,
    pub voucher_batch_id: i64,
    pub code: String,
    pub subject: Subject,
    pub plan_assignment_id: Option<i64>,
    pub credit_amount: i64,
    pub plan_granted_id: Option<i64>,
    pub redeemed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a voucher batch.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateVoucherBatch {
    #[validate(length(min = 2, max = 16))]
    pub code_prefix: String,
    #[validate(length(min = 1, max = 128))]
    pub label: String,
    #[serde(default)]
    pub grant_type: GrantType,
    #[validate(range(min = 0))]
    #[serde(default)]
    pub credit_amount: i64,
    #[serde(default)]
    pub plan_grant_id: Option<i64>,
    #[validate(range(min = 1))]
    #[serde(default)]
    pub plan_grant_duration_days: Option<i32>,
    #[serde(default)]
    pub is_stackable: bool,
    #[validate(range(min = 0))]
    #[serde(default)]
    pub max_redemptions: i64,
    #[validate(range(min = 0))]
    #[serde(default)]
    pub max_per_subject: i64,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub notes: String,
}

/// What a successful redemption produced.
#[derive(Debug, Clone, Serialize)]
pub struct RedemptionResult {
    pub redemption_id: i64,
    pub grant_type: GrantType,
    pub credit_amount: i64,
    pub plan_granted_id: Option<i64>,
    pub plan_assignment_id: Option<i64>,
    pub redeemed_at: DateTime<Utc>,
}
