use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CarryPolicy, QuotaMetric, Subject};

/// How a consumed unit is accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    /// Regular plan subscription.
    #[default]
    Plan,
    /// Pre-purchased allotment.
    Prepaid,
    /// Granted through voucher redemption.
    Voucher,
    /// Inline assignment created by the quota gate when the primary plan
    /// is exhausted.
    Fallback,
    /// Pay-as-you-go against an account balance.
    Balance,
}

impl BillingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingMode::Plan => "plan",
            BillingMode::Prepaid => "prepaid",
            BillingMode::Voucher => "voucher",
            BillingMode::Fallback => "fallback",
            BillingMode::Balance => "balance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plan" => Some(BillingMode::Plan),
            "prepaid" => Some(BillingMode::Prepaid),
            "voucher" => Some(BillingMode::Voucher),
            "fallback" => Some(BillingMode::Fallback),
            "balance" => Some(BillingMode::Balance),
            _ => None,
        }
    }
}

/// A time-bounded binding from a subject to a plan.
///
/// Window fields are never mutated in place once the usage counter has
/// observed the assignment; termination sets `deactivated_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAssignment {
    pub id: i64,
    pub subject: Subject,
    pub plan_id: i64,
    pub billing_mode: BillingMode,
    pub activated_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Carry-over policy for this assignment; amounts live in the ledger.
    pub carry_policy: CarryPolicy,
    pub auto_fallback_enabled: bool,
    pub fallback_plan_id: Option<i64>,
    /// Opaque enforcement metadata, passed through untouched.
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlanAssignment {
    /// Whether the assignment is active at the given instant:
    /// `activated_at <= t < (deactivated_at or +inf)` and not expired.
    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        if at < self.activated_at {
            return false;
        }
        if let Some(deactivated) = self.deactivated_at {
            if at >= deactivated {
                return false;
            }
        }
        if let Some(expires) = self.expires_at {
            if at >= expires {
                return false;
            }
        }
        true
    }
}

/// Options for creating an assignment; unset fields inherit from the plan.
#[derive(Debug, Clone, Default)]
pub struct AssignmentOpts {
    pub billing_mode: BillingMode,
    pub expires_at: Option<DateTime<Utc>>,
    /// Overrides the plan's carry policy when set.
    pub carry_policy: Option<CarryPolicy>,
    pub auto_fallback_enabled: bool,
    pub fallback_plan_id: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

/// Storage-level input for inserting an assignment row.
#[derive(Debug, Clone)]
pub struct NewAssignment {
    pub subject: Subject,
    pub plan_id: i64,
    pub billing_mode: BillingMode,
    pub activated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub carry_policy: CarryPolicy,
    pub auto_fallback_enabled: bool,
    pub fallback_plan_id: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

/// One entry in the append-only carry-over ledger.
///
/// A cycle transition writes exactly one entry per `(assignment, metric,
/// cycle_start)`; replaying the ledger reconstructs every quota delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarryLedgerEntry {
    pub id: i64,
    pub plan_assignment_id: i64,
    pub metric: QuotaMetric,
    /// The cycle the carried amount applies to.
    pub cycle_start: DateTime<Utc>,
    pub amount: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, d, h, 0, 0).unwrap()
    }

    fn assignment(
        activated: DateTime<Utc>,
        deactivated: Option<DateTime<Utc>>,
        expires: Option<DateTime<Utc>>,
    ) -> PlanAssignment {
        PlanAssignment {
            id: 1,
            subject: Subject::User(1),
            plan_id: 1,
            billing_mode: BillingMode::Plan,
            activated_at: activated,
            deactivated_at: deactivated,
            expires_at: expires,
            carry_policy: CarryPolicy::None,
            auto_fallback_enabled: false,
            fallback_plan_id: None,
            metadata: None,
            created_at: activated,
            updated_at: activated,
        }
    }

    #[test]
    fn active_window_is_half_open() {
        let a = assignment(ts(1, 0), Some(ts(10, 0)), None);
        assert!(!a.is_active(ts(1, 0) - chrono::Duration::seconds(1)));
        assert!(a.is_active(ts(1, 0)));
        assert!(a.is_active(ts(9, 23)));
        assert!(!a.is_active(ts(10, 0)));
    }

    #[test]
    fn expiry_bounds_activity() {
        let a = assignment(ts(1, 0), None, Some(ts(5, 0)));
        assert!(a.is_active(ts(4, 23)));
        assert!(!a.is_active(ts(5, 0)));
    }
}
