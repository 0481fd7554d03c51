use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::QuotaMetric;

/// Consumption within one cycle of one assignment.
///
/// There is at most one counter row per `(assignment, metric, cycle_start)`;
/// increments go through atomic upserts so the invariant
/// `consumed_amount >= 0` always holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageCounter {
    pub id: i64,
    pub plan_assignment_id: i64,
    pub metric: QuotaMetric,
    pub cycle_start: DateTime<Utc>,
    pub cycle_end: DateTime<Utc>,
    pub consumed_amount: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UsageCounter {
    /// Units left under the given ceiling, never negative.
    pub fn remaining(&self, ceiling: i64) -> i64 {
        (ceiling - self.consumed_amount).max(0)
    }
}

/// Outcome of an atomic check-and-consume against a counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The charge fit under the ceiling; the counter was incremented.
    Consumed { remaining: i64 },
    /// The charge would exceed the ceiling; nothing was written.
    Exceeded { remaining: i64 },
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn remaining_clamps_at_zero() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let counter = UsageCounter {
            id: 1,
            plan_assignment_id: 1,
            metric: QuotaMetric::Requests,
            cycle_start: at,
            cycle_end: at + chrono::Duration::days(1),
            consumed_amount: 120,
            created_at: at,
            updated_at: at,
        };
        assert_eq!(counter.remaining(100), 0);
        assert_eq!(counter.remaining(150), 30);
    }
}
