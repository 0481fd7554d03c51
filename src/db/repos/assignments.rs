use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    cycle::CycleWindow,
    db::error::DbResult,
    models::{
        CarryLedgerEntry, ConsumeOutcome, NewAssignment, PlanAssignment, QuotaMetric, Subject,
    },
};

/// Input for one carry-over ledger entry.
#[derive(Debug, Clone)]
pub struct NewCarryEntry {
    pub plan_assignment_id: i64,
    pub metric: QuotaMetric,
    pub cycle_start: DateTime<Utc>,
    pub amount: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait AssignmentRepo: Send + Sync {
    async fn create(&self, input: NewAssignment) -> DbResult<PlanAssignment>;

    async fn get_by_id(&self, id: i64) -> DbResult<Option<PlanAssignment>>;

    /// Assignments active at `at` for a subject, newest activation first.
    /// Ties on `activated_at` break toward the higher id.
    async fn find_active(&self, subject: &Subject, at: DateTime<Utc>)
    -> DbResult<Vec<PlanAssignment>>;

    /// Every assignment ever held by the subject, newest first.
    async fn list_for_subject(&self, subject: &Subject) -> DbResult<Vec<PlanAssignment>>;

    /// Set `deactivated_at`. Fails with `DbError::Conflict` if the
    /// assignment is already terminated.
    async fn terminate(&self, id: i64, at: DateTime<Utc>) -> DbResult<PlanAssignment>;

    /// Append a carry-over entry. Idempotent per
    /// `(assignment, metric, cycle_start)`: a duplicate write returns the
    /// existing entry unchanged.
    async fn record_carry(&self, entry: NewCarryEntry) -> DbResult<CarryLedgerEntry>;

    /// Total unexpired carried amount applying to the given cycle.
    async fn carry_for(
        &self,
        plan_assignment_id: i64,
        metric: QuotaMetric,
        cycle_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<i64>;

    /// Ledger entries for an assignment, oldest first.
    async fn carry_ledger(&self, plan_assignment_id: i64) -> DbResult<Vec<CarryLedgerEntry>>;

    /// Reuse an active fallback assignment for the subject and plan, or
    /// create one, then charge `amount` against it under `ceiling`, all in
    /// one transaction.
    async fn consume_fallback(
        &self,
        subject: &Subject,
        fallback_plan_id: i64,
        metric: QuotaMetric,
        window: CycleWindow,
        amount: i64,
        ceiling: i64,
        now: DateTime<Utc>,
    ) -> DbResult<(PlanAssignment, ConsumeOutcome)>;
}
