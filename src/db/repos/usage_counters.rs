use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    cycle::CycleWindow,
    db::error::DbResult,
    models::{ConsumeOutcome, QuotaMetric, UsageCounter},
};

#[async_trait]
pub trait UsageCounterRepo: Send + Sync {
    /// Counter for the given cycle, if one has been opened.
    async fn get(
        &self,
        plan_assignment_id: i64,
        metric: QuotaMetric,
        cycle_start: DateTime<Utc>,
    ) -> DbResult<Option<UsageCounter>>;

    /// Unconditionally add `amount` to the cycle's counter, creating the
    /// row if needed. Used by post-paid metering where the gate has
    /// already admitted the request.
    ///
    /// A negative amount is rejected with `DbError::Validation`; zero is a
    /// no-op that opens no row. `cycle_end` is refreshed but never moved
    /// backward.
    async fn increment(
        &self,
        plan_assignment_id: i64,
        metric: QuotaMetric,
        window: CycleWindow,
        amount: i64,
    ) -> DbResult<UsageCounter>;

    /// Atomically admit and charge `amount` under `ceiling`.
    ///
    /// The check and the increment happen in one transaction, so two
    /// concurrent calls can never both pass a check that only has room
    /// for one of them.
    async fn check_and_consume(
        &self,
        plan_assignment_id: i64,
        metric: QuotaMetric,
        window: CycleWindow,
        amount: i64,
        ceiling: i64,
    ) -> DbResult<ConsumeOutcome>;

    /// The most recent counter whose cycle ended at or before `before`.
    /// Feeds carry-over computation at a cycle boundary.
    async fn latest_ended_before(
        &self,
        plan_assignment_id: i64,
        metric: QuotaMetric,
        before: DateTime<Utc>,
    ) -> DbResult<Option<UsageCounter>>;

    /// Delete a cycle's counter row. Administrative override; a voided
    /// cycle no longer feeds carry-over.
    async fn reset(
        &self,
        plan_assignment_id: i64,
        metric: QuotaMetric,
        cycle_start: DateTime<Utc>,
    ) -> DbResult<()>;
}
