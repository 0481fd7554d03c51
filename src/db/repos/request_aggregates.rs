use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    db::error::DbResult,
    models::{AggregateContribution, AggregateFilter, RequestAggregate, SubjectType},
};

#[async_trait]
pub trait RequestAggregateRepo: Send + Sync {
    /// Merge a contribution into its window, creating the row if needed.
    ///
    /// `total_requests` and `total_tokens` are summed; `unique_subjects`
    /// takes the max of the stored value and the contribution, so merges
    /// commute and re-applying an estimate never inflates the count.
    async fn merge(&self, contribution: AggregateContribution) -> DbResult<RequestAggregate>;

    async fn get_window(
        &self,
        model_alias: &str,
        upstream: &str,
        subject_type: SubjectType,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> DbResult<Option<RequestAggregate>>;

    /// Filtered listing, most recent window first.
    async fn list(&self, filter: AggregateFilter) -> DbResult<Vec<RequestAggregate>>;

    /// Delete windows that ended before the cutoff. Returns the number of
    /// rows deleted.
    async fn delete_windows_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64>;
}
