use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    aggregate_buffer::AggregateBuffer,
    db::DbPool,
    error::CoreResult,
    models::{AggregateContribution, AggregateFilter, RequestAggregate, SubjectType},
};

/// Windowed rollups of request telemetry.
///
/// Contributions normally arrive through the bounded buffer; `merge` is
/// the direct path for estimators and backfills.
#[derive(Clone)]
pub struct AggregateMerger {
    db: Arc<DbPool>,
    buffer: Arc<AggregateBuffer>,
}

impl AggregateMerger {
    pub fn new(db: Arc<DbPool>, buffer: Arc<AggregateBuffer>) -> Self {
        Self { db, buffer }
    }

    /// Start the background worker draining the buffer into the store.
    pub fn start_worker(&self) -> tokio::task::JoinHandle<()> {
        self.buffer.start_worker(self.db.request_aggregates())
    }

    /// Signal the background worker to drain and stop.
    pub fn shutdown(&self) {
        self.buffer.shutdown();
    }

    /// Merge one contribution synchronously.
    ///
    /// Counts sum; `unique_subjects` takes the max of the stored value and
    /// the contribution, so periodic cardinality estimates can be replayed
    /// without inflating the count.
    pub async fn merge(&self, contribution: AggregateContribution) -> CoreResult<RequestAggregate> {
        Ok(self.db.request_aggregates().merge(contribution).await?)
    }

    /// Read back a single window.
    pub async fn aggregate(
        &self,
        model_alias: &str,
        upstream: &str,
        subject_type: SubjectType,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> CoreResult<Option<RequestAggregate>> {
        Ok(self
            .db
            .request_aggregates()
            .get_window(model_alias, upstream, subject_type, window_start, window_end)
            .await?)
    }

    /// Filtered window listing, most recent first.
    pub async fn list_windows(&self, filter: AggregateFilter) -> CoreResult<Vec<RequestAggregate>> {
        Ok(self.db.request_aggregates().list(filter).await?)
    }

    /// Drop windows that closed before the cutoff.
    pub async fn run_retention(&self, cutoff: DateTime<Utc>) -> CoreResult<u64> {
        let deleted = self.db.request_aggregates().delete_windows_before(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, "Aggregate retention pass completed");
        }
        Ok(deleted)
    }

    /// Contributions dropped by the buffer since startup.
    pub fn dropped_contributions(&self) -> u64 {
        self.buffer.dropped_count()
    }
}
