//! Bounded lossy queue between the telemetry recorder and the aggregate
//! merger.
//!
//! Log ingestion must never block on aggregate writes, so contributions
//! travel through a lock-free bounded channel. When the channel is full the
//! contribution is dropped and counted; the request log row is already
//! durable at that point, so a dropped contribution loses only rollup
//! precision, never the record itself.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::{db::RequestAggregateRepo, models::AggregateContribution};

/// Configuration for the aggregate contribution buffer.
#[derive(Debug, Clone)]
pub struct AggregateBufferConfig {
    /// Maximum contributions drained per flush.
    pub max_batch_size: usize,
    /// Maximum time to wait between flushes.
    pub flush_interval: Duration,
    /// Channel capacity; contributions beyond this are dropped.
    pub capacity: usize,
}

impl Default for AggregateBufferConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            flush_interval: Duration::from_secs(1),
            capacity: 4096,
        }
    }
}

/// Lossy buffer for aggregate contributions.
///
/// Push is lock-free; multiple request paths can push concurrently without
/// contention. The background worker drains contributions, coalesces them
/// by window key, and merges the result into the store.
pub struct AggregateBuffer {
    sender: Sender<AggregateContribution>,
    receiver: Receiver<AggregateContribution>,
    config: AggregateBufferConfig,
    shutdown: Arc<AtomicBool>,
    dropped_count: AtomicU64,
}

impl AggregateBuffer {
    pub fn new(config: AggregateBufferConfig) -> Self {
        let capacity = config.capacity.max(1);
        let (sender, receiver) = crossbeam_channel::bounded(capacity);

        Self {
            sender,
            receiver,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            dropped_count: AtomicU64::new(0),
        }
    }

    /// Enqueue a contribution. Never blocks.
    ///
    /// If the channel is full the contribution is dropped; drops are counted
    /// and logged every 100 occurrences to avoid log spam.
    pub fn push(&self, contribution: AggregateContribution) {
        match self.sender.try_send(contribution) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let count = self.dropped_count.fetch_add(1, Ordering::Relaxed);
                if count % 100 == 0 {
                    tracing::warn!(
                        dropped_count = count + 1,
                        capacity = self.config.capacity,
                        "Aggregate buffer overflow: dropping contributions"
                    );
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                // Worker has shut down; silently drop.
            }
        }
    }

    /// Contributions dropped because the channel was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Start the background merge worker.
    ///
    /// Runs until `shutdown()` is called, then drains whatever is left
    /// before exiting.
    pub fn start_worker(
        self: &Arc<Self>,
        repo: Arc<dyn RequestAggregateRepo>,
    ) -> tokio::task::JoinHandle<()> {
        let buffer = Arc::clone(self);
        let flush_interval = self.config.flush_interval;
        let max_batch_size = self.config.max_batch_size;

        tokio::spawn(async move {
            let mut batch = Vec::with_capacity(max_batch_size);

            loop {
                buffer.drain(&mut batch, max_batch_size);

                if !batch.is_empty() {
                    buffer.flush_batch(&repo, &mut batch).await;
                }

                if buffer.shutdown.load(Ordering::Acquire) {
                    buffer.drain(&mut batch, usize::MAX);
                    if !batch.is_empty() {
                        buffer.flush_batch(&repo, &mut batch).await;
                    }
                    tracing::info!("Aggregate buffer worker shutting down");
                    break;
                }

                tokio::time::sleep(flush_interval).await;
            }
        })
    }

    /// Signal the worker to shut down.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn drain(&self, batch: &mut Vec<AggregateContribution>, max: usize) {
        while batch.len() < max {
            match self.receiver.try_recv() {
                Ok(contribution) => batch.push(contribution),
                Err(_) => break,
            }
        }
    }

    async fn flush_batch(
        &self,
        repo: &Arc<dyn RequestAggregateRepo>,
        batch: &mut Vec<AggregateContribution>,
    ) {
        let count = batch.len();
        let coalesced = coalesce(batch.drain(..));
        tracing::debug!(
            contributions = count,
            windows = coalesced.len(),
            "Flushing aggregate buffer"
        );

        for contribution in coalesced {
            if let Err(e) = repo.merge(contribution).await {
                // The merge is retried implicitly by later contributions to
                // the same window; log and keep going.
                tracing::error!(error = %e, "Aggregate merge failed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Collapse contributions sharing a window key into one merge each.
///
/// Counts sum; `unique_subjects` takes the max, matching the store's merge
/// semantics, so coalescing is transparent.
fn coalesce(
    contributions: impl Iterator<Item = AggregateContribution>,
) -> Vec<AggregateContribution> {
    let mut by_key: HashMap<_, AggregateContribution> = HashMap::new();

    for c in contributions {
        let key = (
            c.model_alias.clone(),
            c.upstream.clone(),
            c.subject_type,
            c.window_start,
            c.window_end,
        );
        by_key
            .entry(key)
            .and_modify(|existing| {
                existing.total_requests += c.total_requests;
                existing.total_tokens += c.total_tokens;
                existing.unique_subjects = existing.unique_subjects.max(c.unique_subjects);
            })
            .or_insert(c);
    }

    by_key.into_values().collect()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::models::SubjectType;

    fn contribution(tokens: i64) -> AggregateContribution {
        AggregateContribution::for_request(
            "gpt-4o",
            "openai",
            SubjectType::User,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap(),
            tokens,
        )
    }

    #[test]
    fn push_and_len() {
        let buffer = AggregateBuffer::new(AggregateBufferConfig::default());
        assert!(buffer.is_empty());

        buffer.push(contribution(10));
        buffer.push(contribution(20));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn overflow_drops_and_counts() {
        let buffer = AggregateBuffer::new(AggregateBufferConfig {
            capacity: 3,
            ..Default::default()
        });

        for _ in 0..3 {
            buffer.push(contribution(10));
        }
        assert_eq!(buffer.dropped_count(), 0);

        buffer.push(contribution(10));
        buffer.push(contribution(10));
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.dropped_count(), 2);
    }

    #[test]
    fn coalesce_sums_counts_and_max_merges_subjects() {
        let mut estimate = contribution(0);
        estimate.total_requests = 0;
        estimate.unique_subjects = 5;

        let merged = coalesce(vec![contribution(10), contribution(20), estimate].into_iter());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].total_requests, 2);
        assert_eq!(merged[0].total_tokens, 30);
        assert_eq!(merged[0].unique_subjects, 5);
    }

    #[test]
    fn coalesce_keeps_distinct_windows_apart() {
        let mut other = contribution(10);
        other.subject_type = SubjectType::Token;

        let merged = coalesce(vec![contribution(10), other].into_iter());
        assert_eq!(merged.len(), 2);
    }
}
