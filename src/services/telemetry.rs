use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::{
    aggregate_buffer::AggregateBuffer,
    clock::SharedClock,
    config::AccountingConfig,
    db::{DbPool, NewRequestLog},
    error::{CoreError, CoreResult},
    identity::SubjectHasher,
    models::{
        AggregateContribution, CreateRequestFlag, QuotaMetric, RequestFlag, RequestLog,
        RequestLogFilter, TelemetryEvent,
    },
    normalize,
};

/// Rows deleted per retention batch, keeping the write lock short.
const RETENTION_BATCH_SIZE: u32 = 500;

/// Accepts completed request outcomes, normalizes them, and writes the
/// immutable log record.
///
/// Insertion is at-most-once per correlation id; duplicate submissions are
/// acknowledged without a second row. Aggregate contributions ride a lossy
/// queue so log ingestion never blocks on aggregation.
#[derive(Clone)]
pub struct TelemetryRecorder {
    db: Arc<DbPool>,
    hasher: SubjectHasher,
    buffer: Arc<AggregateBuffer>,
    clock: SharedClock,
    aggregate_window_seconds: i64,
    log_retention_days: i64,
}

impl TelemetryRecorder {
    pub fn new(
        db: Arc<DbPool>,
        buffer: Arc<AggregateBuffer>,
        clock: SharedClock,
        config: &AccountingConfig,
    ) -> Self {
        Self {
            db,
            hasher: SubjectHasher::new(config.subject_hash_secret.as_bytes().to_vec()),
            buffer,
            clock,
            aggregate_window_seconds: i64::from(config.aggregate_window_seconds),
            log_retention_days: i64::from(config.log_retention_days),
        }
    }

    /// Record one request outcome. Returns whether a new row was written;
    /// `false` means the correlation id was already recorded, which is a
    /// success for the caller either way.
    pub async fn record(
        &self,
        event: TelemetryEvent,
        deadline: Option<DateTime<Utc>>,
    ) -> CoreResult<bool> {
        let now = self.clock.now();
        if let Some(deadline) = deadline {
            if now >= deadline {
                return Err(CoreError::Cancelled);
            }
        }

        if event.request_id.is_empty() {
            return Err(CoreError::InvalidArgument(
                "request_id must not be empty".to_string(),
            ));
        }
        let subject = event.subject.ok_or_else(|| {
            CoreError::InvalidArgument("telemetry event carries no subject".to_string())
        })?;

        let occurred_at = event.occurred_at.unwrap_or(now);
        let total_tokens = event.prompt_tokens + event.completion_tokens;

        let log = NewRequestLog {
            request_id: event.request_id,
            occurred_at,
            model_alias: event.model_alias,
            upstream_provider: event.upstream_provider,
            subject_type: subject.subject_type(),
            anonymized_subject_hash: self.hasher.hash(&subject),
            plan_id: event.plan_id,
            plan_assignment_id: event.plan_assignment_id,
            usage_metric: event.usage_metric.unwrap_or(QuotaMetric::Requests),
            prompt_tokens: event.prompt_tokens,
            completion_tokens: event.completion_tokens,
            total_tokens,
            latency_ms: event.latency_ms,
            normalized_url: normalize::normalize_url(&event.url, &event.http_method),
            http_method: event.http_method,
            user_agent: normalize::sanitize_user_agent(&event.user_agent),
            param_digest: normalize::param_digest(&event.params),
            sanitized_cookies: normalize::sanitize_cookies(&event.cookies),
            auth_key_fingerprint: normalize::auth_key_fingerprint(&event.auth_key),
            metadata: event.metadata,
        };

        let model_alias = log.model_alias.clone();
        let upstream = log.upstream_provider.clone();
        let subject_type = log.subject_type;

        let inserted = self.db.request_logs().insert(log).await?;
        if !inserted {
            return Ok(false);
        }

        // Contributions older than the retention horizon would land in a
        // window retention is about to delete; discard them.
        let horizon = now - Duration::days(self.log_retention_days);
        if occurred_at >= horizon {
            let window = self.window_for(occurred_at)?;
            self.buffer.push(AggregateContribution::for_request(
                model_alias,
                upstream,
                subject_type,
                window.0,
                window.1,
                total_tokens,
            ));
        }

        Ok(true)
    }

    /// Filtered log listing, newest occurrence first.
    pub async fn list_request_logs(&self, filter: RequestLogFilter) -> CoreResult<Vec<RequestLog>> {
        Ok(self.db.request_logs().list(filter).await?)
    }

    pub async fn get_request_log(&self, request_id: &str) -> CoreResult<Option<RequestLog>> {
        Ok(self.db.request_logs().get_by_request_id(request_id).await?)
    }

    /// Attach an enforcement flag to a request.
    pub async fn create_flag(&self, input: CreateRequestFlag) -> CoreResult<RequestFlag> {
        if input.request_id.is_empty() {
            return Err(CoreError::InvalidArgument(
                "request_id must not be empty".to_string(),
            ));
        }
        Ok(self.db.request_logs().create_flag(input).await?)
    }

    pub async fn flags_for(&self, request_id: &str) -> CoreResult<Vec<RequestFlag>> {
        Ok(self.db.request_logs().flags_for(request_id).await?)
    }

    /// Delete logs past the retention horizon and flags past their ttl.
    /// Returns `(logs_deleted, flags_deleted)`.
    pub async fn run_retention(&self) -> CoreResult<(u64, u64)> {
        let now = self.clock.now();
        let cutoff = now - Duration::days(self.log_retention_days);

        let logs = self
            .db
            .request_logs()
            .delete_logs_before(cutoff, RETENTION_BATCH_SIZE, u64::MAX)
            .await?;
        let flags = self.db.request_logs().delete_expired_flags(now).await?;

        if logs > 0 || flags > 0 {
            tracing::info!(logs, flags, "Telemetry retention pass completed");
        }
        Ok((logs, flags))
    }

    /// Floor `occurred_at` to its aggregate window.
    fn window_for(&self, occurred_at: DateTime<Utc>) -> CoreResult<(DateTime<Utc>, DateTime<Utc>)> {
        let width = self.aggregate_window_seconds;
        let start_ts = occurred_at.timestamp().div_euclid(width) * width;
        let start = DateTime::<Utc>::from_timestamp(start_ts, 0)
            .ok_or_else(|| CoreError::Internal("aggregate window out of range".to_string()))?;
        let end = DateTime::<Utc>::from_timestamp(start_ts + width, 0)
            .ok_or_else(|| CoreError::Internal("aggregate window out of range".to_string()))?;
        Ok((start, end))
    }
}
