use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    db::error::DbResult,
    models::{
        CreateRequestFlag, QuotaMetric, RequestFlag, RequestLog, RequestLogFilter, SubjectType,
    },
};

/// A fully normalized record ready for insertion.
#[derive(Debug, Clone)]
pub struct NewRequestLog {
    pub request_id: String,
    pub occurred_at: DateTime<Utc>,
    pub model_alias: String,
    pub upstream_provider: String,
    pub subject_type: SubjectType,
    pub anonymized_subject_hash: String,
    pub plan_id: Option<i64>,
    pub plan_assignment_id: Option<i64>,
    pub usage_metric: QuotaMetric,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub latency_ms: i64,
    pub normalized_url: String,
    pub http_method: String,
    pub user_agent: String,
    pub param_digest: String,
    pub sanitized_cookies: String,
    pub auth_key_fingerprint: String,
    pub metadata: Option<serde_json::Value>,
}

#[async_trait]
pub trait RequestLogRepo: Send + Sync {
    /// At-most-once insert keyed by `request_id`. Returns false when a row
    /// with the same request id already exists; the duplicate is dropped
    /// without error.
    async fn insert(&self, log: NewRequestLog) -> DbResult<bool>;

    async fn get_by_request_id(&self, request_id: &str) -> DbResult<Option<RequestLog>>;

    /// Filtered listing, newest occurrence first.
    async fn list(&self, filter: RequestLogFilter) -> DbResult<Vec<RequestLog>>;

    /// Attach a flag to a request and record it on the log row's flag
    /// list when the log already exists.
    async fn create_flag(&self, input: CreateRequestFlag) -> DbResult<RequestFlag>;

    async fn flags_for(&self, request_id: &str) -> DbResult<Vec<RequestFlag>>;

    /// Delete logs older than the cutoff, in batches to keep the write
    /// lock short. Returns the number of rows deleted.
    async fn delete_logs_before(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: u32,
        max_deletes: u64,
    ) -> DbResult<u64>;

    /// Delete flags whose ttl has passed. Returns the number deleted.
    async fn delete_expired_flags(&self, now: DateTime<Utc>) -> DbResult<u64>;
}
