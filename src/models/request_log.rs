use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{QuotaMetric, Subject, SubjectType};

/// A persisted, normalized request record.
///
/// Subject identity is stored only as an anonymized hash; the raw id never
/// reaches this table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: i64,
    /// Idempotency key; at most one row per request id.
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
    /// Flag row ids attached to this request, if any.
    pub flag_ids: Option<Vec<i64>>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Raw telemetry as captured at the gateway edge, before normalization.
#[derive(Debug, Clone, Default)]
pub struct TelemetryEvent {
    pub request_id: String,
    pub occurred_at: Option<DateTime<Utc>>,
    pub model_alias: String,
    pub upstream_provider: String,
    pub subject: Option<Subject>,
    pub plan_id: Option<i64>,
    pub plan_assignment_id: Option<i64>,
    pub usage_metric: Option<QuotaMetric>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub latency_ms: i64,
    pub url: String,
    pub http_method: String,
    pub user_agent: String,
    pub params: BTreeMap<String, serde_json::Value>,
    pub cookies: String,
    pub auth_key: String,
    pub metadata: Option<serde_json::Value>,
}

/// Filter for request log listings. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct RequestLogFilter {
    pub model_alias: Option<String>,
    pub upstream_provider: Option<String>,
    pub subject_type: Option<SubjectType>,
    pub anonymized_subject_hash: Option<String>,
    pub occurred_after: Option<DateTime<Utc>>,
    pub occurred_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Why a request was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagReason {
    Abuse,
    Violation,
}

impl FlagReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagReason::Abuse => "abuse",
            FlagReason::Violation => "violation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "abuse" => Some(FlagReason::Abuse),
            "violation" => Some(FlagReason::Violation),
            _ => None,
        }
    }
}

/// An enforcement annotation attached to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFlag {
    pub id: i64,
    pub request_id: String,
    pub subject: Subject,
    pub reason: FlagReason,
    /// Model the request was rerouted to, when enforcement degraded it.
    pub rerouted_model_alias: Option<String>,
    /// When the flag stops influencing routing decisions.
    pub ttl_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Input for flagging a request.
#[derive(Debug, Clone)]
pub struct CreateRequestFlag {
    pub request_id: String,
    pub subject: Subject,
    pub reason: FlagReason,
    pub rerouted_model_alias: Option<String>,
    pub ttl_at: Option<DateTime<Utc>>,
}
