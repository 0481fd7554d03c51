use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SubjectType;

/// A rolled-up usage window, keyed by model, upstream, subject type and the
/// half-open `[window_start, window_end)` interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestAggregate {
    pub id: i64,
    pub model_alias: String,
    pub upstream: String,
    pub subject_type: SubjectType,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_requests: i64,
    pub total_tokens: i64,
    /// Distinct-subject estimate. Merges take the max of contributions
    /// rather than summing, so overlapping estimators never inflate it.
    pub unique_subjects: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A delta to merge into an aggregate window.
///
/// Counts are summed; `unique_subjects` is max-merged. Per-request
/// contributions carry `unique_subjects: 0` and leave the estimate to a
/// dedicated estimator pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateContribution {
    pub model_alias: String,
    pub upstream: String,
    pub subject_type: SubjectType,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_requests: i64,
    pub total_tokens: i64,
    pub unique_subjects: i64,
}

impl AggregateContribution {
    /// Contribution for a single observed request.
    pub fn for_request(
        model_alias: impl Into<String>,
        upstream: impl Into<String>,
        subject_type: SubjectType,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        tokens: i64,
    ) -> Self {
        Self {
            model_alias: model_alias.into(),
            upstream: upstream.into(),
            subject_type,
            window_start,
            window_end,
            total_requests: 1,
            total_tokens: tokens,
            unique_subjects: 0,
        }
    }
}

/// Filter for aggregate window listings.
#[derive(Debug, Clone, Default)]
pub struct AggregateFilter {
    pub model_alias: Option<String>,
    pub upstream: Option<String>,
    pub subject_type: Option<SubjectType>,
    pub window_start_after: Option<DateTime<Utc>>,
    pub window_end_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}
