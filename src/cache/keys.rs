use chrono::{DateTime, Utc};

use crate::models::Subject;

pub struct CacheKeys;

impl CacheKeys {
    /// Resolved assignments for a subject: pa:{type}:{id}:{minute_bucket}
    ///
    /// The minute bucket makes entries self-invalidating: a lookup one
    /// minute later computes a different key and misses, so a stale entry
    /// can never outlive its bucket by more than the entry TTL.
    pub fn assignments(subject: &Subject, at: DateTime<Utc>) -> String {
        let bucket = at.timestamp() / 60;
        format!("pa:{}:{}:{}", subject.type_str(), subject.id(), bucket)
    }

    /// Prefix covering every bucket of a subject, for invalidation.
    pub fn subject_prefix(subject: &Subject) -> String {
        format!("pa:{}:{}:", subject.type_str(), subject.id())
    }
}
