use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use crate::{
    cache::{Cache, CacheExt, CacheKeys},
    cycle,
    db::DbPool,
    error::{CoreError, CoreResult},
    models::{PlanAssignment, Subject},
};

/// The resolver's answer: the effective assignments plus a freshness
/// indicator, so callers can tell a cached view from a store read.
#[derive(Debug, Clone)]
pub struct ResolvedAssignments {
    pub assignments: Vec<PlanAssignment>,
    pub from_cache: bool,
}

/// Resolves a subject's currently-effective assignments, newest first.
///
/// Reads go through a short-lived cache keyed by subject and minute bucket;
/// `strict` bypasses it. The cache is a correctness-neutral accelerator:
/// with no cache configured every lookup reads the store.
#[derive(Clone)]
pub struct AssignmentResolver {
    db: Arc<DbPool>,
    cache: Option<Arc<dyn Cache>>,
}

impl AssignmentResolver {
    pub fn new(db: Arc<DbPool>, cache: Option<Arc<dyn Cache>>) -> Self {
        Self { db, cache }
    }

    /// Assignments active at `at`, ordered `activated_at DESC, id DESC`.
    ///
    /// Store failures surface as `StoreUnavailable`; a stale cached set is
    /// never returned without `from_cache` saying so.
    pub async fn active(
        &self,
        subject: &Subject,
        at: DateTime<Utc>,
        strict: bool,
    ) -> CoreResult<ResolvedAssignments> {
        if !strict {
            if let Some(cache) = &self.cache {
                let key = CacheKeys::assignments(subject, at);
                match cache.get_json::<Vec<PlanAssignment>>(&key).await {
                    Ok(Some(assignments)) => {
                        return Ok(ResolvedAssignments {
                            assignments,
                            from_cache: true,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // A cache fault degrades to a store read.
                        tracing::warn!(error = %e, "Assignment cache read failed");
                    }
                }
            }
        }

        let assignments = self
            .db
            .assignments()
            .find_active(subject, at)
            .await
            .map_err(CoreError::from)?;

        if !strict {
            if let Some(cache) = &self.cache {
                let key = CacheKeys::assignments(subject, at);
                let ttl = self.entry_ttl(&assignments, at).await;
                if let Err(e) = cache.set_json(&key, &assignments, ttl).await {
                    tracing::warn!(error = %e, "Assignment cache write failed");
                }
            }
        }

        Ok(ResolvedAssignments {
            assignments,
            from_cache: false,
        })
    }

    /// Drop every cached view of the subject.
    ///
    /// Called synchronously before any write that changes the subject's
    /// assignment set, so a post-write read never sees the old set.
    pub async fn invalidate(&self, subject: &Subject) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.delete_prefix(&CacheKeys::subject_prefix(subject)).await {
                tracing::warn!(error = %e, "Assignment cache invalidation failed");
            }
        }
    }

    /// Entry TTL: expires at the next cycle boundary of the earliest-ending
    /// assignment, so a cached set never straddles a quota replenishment.
    async fn entry_ttl(&self, assignments: &[PlanAssignment], at: DateTime<Utc>) -> Duration {
        const DEFAULT_TTL: Duration = Duration::from_secs(60);

        let mut earliest: Option<DateTime<Utc>> = None;
        let mut consider = |candidate: DateTime<Utc>| {
            if candidate > at && earliest.map_or(true, |e| candidate < e) {
                earliest = Some(candidate);
            }
        };

        for assignment in assignments {
            if let Some(expires) = assignment.expires_at {
                consider(expires);
            }
            match self.db.plans().get_by_id(assignment.plan_id).await {
                Ok(Some(plan)) => {
                    if let Ok(window) = cycle::cycle_for(&plan, at) {
                        consider(window.end);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, plan_id = assignment.plan_id,
                        "Plan lookup for cache TTL failed");
                }
            }
        }

        match earliest {
            Some(boundary) => {
                // Never below one second, never more than an hour.
                let secs = (boundary - at).num_seconds().clamp(1, 3600) as u64;
                Duration::from_secs(secs)
            }
            None => DEFAULT_TTL,
        }
    }
}
