use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::resolver::AssignmentResolver;
use crate::{
    clock::SharedClock,
    config::AccountingConfig,
    cycle::{self, CycleWindow},
    db::{DbPool, NewCarryEntry},
    error::{CoreError, CoreResult},
    models::{BillingMode, CarryPolicy, ConsumeOutcome, Plan, PlanAssignment, QuotaMetric, Subject},
};

/// The pre-request question: may this subject spend `amount` units now?
#[derive(Debug, Clone)]
pub struct QuotaCheckRequest {
    /// Caller-supplied id for one logical request. The gate itself is not
    /// idempotent on it; the telemetry recorder's uniqueness is.
    pub correlation_id: String,
    pub subject: Subject,
    pub metric: QuotaMetric,
    pub amount: i64,
    /// Model alias the request targets; plans with a whitelist that
    /// excludes it are skipped. None skips the check.
    pub model_alias: Option<String>,
    /// Bypass the resolver cache. Defaults to the configured value.
    pub strict: Option<bool>,
    /// The decision is abandoned with `Cancelled` once this passes.
    pub deadline: Option<DateTime<Utc>>,
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NoPlan,
    QuotaExceeded,
}

/// The gate's decision. `Allow` and `AllowFallback` mean the amount has
/// already been charged; there is no separate commit step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow {
        assignment_id: i64,
        plan_id: i64,
    },
    AllowFallback {
        assignment_id: i64,
        plan_id: i64,
    },
    Deny {
        reason: DenyReason,
    },
}

/// Composes the assignment resolver and the usage counters to admit or
/// deny a spend, charging exactly one assignment on success.
#[derive(Clone)]
pub struct QuotaGate {
    db: Arc<DbPool>,
    resolver: AssignmentResolver,
    clock: SharedClock,
    strict_default: bool,
    fallback_plan_code: Option<String>,
    carry_cap_default_percent: i64,
}

impl QuotaGate {
    pub fn new(
        db: Arc<DbPool>,
        resolver: AssignmentResolver,
        clock: SharedClock,
        config: &AccountingConfig,
    ) -> Self {
        Self {
            db,
            resolver,
            clock,
            strict_default: config.strict_quota_default,
            fallback_plan_code: config.fallback_plan_code.clone(),
            carry_cap_default_percent: config.carry_over_cap_default_percent,
        }
    }

    /// Decide whether the subject may spend `amount` units of `metric`.
    ///
    /// Assignments are consumed newest-first. The check and the charge for
    /// a given assignment commit in one store transaction, so the sum of
    /// admitted amounts never exceeds `quota + carry` for any cycle.
    pub async fn check(&self, request: QuotaCheckRequest) -> CoreResult<Decision> {
        if request.amount < 0 {
            return Err(CoreError::InvalidArgument(
                "amount must be non-negative".to_string(),
            ));
        }

        let now = self.clock.now();
        self.check_deadline(&request, now)?;

        let strict = request.strict.unwrap_or(self.strict_default);
        let resolved = self.resolver.active(&request.subject, now, strict).await?;
        if resolved.assignments.is_empty() {
            return Ok(Decision::Deny {
                reason: DenyReason::NoPlan,
            });
        }

        for assignment in &resolved.assignments {
            let plan = match self.db.plans().get_by_id(assignment.plan_id).await? {
                Some(plan) if plan.is_active => plan,
                // Soft-deleted or deactivated plans are skipped, not denied.
                _ => continue,
            };

            if let Some(model) = &request.model_alias {
                if !plan.is_model_allowed(model) {
                    continue;
                }
            }

            let window = cycle::cycle_for(&plan, now)?;
            let ceiling = plan.quota_amount
                + self
                    .carried_amount(assignment, &plan, request.metric, window, now)
                    .await?;

            // Deadline gates the lock acquisition, not the whole loop.
            self.check_deadline(&request, self.clock.now())?;

            let outcome = self
                .db
                .usage_counters()
                .check_and_consume(assignment.id, request.metric, window, request.amount, ceiling)
                .await?;

            if let ConsumeOutcome::Consumed { remaining } = outcome {
                tracing::debug!(
                    correlation_id = %request.correlation_id,
                    assignment_id = assignment.id,
                    plan_id = plan.id,
                    remaining,
                    "Quota check allowed"
                );
                // A previously-created inline fallback assignment sits in
                // the resolved set like any other; keep reporting it as a
                // fallback admit.
                return Ok(if assignment.billing_mode == BillingMode::Fallback {
                    Decision::AllowFallback {
                        assignment_id: assignment.id,
                        plan_id: plan.id,
                    }
                } else {
                    Decision::Allow {
                        assignment_id: assignment.id,
                        plan_id: plan.id,
                    }
                });
            }
        }

        // Exhausted every assignment; try the inline fallback of the
        // newest one.
        if let Some(decision) = self.try_fallback(&request, &resolved.assignments[0], now).await? {
            return Ok(decision);
        }

        Ok(Decision::Deny {
            reason: DenyReason::QuotaExceeded,
        })
    }

    fn check_deadline(&self, request: &QuotaCheckRequest, now: DateTime<Utc>) -> CoreResult<()> {
        match request.deadline {
            Some(deadline) if now >= deadline => Err(CoreError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Unused quota rolled forward from the previous cycle, plus any
    /// credit booked to the ledger for this cycle.
    ///
    /// The roll-forward write is idempotent per cycle transition, so two
    /// concurrent first-checks of a new cycle record it once.
    async fn carried_amount(
        &self,
        assignment: &PlanAssignment,
        plan: &Plan,
        metric: QuotaMetric,
        window: CycleWindow,
        now: DateTime<Utc>,
    ) -> CoreResult<i64> {
        if assignment.carry_policy != CarryPolicy::None {
            if let Some(previous) = self
                .db
                .usage_counters()
                .latest_ended_before(assignment.id, metric, window.start)
                .await?
            {
                let unused = (plan.quota_amount - previous.consumed_amount).max(0);
                let carried = match assignment.carry_policy {
                    CarryPolicy::None => 0,
                    CarryPolicy::CarryAll => unused,
                    CarryPolicy::Cap => {
                        let cap_percent = if plan.carry_cap_percent > 0 {
                            i64::from(plan.carry_cap_percent)
                        } else {
                            self.carry_cap_default_percent
                        };
                        unused.min(plan.quota_amount * cap_percent / 100)
                    }
                };
                if carried > 0 {
                    self.db
                        .assignments()
                        .record_carry(NewCarryEntry {
                            plan_assignment_id: assignment.id,
                            metric,
                            cycle_start: window.start,
                            amount: carried,
                            expires_at: None,
                        })
                        .await?;
                }
            }
        }

        Ok(self
            .db
            .assignments()
            .carry_for(assignment.id, metric, window.start, now)
            .await?)
    }

    /// Create-or-reuse an inline `fallback`-mode assignment and charge it.
    async fn try_fallback(
        &self,
        request: &QuotaCheckRequest,
        primary: &PlanAssignment,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Decision>> {
        if !primary.auto_fallback_enabled {
            return Ok(None);
        }

        let fallback_plan_id = match primary.fallback_plan_id {
            Some(id) => Some(id),
            None => match &self.fallback_plan_code {
                Some(code) => self.db.plans().get_by_code(code).await?.map(|p| p.id),
                None => None,
            },
        };
        let Some(fallback_plan_id) = fallback_plan_id else {
            return Ok(None);
        };

        let plan = match self.db.plans().get_by_id(fallback_plan_id).await? {
            Some(plan) if plan.is_active => plan,
            _ => return Ok(None),
        };

        if let Some(model) = &request.model_alias {
            if !plan.is_model_allowed(model) {
                return Ok(None);
            }
        }

        let window = cycle::cycle_for(&plan, now)?;
        self.check_deadline(request, self.clock.now())?;

        // Fallback assignments never carry over.
        let (assignment, outcome) = self
            .db
            .assignments()
            .consume_fallback(
                &request.subject,
                fallback_plan_id,
                request.metric,
                window,
                request.amount,
                plan.quota_amount,
                now,
            )
            .await?;

        match outcome {
            ConsumeOutcome::Consumed { .. } => {
                // The resolver may have cached a set without the new
                // fallback assignment.
                self.resolver.invalidate(&request.subject).await;
                tracing::debug!(
                    correlation_id = %request.correlation_id,
                    assignment_id = assignment.id,
                    plan_id = plan.id,
                    "Quota check allowed via fallback"
                );
                Ok(Some(Decision::AllowFallback {
                    assignment_id: assignment.id,
                    plan_id: plan.id,
                }))
            }
            ConsumeOutcome::Exceeded { .. } => Ok(None),
        }
    }
}
