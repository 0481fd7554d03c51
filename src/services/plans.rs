use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use validator::Validate;

use super::resolver::AssignmentResolver;
use crate::{
    db::DbPool,
    error::{CoreError, CoreResult},
    models::{
        AssignmentOpts, CreatePlan, CycleType, NewAssignment, Plan, PlanAssignment, PlanFilter,
        Subject, UpdatePlan,
    },
};

/// Service layer for plan definitions and assignments.
///
/// Assignment-touching writes invalidate the resolver's cache for the
/// subject before the write returns, so the next resolution sees the new
/// set.
#[derive(Clone)]
pub struct PlanService {
    db: Arc<DbPool>,
    resolver: AssignmentResolver,
}

impl PlanService {
    pub fn new(db: Arc<DbPool>, resolver: AssignmentResolver) -> Self {
        Self { db, resolver }
    }

    /// Create a new plan.
    pub async fn create_plan(&self, input: CreatePlan) -> CoreResult<Plan> {
        input.validate()?;
        if input.cycle_type == CycleType::Custom && input.cycle_length_days < 1 {
            return Err(CoreError::InvalidArgument(
                "custom cycles require cycle_length_days >= 1".to_string(),
            ));
        }
        Ok(self.db.plans().create(input).await?)
    }

    /// Apply a partial update. Cycle shape and metric are immutable;
    /// quota changes take effect for prospective cycles only.
    pub async fn update_plan(&self, id: i64, input: UpdatePlan) -> CoreResult<Plan> {
        input.validate()?;
        Ok(self.db.plans().update(id, input).await?)
    }

    pub async fn get_plan(&self, id: i64) -> CoreResult<Option<Plan>> {
        Ok(self.db.plans().get_by_id(id).await?)
    }

    pub async fn get_plan_by_code(&self, code: &str) -> CoreResult<Option<Plan>> {
        Ok(self.db.plans().get_by_code(code).await?)
    }

    pub async fn list_plans(&self, filter: PlanFilter) -> CoreResult<Vec<Plan>> {
        Ok(self.db.plans().list(filter).await?)
    }

    /// Soft-delete a plan. Existing assignments keep their open cycles.
    pub async fn delete_plan(&self, id: i64) -> CoreResult<()> {
        Ok(self.db.plans().soft_delete(id).await?)
    }

    /// Bind a subject to a plan.
    ///
    /// The assignment's expiry defaults to the plan's `validity_days` and
    /// its carry policy to the plan's, both overridable through `opts`.
    pub async fn assign_plan(
        &self,
        subject: Subject,
        plan_id: i64,
        activated_at: DateTime<Utc>,
        opts: AssignmentOpts,
    ) -> CoreResult<PlanAssignment> {
        let plan = self
            .db
            .plans()
            .get_by_id(plan_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("plan {plan_id}")))?;

        let expires_at = opts.expires_at.or_else(|| {
            (plan.validity_days > 0)
                .then(|| activated_at + Duration::days(i64::from(plan.validity_days)))
        });

        let input = NewAssignment {
            subject,
            plan_id,
            billing_mode: opts.billing_mode,
            activated_at,
            expires_at,
            carry_policy: opts.carry_policy.unwrap_or(plan.carry_policy),
            auto_fallback_enabled: opts.auto_fallback_enabled,
            fallback_plan_id: opts.fallback_plan_id,
            metadata: opts.metadata,
        };

        // Invalidate before the write so no reader caches the old set
        // between the insert and the invalidation.
        self.resolver.invalidate(&subject).await;
        Ok(self.db.assignments().create(input).await?)
    }

    /// Terminate an assignment at the given instant.
    pub async fn deactivate_assignment(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> CoreResult<PlanAssignment> {
        let assignment = self
            .db
            .assignments()
            .get_by_id(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("assignment {id}")))?;

        self.resolver.invalidate(&assignment.subject).await;
        Ok(self.db.assignments().terminate(id, at).await?)
    }

    pub async fn get_assignment(&self, id: i64) -> CoreResult<Option<PlanAssignment>> {
        Ok(self.db.assignments().get_by_id(id).await?)
    }

    /// Every assignment ever held by the subject, newest first.
    pub async fn list_assignments(&self, subject: &Subject) -> CoreResult<Vec<PlanAssignment>> {
        Ok(self.db.assignments().list_for_subject(subject).await?)
    }
}
