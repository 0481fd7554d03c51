use async_trait::async_trait;

use crate::{
    db::error::DbResult,
    models::{CreatePlan, Plan, PlanFilter, UpdatePlan},
};

#[async_trait]
pub trait PlanRepo: Send + Sync {
    /// Create a plan. Fails with `DbError::Conflict` when the code is
    /// already taken by a non-deleted plan.
    async fn create(&self, input: CreatePlan) -> DbResult<Plan>;

    async fn get_by_id(&self, id: i64) -> DbResult<Option<Plan>>;

    /// Look up a non-deleted plan by its business code.
    async fn get_by_code(&self, code: &str) -> DbResult<Option<Plan>>;

    async fn list(&self, filter: PlanFilter) -> DbResult<Vec<Plan>>;

    /// Apply a partial update. Cycle shape and metric are immutable.
    async fn update(&self, id: i64, input: UpdatePlan) -> DbResult<Plan>;

    /// Soft-delete a plan. Existing assignments keep working; the code
    /// becomes reusable.
    async fn soft_delete(&self, id: i64) -> DbResult<()>;
}
