use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::common::{
    decode_string_list, encode_string_list, map_unique_violation, parse_carry_policy,
    parse_cycle_type, parse_quota_metric,
};
use crate::{
    db::{
        error::{DbError, DbResult},
        repos::PlanRepo,
    },
    models::{CreatePlan, Plan, PlanFilter, UpdatePlan},
};

const PLAN_COLUMNS: &str = r#"
    id, code, name, description, cycle_type, cycle_length_days,
    quota_metric, quota_amount, carry_policy, carry_cap_percent,
    upstream_alias_whitelist, allowed_models, token_limit, validity_days,
    is_active, is_public, is_system, created_at, updated_at
"#;

pub struct SqlitePlanRepo {
    pool: SqlitePool,
}

impl SqlitePlanRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_plan(row: &sqlx::sqlite::SqliteRow) -> DbResult<Plan> {
        Ok(Plan {
            id: row.get("id"),
            code: row.get("code"),
            name: row.get("name"),
            description: row.get("description"),
            cycle_type: parse_cycle_type(&row.get::<String, _>("cycle_type"))?,
            cycle_length_days: row.get("cycle_length_days"),
            quota_metric: parse_quota_metric(&row.get::<String, _>("quota_metric"))?,
            quota_amount: row.get("quota_amount"),
            carry_policy: parse_carry_policy(&row.get::<String, _>("carry_policy"))?,
            carry_cap_percent: row.get("carry_cap_percent"),
            upstream_alias_whitelist: decode_string_list(row.get("upstream_alias_whitelist"))?,
            allowed_models: decode_string_list(row.get("allowed_models"))?,
            token_limit: row.get("token_limit"),
            validity_days: row.get("validity_days"),
            is_active: row.get("is_active"),
            is_public: row.get("is_public"),
            is_system: row.get("is_system"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl PlanRepo for SqlitePlanRepo {
    async fn create(&self, input: CreatePlan) -> DbResult<Plan> {
        let now = chrono::Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO plans (
                code, name, description, cycle_type, cycle_length_days,
                quota_metric, quota_amount, carry_policy, carry_cap_percent,
                upstream_alias_whitelist, allowed_models, token_limit,
                validity_days, is_active, is_public, is_system,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)
            "#,
        )
        .bind(&input.code)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.cycle_type.as_str())
        .bind(input.cycle_length_days)
        .bind(input.quota_metric.as_str())
        .bind(input.quota_amount)
        .bind(input.carry_policy.as_str())
        .bind(input.carry_cap_percent)
        .bind(encode_string_list(&input.upstream_alias_whitelist)?)
        .bind(encode_string_list(&input.allowed_models)?)
        .bind(input.token_limit)
        .bind(input.validity_days)
        .bind(input.is_public)
        .bind(input.is_system)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_unique_violation(e, format!("Plan code '{}' already exists", input.code))
        })?;

        let id = result.last_insert_rowid();
        self.get_by_id(id).await?.ok_or(DbError::NotFound)
    }

    async fn get_by_id(&self, id: i64) -> DbResult<Option<Plan>> {
        let row = sqlx::query(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE id = ? AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_plan).transpose()
    }

    async fn get_by_code(&self, code: &str) -> DbResult<Option<Plan>> {
        let row = sqlx::query(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE code = ? AND deleted_at IS NULL"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_plan).transpose()
    }

    async fn list(&self, filter: PlanFilter) -> DbResult<Vec<Plan>> {
        let mut conditions = vec!["deleted_at IS NULL".to_string()];
        if !filter.include_inactive {
            conditions.push("is_active = 1".to_string());
        }
        if filter.only_public {
            conditions.push("is_public = 1".to_string());
        }
        if !filter.include_system {
            conditions.push("is_system = 0".to_string());
        }

        let query = format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE {} ORDER BY created_at DESC, id DESC",
            conditions.join(" AND ")
        );

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_plan).collect()
    }

    async fn update(&self, id: i64, input: UpdatePlan) -> DbResult<Plan> {
        let now = chrono::Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE plans SET
                name = COALESCE(?, name),
                description = COALESCE(?, description),
                quota_amount = COALESCE(?, quota_amount),
                carry_policy = COALESCE(?, carry_policy),
                carry_cap_percent = COALESCE(?, carry_cap_percent),
                is_active = COALESCE(?, is_active),
                updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(input.name)
        .bind(input.description)
        .bind(input.quota_amount)
        .bind(input.carry_policy.map(|p| p.as_str()))
        .bind(input.carry_cap_percent)
        .bind(input.is_active)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }

        self.get_by_id(id).await?.ok_or(DbError::NotFound)
    }

    async fn soft_delete(&self, id: i64) -> DbResult<()> {
        let now = chrono::Utc::now();

        let result =
            sqlx::query("UPDATE plans SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL")
                .bind(now)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }
}
