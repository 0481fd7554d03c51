use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::common::{
    decode_json, encode_json, parse_billing_mode, parse_carry_policy, parse_quota_metric,
    parse_subject,
};
use crate::{
    cycle::CycleWindow,
    db::{
        error::{DbError, DbResult},
        repos::{AssignmentRepo, NewCarryEntry},
    },
    models::{
        BillingMode, CarryLedgerEntry, ConsumeOutcome, NewAssignment, PlanAssignment, QuotaMetric,
        Subject,
    },
};

const ASSIGNMENT_COLUMNS: &str = r#"
    id, subject_type, subject_id, plan_id, billing_mode,
    activated_at, deactivated_at, expires_at, carry_policy,
    auto_fallback_enabled, fallback_plan_id, metadata, created_at, updated_at
"#;

pub struct SqliteAssignmentRepo {
    pool: SqlitePool,
}

impl SqliteAssignmentRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_assignment(row: &sqlx::sqlite::SqliteRow) -> DbResult<PlanAssignment> {
        Ok(PlanAssignment {
            id: row.get("id"),
            subject: parse_subject(
                &row.get::<String, _>("subject_type"),
                row.get("subject_id"),
            )?,
            plan_id: row.get("plan_id"),
            billing_mode: parse_billing_mode(&row.get::<String, _>("billing_mode"))?,
            activated_at: row.get("activated_at"),
            deactivated_at: row.get("deactivated_at"),
            expires_at: row.get("expires_at"),
            carry_policy: parse_carry_policy(&row.get::<String, _>("carry_policy"))?,
            auto_fallback_enabled: row.get("auto_fallback_enabled"),
            fallback_plan_id: row.get("fallback_plan_id"),
            metadata: decode_json(row.get("metadata"))?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_carry_entry(row: &sqlx::sqlite::SqliteRow) -> DbResult<CarryLedgerEntry> {
        Ok(CarryLedgerEntry {
            id: row.get("id"),
            plan_assignment_id: row.get("plan_assignment_id"),
            metric: parse_quota_metric(&row.get::<String, _>("metric"))?,
            cycle_start: row.get("cycle_start"),
            amount: row.get("amount"),
            expires_at: row.get("expires_at"),
            created_at: row.get("created_at"),
        })
    }

    async fn insert_assignment<'e, E>(executor: E, input: &NewAssignment) -> DbResult<i64>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let now = chrono::Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO plan_assignments (
                subject_type, subject_id, plan_id, billing_mode,
                activated_at, expires_at, carry_policy,
                auto_fallback_enabled, fallback_plan_id, metadata,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(input.subject.type_str())
        .bind(input.subject.id())
        .bind(input.plan_id)
        .bind(input.billing_mode.as_str())
        .bind(input.activated_at)
        .bind(input.expires_at)
        .bind(input.carry_policy.as_str())
        .bind(input.auto_fallback_enabled)
        .bind(input.fallback_plan_id)
        .bind(encode_json(&input.metadata)?)
        .bind(now)
        .bind(now)
        .execute(executor)
        .await?;

        Ok(result.last_insert_rowid())
    }
}

#[async_trait]
impl AssignmentRepo for SqliteAssignmentRepo {
    async fn create(&self, input: NewAssignment) -> DbResult<PlanAssignment> {
        let id = Self::insert_assignment(&self.pool, &input).await?;
        self.get_by_id(id).await?.ok_or(DbError::NotFound)
    }

    async fn get_by_id(&self, id: i64) -> DbResult<Option<PlanAssignment>> {
        let row = sqlx::query(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM plan_assignments WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_assignment).transpose()
    }

    async fn find_active(
        &self,
        subject: &Subject,
        at: DateTime<Utc>,
    ) -> DbResult<Vec<PlanAssignment>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ASSIGNMENT_COLUMNS} FROM plan_assignments
            WHERE subject_type = ? AND subject_id = ?
              AND activated_at <= ?
              AND (deactivated_at IS NULL OR deactivated_at > ?)
              AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY activated_at DESC, id DESC
            "#
        ))
        .bind(subject.type_str())
        .bind(subject.id())
        .bind(at)
        .bind(at)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_assignment).collect()
    }

    async fn list_for_subject(&self, subject: &Subject) -> DbResult<Vec<PlanAssignment>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ASSIGNMENT_COLUMNS} FROM plan_assignments
            WHERE subject_type = ? AND subject_id = ?
            ORDER BY activated_at DESC, id DESC
            "#
        ))
        .bind(subject.type_str())
        .bind(subject.id())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_assignment).collect()
    }

    async fn terminate(&self, id: i64, at: DateTime<Utc>) -> DbResult<PlanAssignment> {
        let result = sqlx::query(
            r#"
            UPDATE plan_assignments SET deactivated_at = ?, updated_at = ?
            WHERE id = ? AND deactivated_at IS NULL
            "#,
        )
        .bind(at)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_by_id(id).await? {
                Some(_) => Err(DbError::Conflict("Assignment already terminated".to_string())),
                None => Err(DbError::NotFound),
            };
        }

        self.get_by_id(id).await?.ok_or(DbError::NotFound)
    }

    async fn record_carry(&self, entry: NewCarryEntry) -> DbResult<CarryLedgerEntry> {
        let now = chrono::Utc::now();

        // INSERT OR IGNORE keeps a concurrent duplicate write harmless;
        // the unique index on (assignment, metric, cycle_start) makes the
        // entry at-most-once per cycle transition.
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO carry_ledger (
                plan_assignment_id, metric, cycle_start, amount, expires_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.plan_assignment_id)
        .bind(entry.metric.as_str())
        .bind(entry.cycle_start)
        .bind(entry.amount)
        .bind(entry.expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT id, plan_assignment_id, metric, cycle_start, amount, expires_at, created_at
            FROM carry_ledger
            WHERE plan_assignment_id = ? AND metric = ? AND cycle_start = ?
            "#,
        )
        .bind(entry.plan_assignment_id)
        .bind(entry.metric.as_str())
        .bind(entry.cycle_start)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_carry_entry(&row)
    }

    async fn carry_for(
        &self,
        plan_assignment_id: i64,
        metric: QuotaMetric,
        cycle_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<i64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount), 0) as total
            FROM carry_ledger
            WHERE plan_assignment_id = ? AND metric = ? AND cycle_start = ?
              AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(plan_assignment_id)
        .bind(metric.as_str())
        .bind(cycle_start)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("total"))
    }

    async fn carry_ledger(&self, plan_assignment_id: i64) -> DbResult<Vec<CarryLedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, plan_assignment_id, metric, cycle_start, amount, expires_at, created_at
            FROM carry_ledger
            WHERE plan_assignment_id = ?
            ORDER BY cycle_start ASC, id ASC
            "#,
        )
        .bind(plan_assignment_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_carry_entry).collect()
    }

    async fn consume_fallback(
        &self,
        subject: &Subject,
        fallback_plan_id: i64,
        metric: QuotaMetric,
        window: CycleWindow,
        amount: i64,
        ceiling: i64,
        now: DateTime<Utc>,
    ) -> DbResult<(PlanAssignment, ConsumeOutcome)> {
        let mut tx = self.pool.begin().await?;

        // Reuse an existing live fallback assignment for this plan, else
        // create one. Done inside the transaction so two concurrent
        // exhausted requests converge on a single fallback assignment.
        let existing = sqlx::query(&format!(
            r#"
            SELECT {ASSIGNMENT_COLUMNS} FROM plan_assignments
            WHERE subject_type = ? AND subject_id = ?
              AND plan_id = ? AND billing_mode = ?
              AND activated_at <= ?
              AND (deactivated_at IS NULL OR deactivated_at > ?)
              AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY activated_at DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(subject.type_str())
        .bind(subject.id())
        .bind(fallback_plan_id)
        .bind(BillingMode::Fallback.as_str())
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let assignment_id = match &existing {
            Some(row) => row.get::<i64, _>("id"),
            None => {
                let input = NewAssignment {
                    subject: *subject,
                    plan_id: fallback_plan_id,
                    billing_mode: BillingMode::Fallback,
                    activated_at: now,
                    expires_at: None,
                    carry_policy: crate::models::CarryPolicy::None,
                    auto_fallback_enabled: false,
                    fallback_plan_id: None,
                    metadata: None,
                };
                Self::insert_assignment(&mut *tx, &input).await?
            }
        };

        // Open the cycle counter if this is the first charge of the cycle.
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO usage_counters (
                plan_assignment_id, metric, cycle_start, cycle_end,
                consumed_amount, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(assignment_id)
        .bind(metric.as_str())
        .bind(window.start)
        .bind(window.end)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // Conditional increment: only charges when the result stays under
        // the ceiling.
        let charged = sqlx::query(
            r#"
            UPDATE usage_counters
            SET consumed_amount = consumed_amount + ?, updated_at = ?
            WHERE plan_assignment_id = ? AND metric = ? AND cycle_start = ?
              AND consumed_amount + ? <= ?
            "#,
        )
        .bind(amount)
        .bind(now)
        .bind(assignment_id)
        .bind(metric.as_str())
        .bind(window.start)
        .bind(amount)
        .bind(ceiling)
        .execute(&mut *tx)
        .await?;

        let consumed: i64 = sqlx::query(
            r#"
            SELECT consumed_amount FROM usage_counters
            WHERE plan_assignment_id = ? AND metric = ? AND cycle_start = ?
            "#,
        )
        .bind(assignment_id)
        .bind(metric.as_str())
        .bind(window.start)
        .fetch_one(&mut *tx)
        .await?
        .get("consumed_amount");

        let assignment_row = sqlx::query(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM plan_assignments WHERE id = ?"
        ))
        .bind(assignment_id)
        .fetch_one(&mut *tx)
        .await?;
        let assignment = Self::row_to_assignment(&assignment_row)?;

        tx.commit().await?;

        let outcome = if charged.rows_affected() > 0 {
            ConsumeOutcome::Consumed {
                remaining: (ceiling - consumed).max(0),
            }
        } else {
            ConsumeOutcome::Exceeded {
                remaining: (ceiling - consumed).max(0),
            }
        };

        Ok((assignment, outcome))
    }
}
