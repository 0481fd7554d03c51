use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::common::parse_quota_metric;
use crate::{
    cycle::CycleWindow,
    db::{
        error::{DbError, DbResult},
        repos::UsageCounterRepo,
    },
    models::{ConsumeOutcome, QuotaMetric, UsageCounter},
};

const COUNTER_COLUMNS: &str = r#"
    id, plan_assignment_id, metric, cycle_start, cycle_end,
    consumed_amount, created_at, updated_at
"#;

pub struct SqliteUsageCounterRepo {
    pool: SqlitePool,
}

impl SqliteUsageCounterRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_counter(row: &sqlx::sqlite::SqliteRow) -> DbResult<UsageCounter> {
        Ok(UsageCounter {
            id: row.get("id"),
            plan_assignment_id: row.get("plan_assignment_id"),
            metric: parse_quota_metric(&row.get::<String, _>("metric"))?,
            cycle_start: row.get("cycle_start"),
            cycle_end: row.get("cycle_end"),
            consumed_amount: row.get("consumed_amount"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn open_counter<'e, E>(
        executor: E,
        plan_assignment_id: i64,
        metric: QuotaMetric,
        window: &CycleWindow,
        now: DateTime<Utc>,
    ) -> DbResult<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO usage_counters (
                plan_assignment_id, metric, cycle_start, cycle_end,
                consumed_amount, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(plan_assignment_id)
        .bind(metric.as_str())
        .bind(window.start)
        .bind(window.end)
        .bind(now)
        .bind(now)
        .execute(executor)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl UsageCounterRepo for SqliteUsageCounterRepo {
    async fn get(
        &self,
        plan_assignment_id: i64,
        metric: QuotaMetric,
        cycle_start: DateTime<Utc>,
    ) -> DbResult<Option<UsageCounter>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {COUNTER_COLUMNS} FROM usage_counters
            WHERE plan_assignment_id = ? AND metric = ? AND cycle_start = ?
            "#
        ))
        .bind(plan_assignment_id)
        .bind(metric.as_str())
        .bind(cycle_start)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_counter).transpose()
    }

    async fn increment(
        &self,
        plan_assignment_id: i64,
        metric: QuotaMetric,
        window: CycleWindow,
        amount: i64,
    ) -> DbResult<UsageCounter> {
        if amount < 0 {
            return Err(DbError::Validation(
                "Increment amount cannot be negative".to_string(),
            ));
        }
        // Zero is a no-op: nothing is written and no cycle row is opened.
        if amount == 0 {
            let now = chrono::Utc::now();
            return match self.get(plan_assignment_id, metric, window.start).await? {
                Some(counter) => Ok(counter),
                None => Ok(UsageCounter {
                    id: 0,
                    plan_assignment_id,
                    metric,
                    cycle_start: window.start,
                    cycle_end: window.end,
                    consumed_amount: 0,
                    created_at: now,
                    updated_at: now,
                }),
            };
        }

        let now = chrono::Utc::now();

        // cycle_end only ever moves forward, so a late increment carrying a
        // stale window cannot shrink an already-open cycle.
        sqlx::query(
            r#"
            INSERT INTO usage_counters (
                plan_assignment_id, metric, cycle_start, cycle_end,
                consumed_amount, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (plan_assignment_id, metric, cycle_start)
            DO UPDATE SET
                consumed_amount = consumed_amount + excluded.consumed_amount,
                cycle_end = MAX(cycle_end, excluded.cycle_end),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(plan_assignment_id)
        .bind(metric.as_str())
        .bind(window.start)
        .bind(window.end)
        .bind(amount)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!(
            r#"
            SELECT {COUNTER_COLUMNS} FROM usage_counters
            WHERE plan_assignment_id = ? AND metric = ? AND cycle_start = ?
            "#
        ))
        .bind(plan_assignment_id)
        .bind(metric.as_str())
        .bind(window.start)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_counter(&row)
    }

    async fn check_and_consume(
        &self,
        plan_assignment_id: i64,
        metric: QuotaMetric,
        window: CycleWindow,
        amount: i64,
        ceiling: i64,
    ) -> DbResult<ConsumeOutcome> {
        let now = chrono::Utc::now();
        let mut tx = self.pool.begin().await?;

        Self::open_counter(&mut *tx, plan_assignment_id, metric, &window, now).await?;

        // The WHERE clause makes check and charge one atomic statement; a
        // losing racer sees rows_affected == 0.
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
        .bind(plan_assignment_id)
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
        .bind(plan_assignment_id)
        .bind(metric.as_str())
        .bind(window.start)
        .fetch_one(&mut *tx)
        .await?
        .get("consumed_amount");

        tx.commit().await?;

        let remaining = (ceiling - consumed).max(0);
        if charged.rows_affected() > 0 {
            Ok(ConsumeOutcome::Consumed { remaining })
        } else {
            Ok(ConsumeOutcome::Exceeded { remaining })
        }
    }

    async fn latest_ended_before(
        &self,
        plan_assignment_id: i64,
        metric: QuotaMetric,
        before: DateTime<Utc>,
    ) -> DbResult<Option<UsageCounter>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {COUNTER_COLUMNS} FROM usage_counters
            WHERE plan_assignment_id = ? AND metric = ? AND cycle_end <= ?
            ORDER BY cycle_end DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(plan_assignment_id)
        .bind(metric.as_str())
        .bind(before)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_counter).transpose()
    }

    async fn reset(
        &self,
        plan_assignment_id: i64,
        metric: QuotaMetric,
        cycle_start: DateTime<Utc>,
    ) -> DbResult<()> {
        // Deleting the row (rather than zeroing it) means a voided cycle no
        // longer exists for carry-over: latest_ended_before skips it instead
        // of reading a full unused quota out of it.
        sqlx::query(
            r#"
            DELETE FROM usage_counters
            WHERE plan_assignment_id = ? AND metric = ? AND cycle_start = ?
            "#,
        )
        .bind(plan_assignment_id)
        .bind(metric.as_str())
        .bind(cycle_start)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
