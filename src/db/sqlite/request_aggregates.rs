use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::common::parse_subject_type;
use crate::{
    db::{error::DbResult, repos::RequestAggregateRepo},
    models::{AggregateContribution, AggregateFilter, RequestAggregate, SubjectType},
};

const AGGREGATE_COLUMNS: &str = r#"
    id, model_alias, upstream, subject_type, window_start, window_end,
    total_requests, total_tokens, unique_subjects, created_at, updated_at
"#;

pub struct SqliteRequestAggregateRepo {
    pool: SqlitePool,
}

impl SqliteRequestAggregateRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_aggregate(row: &sqlx::sqlite::SqliteRow) -> DbResult<RequestAggregate> {
        Ok(RequestAggregate {
            id: row.get("id"),
            model_alias: row.get("model_alias"),
            upstream: row.get("upstream"),
            subject_type: parse_subject_type(&row.get::<String, _>("subject_type"))?,
            window_start: row.get("window_start"),
            window_end: row.get("window_end"),
            total_requests: row.get("total_requests"),
            total_tokens: row.get("total_tokens"),
            unique_subjects: row.get("unique_subjects"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl RequestAggregateRepo for SqliteRequestAggregateRepo {
    async fn merge(&self, contribution: AggregateContribution) -> DbResult<RequestAggregate> {
        let now = chrono::Utc::now();

        // Sums accumulate; unique_subjects max-merges so replayed or
        // overlapping estimates cannot inflate the distinct count.
        sqlx::query(
            r#"
            INSERT INTO request_aggregates (
                model_alias, upstream, subject_type, window_start, window_end,
                total_requests, total_tokens, unique_subjects,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (model_alias, upstream, subject_type, window_start, window_end)
            DO UPDATE SET
                total_requests = total_requests + excluded.total_requests,
                total_tokens = total_tokens + excluded.total_tokens,
                unique_subjects = CASE
                    WHEN excluded.unique_subjects > unique_subjects
                    THEN excluded.unique_subjects
                    ELSE unique_subjects
                END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&contribution.model_alias)
        .bind(&contribution.upstream)
        .bind(contribution.subject_type.as_str())
        .bind(contribution.window_start)
        .bind(contribution.window_end)
        .bind(contribution.total_requests)
        .bind(contribution.total_tokens)
        .bind(contribution.unique_subjects)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_window(
            &contribution.model_alias,
            &contribution.upstream,
            contribution.subject_type,
            contribution.window_start,
            contribution.window_end,
        )
        .await?
        .ok_or_else(|| {
            crate::db::error::DbError::Internal("Merge failed to retrieve result".to_string())
        })
    }

    async fn get_window(
        &self,
        model_alias: &str,
        upstream: &str,
        subject_type: SubjectType,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> DbResult<Option<RequestAggregate>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {AGGREGATE_COLUMNS} FROM request_aggregates
            WHERE model_alias = ? AND upstream = ? AND subject_type = ?
              AND window_start = ? AND window_end = ?
            "#
        ))
        .bind(model_alias)
        .bind(upstream)
        .bind(subject_type.as_str())
        .bind(window_start)
        .bind(window_end)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_aggregate).transpose()
    }

    async fn list(&self, filter: AggregateFilter) -> DbResult<Vec<RequestAggregate>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(model) = &filter.model_alias {
            conditions.push("model_alias = ?".to_string());
            binds.push(model.clone());
        }
        if let Some(upstream) = &filter.upstream {
            conditions.push("upstream = ?".to_string());
            binds.push(upstream.clone());
        }
        if let Some(subject_type) = filter.subject_type {
            conditions.push("subject_type = ?".to_string());
            binds.push(subject_type.as_str().to_string());
        }
        if let Some(after) = filter.window_start_after {
            conditions.push("window_start >= ?".to_string());
            binds.push(after.to_rfc3339());
        }
        if let Some(before) = filter.window_end_before {
            conditions.push("window_end < ?".to_string());
            binds.push(before.to_rfc3339());
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            r#"
            SELECT {AGGREGATE_COLUMNS} FROM request_aggregates
            {where_clause}
            ORDER BY window_start DESC, id DESC
            LIMIT ?
            "#
        );

        let mut query_builder = sqlx::query(&query);
        for bind in &binds {
            query_builder = query_builder.bind(bind);
        }
        query_builder = query_builder.bind(filter.limit.unwrap_or(100));

        let rows = query_builder.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_aggregate).collect()
    }

    async fn delete_windows_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM request_aggregates WHERE window_end < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
