use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::common::{
    decode_json, encode_json, parse_flag_reason, parse_quota_metric, parse_subject,
    parse_subject_type,
};
use crate::{
    db::{
        error::DbResult,
        repos::{NewRequestLog, RequestLogRepo},
    },
    models::{CreateRequestFlag, RequestFlag, RequestLog, RequestLogFilter},
};

const LOG_COLUMNS: &str = r#"
    id, request_id, occurred_at, model_alias, upstream_provider,
    subject_type, anonymized_subject_hash, plan_id, plan_assignment_id,
    usage_metric, prompt_tokens, completion_tokens, total_tokens, latency_ms,
    normalized_url, http_method, user_agent, param_digest,
    sanitized_cookies, auth_key_fingerprint, flag_ids, metadata, created_at
"#;

const FLAG_COLUMNS: &str = r#"
    id, request_id, subject_type, subject_id, reason,
    rerouted_model_alias, ttl_at, created_at
"#;

pub struct SqliteRequestLogRepo {
    pool: SqlitePool,
}

impl SqliteRequestLogRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_log(row: &sqlx::sqlite::SqliteRow) -> DbResult<RequestLog> {
        let flag_ids: Option<Vec<i64>> = row
            .get::<Option<String>, _>("flag_ids")
            .map(|s| serde_json::from_str(&s))
            .transpose()?;

        Ok(RequestLog {
            id: row.get("id"),
            request_id: row.get("request_id"),
            occurred_at: row.get("occurred_at"),
            model_alias: row.get("model_alias"),
            upstream_provider: row.get("upstream_provider"),
            subject_type: parse_subject_type(&row.get::<String, _>("subject_type"))?,
            anonymized_subject_hash: row.get("anonymized_subject_hash"),
            plan_id: row.get("plan_id"),
            plan_assignment_id: row.get("plan_assignment_id"),
            usage_metric: parse_quota_metric(&row.get::<String, _>("usage_metric"))?,
            prompt_tokens: row.get("prompt_tokens"),
            completion_tokens: row.get("completion_tokens"),
            total_tokens: row.get("total_tokens"),
            latency_ms: row.get("latency_ms"),
            normalized_url: row.get("normalized_url"),
            http_method: row.get("http_method"),
            user_agent: row.get("user_agent"),
            param_digest: row.get("param_digest"),
            sanitized_cookies: row.get("sanitized_cookies"),
            auth_key_fingerprint: row.get("auth_key_fingerprint"),
            flag_ids,
            metadata: decode_json(row.get("metadata"))?,
            created_at: row.get("created_at"),
        })
    }

    fn row_to_flag(row: &sqlx::sqlite::SqliteRow) -> DbResult<RequestFlag> {
        Ok(RequestFlag {
            id: row.get("id"),
            request_id: row.get("request_id"),
            subject: parse_subject(
                &row.get::<String, _>("subject_type"),
                row.get("subject_id"),
            )?,
            reason: parse_flag_reason(&row.get::<String, _>("reason"))?,
            rerouted_model_alias: row.get("rerouted_model_alias"),
            ttl_at: row.get("ttl_at"),
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl RequestLogRepo for SqliteRequestLogRepo {
    async fn insert(&self, log: NewRequestLog) -> DbResult<bool> {
        let now = chrono::Utc::now();

        // INSERT OR IGNORE on the unique request_id index makes retried
        // deliveries of the same event a no-op.
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO request_logs (
                request_id, occurred_at, model_alias, upstream_provider,
                subject_type, anonymized_subject_hash, plan_id,
                plan_assignment_id, usage_metric, prompt_tokens,
                completion_tokens, total_tokens, latency_ms, normalized_url,
                http_method, user_agent, param_digest, sanitized_cookies,
                auth_key_fingerprint, metadata, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.request_id)
        .bind(log.occurred_at)
        .bind(&log.model_alias)
        .bind(&log.upstream_provider)
        .bind(log.subject_type.as_str())
        .bind(&log.anonymized_subject_hash)
        .bind(log.plan_id)
        .bind(log.plan_assignment_id)
        .bind(log.usage_metric.as_str())
        .bind(log.prompt_tokens)
        .bind(log.completion_tokens)
        .bind(log.total_tokens)
        .bind(log.latency_ms)
        .bind(&log.normalized_url)
        .bind(&log.http_method)
        .bind(&log.user_agent)
        .bind(&log.param_digest)
        .bind(&log.sanitized_cookies)
        .bind(&log.auth_key_fingerprint)
        .bind(encode_json(&log.metadata)?)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_by_request_id(&self, request_id: &str) -> DbResult<Option<RequestLog>> {
        let row = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM request_logs WHERE request_id = ?"
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_log).transpose()
    }

    async fn list(&self, filter: RequestLogFilter) -> DbResult<Vec<RequestLog>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(model) = &filter.model_alias {
            conditions.push("model_alias = ?".to_string());
            binds.push(model.clone());
        }
        if let Some(upstream) = &filter.upstream_provider {
            conditions.push("upstream_provider = ?".to_string());
            binds.push(upstream.clone());
        }
        if let Some(subject_type) = filter.subject_type {
            conditions.push("subject_type = ?".to_string());
            binds.push(subject_type.as_str().to_string());
        }
        if let Some(hash) = &filter.anonymized_subject_hash {
            conditions.push("anonymized_subject_hash = ?".to_string());
            binds.push(hash.clone());
        }
        if let Some(after) = filter.occurred_after {
            conditions.push("occurred_at >= ?".to_string());
            binds.push(after.to_rfc3339());
        }
        if let Some(before) = filter.occurred_before {
            conditions.push("occurred_at < ?".to_string());
            binds.push(before.to_rfc3339());
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            r#"
            SELECT {LOG_COLUMNS} FROM request_logs
            {where_clause}
            ORDER BY occurred_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#
        );

        let mut query_builder = sqlx::query(&query);
        for bind in &binds {
            query_builder = query_builder.bind(bind);
        }
        query_builder = query_builder
            .bind(filter.limit.unwrap_or(100))
            .bind(filter.offset.unwrap_or(0));

        let rows = query_builder.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_log).collect()
    }

    async fn create_flag(&self, input: CreateRequestFlag) -> DbResult<RequestFlag> {
        let now = chrono::Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO request_flags (
                request_id, subject_type, subject_id, reason,
                rerouted_model_alias, ttl_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&input.request_id)
        .bind(input.subject.type_str())
        .bind(input.subject.id())
        .bind(input.reason.as_str())
        .bind(&input.rerouted_model_alias)
        .bind(input.ttl_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let flag_id = result.last_insert_rowid();

        // Mirror the flag id onto the log row when the log already landed;
        // a flag can also precede its log when metering is delayed.
        let existing: Option<Option<String>> =
            sqlx::query("SELECT flag_ids FROM request_logs WHERE request_id = ?")
                .bind(&input.request_id)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.get("flag_ids"));

        if let Some(raw) = existing {
            let mut ids: Vec<i64> = raw
                .map(|s| serde_json::from_str(&s))
                .transpose()?
                .unwrap_or_default();
            ids.push(flag_id);
            sqlx::query("UPDATE request_logs SET flag_ids = ? WHERE request_id = ?")
                .bind(serde_json::to_string(&ids)?)
                .bind(&input.request_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(RequestFlag {
            id: flag_id,
            request_id: input.request_id,
            subject: input.subject,
            reason: input.reason,
            rerouted_model_alias: input.rerouted_model_alias,
            ttl_at: input.ttl_at,
            created_at: now,
        })
    }

    async fn flags_for(&self, request_id: &str) -> DbResult<Vec<RequestFlag>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {FLAG_COLUMNS} FROM request_flags
            WHERE request_id = ?
            ORDER BY id ASC
            "#
        ))
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_flag).collect()
    }

    async fn delete_logs_before(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: u32,
        max_deletes: u64,
    ) -> DbResult<u64> {
        let mut total: u64 = 0;

        // Batched deletes keep the write lock short on large backlogs.
        loop {
            if total >= max_deletes {
                break;
            }
            let remaining = (max_deletes - total).min(batch_size as u64);

            let result = sqlx::query(
                r#"
                DELETE FROM request_logs
                WHERE id IN (
                    SELECT id FROM request_logs WHERE occurred_at < ? LIMIT ?
                )
                "#,
            )
            .bind(cutoff)
            .bind(remaining as i64)
            .execute(&self.pool)
            .await?;

            let deleted = result.rows_affected();
            total += deleted;
            if deleted < remaining {
                break;
            }
        }

        Ok(total)
    }

    async fn delete_expired_flags(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let result =
            sqlx::query("DELETE FROM request_flags WHERE ttl_at IS NOT NULL AND ttl_at <= ?")
                .bind(now)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}
