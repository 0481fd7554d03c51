use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::common::{
    encode_json, map_unique_violation, parse_code_status, parse_grant_type, parse_subject,
};
use crate::{
    db::{
        error::{DbError, DbResult},
        repos::{RedeemParams, VoucherRepo},
    },
    models::{
        CreateVoucherBatch, RedemptionResult, Subject, VoucherBatch, VoucherCode,
        VoucherCodeStatus, VoucherRedemption,
    },
};

const BATCH_COLUMNS: &str = r#"
    id, code_prefix, label, grant_type, credit_amount, plan_grant_id,
    plan_grant_duration_days, is_stackable, max_redemptions, max_per_subject,
    valid_from, valid_until, created_by, notes, created_at, updated_at
"#;

const CODE_COLUMNS: &str = r#"
    id, voucher_batch_id, code, status, issued_at, redeemed_at,
    redeemed_by_subject_type, redeemed_by_subject_id, plan_assignment_id,
    created_at, updated_at
"#;

pub struct SqliteVoucherRepo {
    pool: SqlitePool,
}

impl SqliteVoucherRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_batch(row: &sqlx::sqlite::SqliteRow) -> DbResult<VoucherBatch> {
        Ok(VoucherBatch {
            id: row.get("id"),
            code_prefix: row.get("code_prefix"),
            label: row.get("label"),
            grant_type: parse_grant_type(&row.get::<String, _>("grant_type"))?,
            credit_amount: row.get("credit_amount"),
            plan_grant_id: row.get("plan_grant_id"),
            plan_grant_duration_days: row.get("plan_grant_duration_days"),
            is_stackable: row.get("is_stackable"),
            max_redemptions: row.get("max_redemptions"),
            max_per_subject: row.get("max_per_subject"),
            valid_from: row.get("valid_from"),
            valid_until: row.get("valid_until"),
            created_by: row.get("created_by"),
            notes: row.get("notes"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_code(row: &sqlx::sqlite::SqliteRow) -> DbResult<VoucherCode> {
        let redeemed_by = match row.get::<Option<String>, _>("redeemed_by_subject_type") {
            Some(t) => Some(parse_subject(
                &t,
                row.get::<Option<i64>, _>("redeemed_by_subject_id")
                    .unwrap_or_default(),
            )?),
            None => None,
        };
        Ok(VoucherCode {
            id: row.get("id"),
            voucher_batch_id: row.get("voucher_batch_id"),
            code: row.get("code"),
            status: parse_code_status(&row.get::<String, _>("status"))?,
            issued_at: row.get("issued_at"),
            redeemed_at: row.get("redeemed_at"),
            redeemed_by,
            plan_assignment_id: row.get("plan_assignment_id"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_redemption(row: &sqlx::sqlite::SqliteRow) -> DbResult<VoucherRedemption> {
        Ok(VoucherRedemption {
            id: row.get("id"),
            voucher_batch_id: row.get("voucher_batch_id"),
            code: row.get("code"),
            subject: parse_subject(
                &row.get::<String, _>("subject_type"),
                row.get("subject_id"),
            )?,
            plan_assignment_id: row.get("plan_assignment_id"),
            credit_amount: row.get("credit_amount"),
            plan_granted_id: row.get("plan_granted_id"),
            redeemed_at: row.get("redeemed_at"),
            created_at: row.get("created_at"),
        })
    }

    async fn count_redemptions<'e, E>(
        executor: E,
        batch_id: i64,
        subject: Option<&Subject>,
    ) -> DbResult<i64>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let row = match subject {
            Some(subject) => {
                sqlx::query(
                    r#"
                    SELECT COUNT(*) as count FROM voucher_redemptions
                    WHERE voucher_batch_id = ? AND subject_type = ? AND subject_id = ?
                    "#,
                )
                .bind(batch_id)
                .bind(subject.type_str())
                .bind(subject.id())
                .fetch_one(executor)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT COUNT(*) as count FROM voucher_redemptions WHERE voucher_batch_id = ?",
                )
                .bind(batch_id)
                .fetch_one(executor)
                .await?
            }
        };

        Ok(row.get::<i64, _>("count"))
    }
}

#[async_trait]
impl VoucherRepo for SqliteVoucherRepo {
    async fn create_batch(&self, input: CreateVoucherBatch) -> DbResult<VoucherBatch> {
        let now = chrono::Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO voucher_batches (
                code_prefix, label, grant_type, credit_amount, plan_grant_id,
                plan_grant_duration_days, is_stackable, max_redemptions,
                max_per_subject, valid_from, valid_until, created_by, notes,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&input.code_prefix)
        .bind(&input.label)
        .bind(input.grant_type.as_str())
        .bind(input.credit_amount)
        .bind(input.plan_grant_id)
        .bind(input.plan_grant_duration_days)
        .bind(input.is_stackable)
        .bind(input.max_redemptions)
        .bind(input.max_per_subject)
        .bind(input.valid_from)
        .bind(input.valid_until)
        .bind(&input.created_by)
        .bind(&input.notes)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_unique_violation(
                e,
                format!("Voucher prefix '{}' already exists", input.code_prefix),
            )
        })?;

        let id = result.last_insert_rowid();
        self.get_batch(id).await?.ok_or(DbError::NotFound)
    }

    async fn get_batch(&self, id: i64) -> DbResult<Option<VoucherBatch>> {
        let row = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM voucher_batches WHERE id = ? AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_batch).transpose()
    }

    async fn list_batches(&self) -> DbResult<Vec<VoucherBatch>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {BATCH_COLUMNS} FROM voucher_batches
            WHERE deleted_at IS NULL
            ORDER BY created_at DESC, id DESC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_batch).collect()
    }

    async fn insert_codes(&self, batch_id: i64, codes: &[String]) -> DbResult<Vec<VoucherCode>> {
        let now = chrono::Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(codes.len());

        for code in codes {
            let result = sqlx::query(
                r#"
                INSERT INTO voucher_codes (
                    voucher_batch_id, code, status, created_at, updated_at
                )
                VALUES (?, ?, 'available', ?, ?)
                "#,
            )
            .bind(batch_id)
            .bind(code)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_unique_violation(e, format!("Voucher code '{}' already exists", code)))?;

            inserted.push(result.last_insert_rowid());
        }

        let mut out = Vec::with_capacity(inserted.len());
        for id in inserted {
            let row = sqlx::query(&format!(
                "SELECT {CODE_COLUMNS} FROM voucher_codes WHERE id = ?"
            ))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
            out.push(Self::row_to_code(&row)?);
        }

        tx.commit().await?;
        Ok(out)
    }

    async fn issue_codes(&self, batch_id: i64, count: i64) -> DbResult<Vec<VoucherCode>> {
        let now = chrono::Utc::now();
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {CODE_COLUMNS} FROM voucher_codes
            WHERE voucher_batch_id = ? AND status = 'available'
            ORDER BY id ASC
            LIMIT ?
            "#
        ))
        .bind(batch_id)
        .bind(count)
        .fetch_all(&mut *tx)
        .await?;

        let mut issued = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.get("id");
            sqlx::query(
                r#"
                UPDATE voucher_codes
                SET status = 'issued', issued_at = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            let mut code = Self::row_to_code(row)?;
            code.status = VoucherCodeStatus::Issued;
            code.issued_at = Some(now);
            code.updated_at = now;
            issued.push(code);
        }

        tx.commit().await?;
        Ok(issued)
    }

    async fn get_code(&self, code: &str) -> DbResult<Option<VoucherCode>> {
        let row = sqlx::query(&format!(
            "SELECT {CODE_COLUMNS} FROM voucher_codes WHERE code = ?"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_code).transpose()
    }

    async fn list_codes(&self, batch_id: i64) -> DbResult<Vec<VoucherCode>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {CODE_COLUMNS} FROM voucher_codes
            WHERE voucher_batch_id = ?
            ORDER BY id ASC
            "#
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_code).collect()
    }

    async fn redemption_count(&self, batch_id: i64) -> DbResult<i64> {
        Self::count_redemptions(&self.pool, batch_id, None).await
    }

    async fn redemption_count_for_subject(
        &self,
        batch_id: i64,
        subject: &Subject,
    ) -> DbResult<i64> {
        Self::count_redemptions(&self.pool, batch_id, Some(subject)).await
    }

    async fn list_redemptions(&self, batch_id: i64) -> DbResult<Vec<VoucherRedemption>> {
        let rows = sqlx::query(
            r#"
            SELECT id, voucher_batch_id, code, subject_type, subject_id,
                   plan_assignment_id, credit_amount, plan_granted_id,
                   redeemed_at, created_at
            FROM voucher_redemptions
            WHERE voucher_batch_id = ?
            ORDER BY redeemed_at DESC, id DESC
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_redemption).collect()
    }

    async fn redeem(&self, params: RedeemParams) -> DbResult<RedemptionResult> {
        let now = params.now;
        let mut tx = self.pool.begin().await?;

        let code_row = sqlx::query(&format!(
            "SELECT {CODE_COLUMNS} FROM voucher_codes WHERE code = ?"
        ))
        .bind(&params.code)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(DbError::NotFound)?;
        let code = Self::row_to_code(&code_row)?;

        match code.status {
            VoucherCodeStatus::Available | VoucherCodeStatus::Issued => {}
            VoucherCodeStatus::Redeemed => {
                return Err(DbError::Conflict("Voucher code already redeemed".to_string()));
            }
            VoucherCodeStatus::Expired => {
                return Err(DbError::Validation("Voucher code has expired".to_string()));
            }
        }

        let batch_row = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM voucher_batches WHERE id = ? AND deleted_at IS NULL"
        ))
        .bind(code.voucher_batch_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(DbError::NotFound)?;
        let batch = Self::row_to_batch(&batch_row)?;

        if !batch.is_within_validity(now) {
            return Err(DbError::Validation(
                "Voucher batch is outside its validity window".to_string(),
            ));
        }

        // Count checks inside the transaction so a concurrent redemption
        // cannot push the batch past its caps.
        if batch.max_redemptions > 0 {
            let total = Self::count_redemptions(&mut *tx, batch.id, None).await?;
            if total >= batch.max_redemptions {
                return Err(DbError::Validation(
                    "Voucher batch redemption limit reached".to_string(),
                ));
            }
        }
        if batch.max_per_subject > 0 {
            let by_subject =
                Self::count_redemptions(&mut *tx, batch.id, Some(&params.subject)).await?;
            if by_subject >= batch.max_per_subject {
                return Err(DbError::Validation(
                    "Subject has reached the per-subject redemption limit".to_string(),
                ));
            }
        }

        // Grant: create the assignment if the caller resolved one.
        let assignment_id = match (&params.assignment, params.existing_assignment_id) {
            (Some(input), _) => {
                let created_at = chrono::Utc::now();
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
                .bind(created_at)
                .bind(created_at)
                .execute(&mut *tx)
                .await?;
                Some(result.last_insert_rowid())
            }
            (None, existing) => existing,
        };

        // Credit grants land as a carry entry on the target assignment.
        // Stacked credits in the same cycle add up; an existing entry keeps
        // its row and grows. A never-expiring pot stays never-expiring.
        let credit_amount = match &params.credit {
            Some(credit) => {
                let target = assignment_id.ok_or_else(|| {
                    DbError::Internal("Credit grant without a target assignment".to_string())
                })?;
                sqlx::query(
                    r#"
                    INSERT INTO carry_ledger (
                        plan_assignment_id, metric, cycle_start, amount,
                        expires_at, created_at
                    )
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT (plan_assignment_id, metric, cycle_start)
                    DO UPDATE SET
                        amount = amount + excluded.amount,
                        expires_at = CASE
                            WHEN expires_at IS NULL OR excluded.expires_at IS NULL THEN NULL
                            ELSE MAX(expires_at, excluded.expires_at)
                        END
                    "#,
                )
                .bind(target)
                .bind(credit.metric.as_str())
                .bind(credit.cycle_start)
                .bind(credit.amount)
                .bind(credit.expires_at)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                credit.amount
            }
            None => 0,
        };

        // The unique index on voucher_redemptions.code is the final
        // arbiter; a concurrent racer fails here and rolls back.
        let redemption = sqlx::query(
            r#"
            INSERT INTO voucher_redemptions (
                voucher_batch_id, code, subject_type, subject_id,
                plan_assignment_id, credit_amount, plan_granted_id,
                redeemed_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(batch.id)
        .bind(&params.code)
        .bind(params.subject.type_str())
        .bind(params.subject.id())
        .bind(assignment_id)
        .bind(credit_amount)
        .bind(batch.plan_grant_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, "Voucher code already redeemed"))?;

        sqlx::query(
            r#"
            UPDATE voucher_codes
            SET status = 'redeemed', redeemed_at = ?,
                redeemed_by_subject_type = ?, redeemed_by_subject_id = ?,
                plan_assignment_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(params.subject.type_str())
        .bind(params.subject.id())
        .bind(assignment_id)
        .bind(now)
        .bind(code.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(RedemptionResult {
            redemption_id: redemption.last_insert_rowid(),
            grant_type: batch.grant_type,
            credit_amount,
            plan_granted_id: batch.plan_grant_id,
            plan_assignment_id: assignment_id,
            redeemed_at: now,
        })
    }
}
