use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::{distributions::Alphanumeric, Rng};
use validator::Validate;

use super::resolver::AssignmentResolver;
use crate::{
    clock::SharedClock,
    config::AccountingConfig,
    cycle,
    db::{CreditGrant, DbError, DbPool, RedeemParams},
    error::{CoreError, CoreResult},
    models::{
        BillingMode, CreateVoucherBatch, GrantType, NewAssignment, RedemptionResult, Subject,
        VoucherBatch, VoucherCode, VoucherCodeStatus, VoucherRedemption,
    },
};

/// Random characters after the batch prefix in a minted code.
const CODE_SUFFIX_LEN: usize = 10;

/// Re-mint attempts before a code collision is treated as an error.
const MINT_ATTEMPTS: usize = 5;

/// Voucher campaign management and redemption.
///
/// Redemption applies the grant atomically with the code's status flip;
/// a replayed or raced redemption comes back as `Ineligible`, never as a
/// second grant.
#[derive(Clone)]
pub struct VoucherService {
    db: Arc<DbPool>,
    resolver: AssignmentResolver,
    clock: SharedClock,
    credit_plan_code: String,
}

impl VoucherService {
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
            credit_plan_code: config.credit_plan_code.clone(),
        }
    }

    /// Create a voucher batch after checking the grant is well-formed.
    pub async fn create_batch(&self, input: CreateVoucherBatch) -> CoreResult<VoucherBatch> {
        input.validate()?;
        match input.grant_type {
            GrantType::Plan if input.plan_grant_id.is_none() => {
                return Err(CoreError::InvalidArgument(
                    "plan grant batches require plan_grant_id".to_string(),
                ));
            }
            GrantType::Credit if input.credit_amount <= 0 => {
                return Err(CoreError::InvalidArgument(
                    "credit grant batches require credit_amount > 0".to_string(),
                ));
            }
            _ => {}
        }
        if let (Some(from), Some(until)) = (input.valid_from, input.valid_until) {
            if until <= from {
                return Err(CoreError::InvalidArgument(
                    "valid_until must be after valid_from".to_string(),
                ));
            }
        }
        Ok(self.db.vouchers().create_batch(input).await?)
    }

    pub async fn get_batch(&self, id: i64) -> CoreResult<Option<VoucherBatch>> {
        Ok(self.db.vouchers().get_batch(id).await?)
    }

    pub async fn list_batches(&self) -> CoreResult<Vec<VoucherBatch>> {
        Ok(self.db.vouchers().list_batches().await?)
    }

    /// Mint `count` fresh codes under the batch's prefix.
    ///
    /// A collision with an existing code rolls the whole insert back and
    /// mints a new set; with a 10-character suffix this is effectively a
    /// retry for corrupted randomness, not a hot path.
    pub async fn mint_codes(&self, batch_id: i64, count: usize) -> CoreResult<Vec<VoucherCode>> {
        if count == 0 {
            return Err(CoreError::InvalidArgument(
                "count must be at least 1".to_string(),
            ));
        }
        let batch = self
            .db
            .vouchers()
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("voucher batch {batch_id}")))?;

        for _ in 0..MINT_ATTEMPTS {
            let codes: Vec<String> = (0..count)
                .map(|_| mint_code(&batch.code_prefix))
                .collect();
            match self.db.vouchers().insert_codes(batch_id, &codes).await {
                Ok(inserted) => return Ok(inserted),
                Err(DbError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(CoreError::Internal(
            "voucher code minting kept colliding".to_string(),
        ))
    }

    /// Mark up to `count` available codes as issued, returning them.
    pub async fn issue_codes(&self, batch_id: i64, count: i64) -> CoreResult<Vec<VoucherCode>> {
        Ok(self.db.vouchers().issue_codes(batch_id, count).await?)
    }

    pub async fn get_code(&self, code: &str) -> CoreResult<Option<VoucherCode>> {
        Ok(self.db.vouchers().get_code(code).await?)
    }

    pub async fn list_codes(&self, batch_id: i64) -> CoreResult<Vec<VoucherCode>> {
        Ok(self.db.vouchers().list_codes(batch_id).await?)
    }

    pub async fn list_redemptions(&self, batch_id: i64) -> CoreResult<Vec<VoucherRedemption>> {
        Ok(self.db.vouchers().list_redemptions(batch_id).await?)
    }

    /// Redeem a code for a subject.
    ///
    /// Eligibility failures (spent code, closed validity window, exhausted
    /// redemption caps, non-stackable duplicate) come back as `Ineligible`.
    /// An unknown code is `NotFound`. The grant, the status flip, and the
    /// redemption record commit together.
    pub async fn redeem(
        &self,
        code: &str,
        subject: Subject,
        deadline: Option<DateTime<Utc>>,
    ) -> CoreResult<RedemptionResult> {
        let now = self.clock.now();
        if let Some(deadline) = deadline {
            if now >= deadline {
                return Err(CoreError::Cancelled);
            }
        }

        let voucher = self
            .db
            .vouchers()
            .get_code(code)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("voucher code {code}")))?;
        let batch = self
            .db
            .vouchers()
            .get_batch(voucher.voucher_batch_id)
            .await?
            .ok_or_else(|| {
                CoreError::Internal(format!("batch {} missing for code", voucher.voucher_batch_id))
            })?;

        // Pre-checks give a clean Ineligible before taking the write lock;
        // the transaction re-validates everything under it.
        if !matches!(
            voucher.status,
            VoucherCodeStatus::Available | VoucherCodeStatus::Issued
        ) {
            return Err(CoreError::Ineligible(format!(
                "code is {}",
                voucher.status.as_str()
            )));
        }
        if !batch.is_within_validity(now) {
            return Err(CoreError::Ineligible(
                "code is outside its validity window".to_string(),
            ));
        }
        if batch.max_redemptions > 0
            && self.db.vouchers().redemption_count(batch.id).await? >= batch.max_redemptions
        {
            return Err(CoreError::Ineligible(
                "batch redemption limit reached".to_string(),
            ));
        }
        if batch.max_per_subject > 0
            && self
                .db
                .vouchers()
                .redemption_count_for_subject(batch.id, &subject)
                .await?
                >= batch.max_per_subject
        {
            return Err(CoreError::Ineligible(
                "subject redemption limit reached".to_string(),
            ));
        }

        let params = match batch.grant_type {
            GrantType::Plan => self.plan_grant_params(&batch, code, subject, now).await?,
            GrantType::Credit => self.credit_grant_params(&batch, code, subject, now).await?,
        };

        self.resolver.invalidate(&subject).await;

        match self.db.vouchers().redeem(params).await {
            Ok(result) => {
                tracing::info!(
                    code,
                    batch_id = batch.id,
                    grant_type = batch.grant_type.as_str(),
                    "Voucher redeemed"
                );
                Ok(result)
            }
            // The transaction's own validation lost a race or found the
            // code spent; both are eligibility outcomes for the caller.
            Err(DbError::Validation(msg)) | Err(DbError::Conflict(msg)) => {
                Err(CoreError::Ineligible(msg))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// A plan grant creates a fresh assignment to the granted plan.
    async fn plan_grant_params(
        &self,
        batch: &VoucherBatch,
        code: &str,
        subject: Subject,
        now: DateTime<Utc>,
    ) -> CoreResult<RedeemParams> {
        let plan_id = batch.plan_grant_id.ok_or_else(|| {
            CoreError::Internal(format!("plan grant batch {} has no plan", batch.id))
        })?;
        let plan = self
            .db
            .plans()
            .get_by_id(plan_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("plan {plan_id}")))?;
        if !plan.is_active {
            return Err(CoreError::Ineligible(
                "granted plan is no longer active".to_string(),
            ));
        }

        if !batch.is_stackable {
            let active = self.db.assignments().find_active(&subject, now).await?;
            if active.iter().any(|a| a.plan_id == plan_id) {
                return Err(CoreError::Ineligible(
                    "subject already holds the granted plan".to_string(),
                ));
            }
        }

        let duration_days = batch
            .plan_grant_duration_days
            .map(i64::from)
            .or_else(|| (plan.validity_days > 0).then(|| i64::from(plan.validity_days)));

        Ok(RedeemParams {
            code: code.to_string(),
            subject,
            now,
            assignment: Some(NewAssignment {
                subject,
                plan_id,
                billing_mode: BillingMode::Plan,
                activated_at: now,
                expires_at: duration_days.map(|d| now + Duration::days(d)),
                carry_policy: plan.carry_policy,
                auto_fallback_enabled: false,
                fallback_plan_id: None,
                metadata: None,
            }),
            credit: None,
            existing_assignment_id: None,
        })
    }

    /// A credit grant books a ledger entry against an assignment to the
    /// configured credit plan, reusing the subject's existing one if held.
    async fn credit_grant_params(
        &self,
        batch: &VoucherBatch,
        code: &str,
        subject: Subject,
        now: DateTime<Utc>,
    ) -> CoreResult<RedeemParams> {
        let credit_plan = self
            .db
            .plans()
            .get_by_code(&self.credit_plan_code)
            .await?
            .ok_or_else(|| {
                tracing::error!(
                    code = %self.credit_plan_code,
                    "Credit plan is not provisioned"
                );
                CoreError::Internal("credit plan is not provisioned".to_string())
            })?;

        let active = self.db.assignments().find_active(&subject, now).await?;
        let existing = active.iter().find(|a| a.plan_id == credit_plan.id);

        let credit = CreditGrant {
            metric: credit_plan.quota_metric,
            cycle_start: cycle::cycle_for(&credit_plan, now)?.start,
            amount: batch.credit_amount,
            expires_at: batch.valid_until,
        };

        Ok(RedeemParams {
            code: code.to_string(),
            subject,
            now,
            assignment: existing.is_none().then(|| NewAssignment {
                subject,
                plan_id: credit_plan.id,
                billing_mode: BillingMode::Voucher,
                activated_at: now,
                expires_at: batch.valid_until,
                carry_policy: credit_plan.carry_policy,
                auto_fallback_enabled: false,
                fallback_plan_id: None,
                metadata: None,
            }),
            credit: Some(credit),
            existing_assignment_id: existing.map(|a| a.id),
        })
    }
}

/// `PREFIX-XXXXXXXXXX`, uppercase alphanumeric suffix.
fn mint_code(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CODE_SUFFIX_LEN)
        .map(|b| (b as char).to_ascii_uppercase())
        .collect();
    format!("{prefix}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_codes_carry_prefix_and_length() {
        let code = mint_code("SUMMER24");
        assert!(code.starts_with("SUMMER24-"));
        assert_eq!(code.len(), "SUMMER24-".len() + CODE_SUFFIX_LEN);
        assert!(code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn minted_codes_are_distinct() {
        let a = mint_code("P");
        let b = mint_code("P");
        assert_ne!(a, b);
    }
}
