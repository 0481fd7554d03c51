use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    db::error::DbResult,
    models::{
        CreateVoucherBatch, NewAssignment, QuotaMetric, RedemptionResult, Subject, VoucherBatch,
        VoucherCode, VoucherRedemption,
    },
};

/// Carry entry granting voucher credit to the redeemer's assignment.
#[derive(Debug, Clone)]
pub struct CreditGrant {
    pub metric: QuotaMetric,
    pub cycle_start: DateTime<Utc>,
    pub amount: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Everything a redemption transaction needs to apply.
///
/// The caller resolves the batch's grant into a concrete assignment and/or
/// credit before calling; the repo applies it atomically with the status
/// flip and the redemption record.
#[derive(Debug, Clone)]
pub struct RedeemParams {
    pub code: String,
    pub subject: Subject,
    pub now: DateTime<Utc>,
    /// Assignment to create as part of the redemption, if the grant is a
    /// plan grant (or a credit grant backed by a credit plan).
    pub assignment: Option<NewAssignment>,
    /// Credit to book against the created (or reused) assignment.
    pub credit: Option<CreditGrant>,
    /// Reuse this assignment for the credit instead of creating one.
    pub existing_assignment_id: Option<i64>,
}

#[async_trait]
pub trait VoucherRepo: Send + Sync {
    /// Create a batch. Fails with `DbError::Conflict` when the prefix is
    /// taken by a non-deleted batch.
    async fn create_batch(&self, input: CreateVoucherBatch) -> DbResult<VoucherBatch>;

    async fn get_batch(&self, id: i64) -> DbResult<Option<VoucherBatch>>;

    async fn list_batches(&self) -> DbResult<Vec<VoucherBatch>>;

    /// Insert pre-minted codes for a batch in one transaction. A code
    /// colliding with any existing code fails the whole insert with
    /// `DbError::Conflict`; the caller re-mints and retries.
    async fn insert_codes(&self, batch_id: i64, codes: &[String]) -> DbResult<Vec<VoucherCode>>;

    /// Flip up to `count` available codes to issued, returning them.
    async fn issue_codes(&self, batch_id: i64, count: i64) -> DbResult<Vec<VoucherCode>>;

    async fn get_code(&self, code: &str) -> DbResult<Option<VoucherCode>>;

    /// Codes in a batch, oldest first.
    async fn list_codes(&self, batch_id: i64) -> DbResult<Vec<VoucherCode>>;

    /// Total completed redemptions for a batch.
    async fn redemption_count(&self, batch_id: i64) -> DbResult<i64>;

    /// Completed redemptions in a batch by one subject.
    async fn redemption_count_for_subject(
        &self,
        batch_id: i64,
        subject: &Subject,
    ) -> DbResult<i64>;

    async fn list_redemptions(&self, batch_id: i64) -> DbResult<Vec<VoucherRedemption>>;

    /// Apply a redemption in one transaction: validate the code is still
    /// redeemable, mark it redeemed, write the redemption record, and
    /// apply the grant. A concurrent redemption of the same code loses on
    /// the unique redemption index and gets `DbError::Conflict`.
    async fn redeem(&self, params: RedeemParams) -> DbResult<RedemptionResult>;
}
