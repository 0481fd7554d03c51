//! Shared builders for repository tests.

use chrono::{DateTime, TimeZone, Utc};

use crate::{
    db::DbPool,
    models::{
        BillingMode, CarryPolicy, CreatePlan, CreateVoucherBatch, CycleType, GrantType,
        NewAssignment, Plan, PlanAssignment, QuotaMetric, Subject,
    },
};

pub fn ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

pub fn create_plan_input(code: &str, quota: i64) -> CreatePlan {
    CreatePlan {
        code: code.to_string(),
        name: format!("Plan {}", code),
        description: String::new(),
        cycle_type: CycleType::Monthly,
        cycle_length_days: 0,
        quota_metric: QuotaMetric::Requests,
        quota_amount: quota,
        carry_policy: CarryPolicy::None,
        carry_cap_percent: 0,
        upstream_alias_whitelist: None,
        allowed_models: None,
        token_limit: 0,
        validity_days: 0,
        is_public: false,
        is_system: false,
    }
}

pub async fn create_plan(db: &DbPool, code: &str, quota: i64) -> Plan {
    db.plans()
        .create(create_plan_input(code, quota))
        .await
        .expect("Failed to create test plan")
}

pub async fn create_assignment(
    db: &DbPool,
    subject: Subject,
    plan_id: i64,
    activated_at: DateTime<Utc>,
) -> PlanAssignment {
    db.assignments()
        .create(NewAssignment {
            subject,
            plan_id,
            billing_mode: BillingMode::Plan,
            activated_at,
            expires_at: None,
            carry_policy: CarryPolicy::None,
            auto_fallback_enabled: false,
            fallback_plan_id: None,
            metadata: None,
        })
        .await
        .expect("Failed to create test assignment")
}

pub fn create_batch_input(prefix: &str, grant_type: GrantType) -> CreateVoucherBatch {
    CreateVoucherBatch {
        code_prefix: prefix.to_string(),
        label: format!("Batch {}", prefix),
        grant_type,
        credit_amount: if grant_type == GrantType::Credit { 50 } else { 0 },
        plan_grant_id: None,
        plan_grant_duration_days: None,
        is_stackable: false,
        max_redemptions: 0,
        max_per_subject: 0,
        valid_from: None,
        valid_until: None,
        created_by: "tests".to_string(),
        notes: String::new(),
    }
}
