use crate::{
    db::{
        DbError,
        repos::{CreditGrant, RedeemParams},
        tests::{fixtures::*, harness::create_db},
    },
    models::{
        BillingMode, CarryPolicy, GrantType, NewAssignment, QuotaMetric, Subject,
        VoucherCodeStatus,
    },
};

fn codes(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}-{:04}", prefix, i)).collect()
}

fn redeem_params(code: &str, subject: Subject) -> RedeemParams {
    RedeemParams {
        code: code.to_string(),
        subject,
        now: ts(2024, 3, 1, 0),
        assignment: None,
        credit: None,
        existing_assignment_id: None,
    }
}

#[tokio::test]
async fn batch_prefix_is_unique() {
    let db = create_db().await;
    db.vouchers()
        .create_batch(create_batch_input("SPRING", GrantType::Credit))
        .await
        .unwrap();

    let dup = db
        .vouchers()
        .create_batch(create_batch_input("SPRING", GrantType::Credit))
        .await;
    assert!(matches!(dup, Err(DbError::Conflict(_))));
}

#[tokio::test]
async fn insert_codes_rejects_collisions_atomically() {
    let db = create_db().await;
    let batch = db
        .vouchers()
        .create_batch(create_batch_input("SPRING", GrantType::Credit))
        .await
        .unwrap();

    let minted = db
        .vouchers()
        .insert_codes(batch.id, &codes("SPRING", 3))
        .await
        .unwrap();
    assert_eq!(minted.len(), 3);
    assert!(minted.iter().all(|c| c.status == VoucherCodeStatus::Available));

    // One colliding code fails the whole insert.
    let retry = db
        .vouchers()
        .insert_codes(batch.id, &["SPRING-9999".to_string(), "SPRING-0001".to_string()])
        .await;
    assert!(matches!(retry, Err(DbError::Conflict(_))));
    assert!(db.vouchers().get_code("SPRING-9999").await.unwrap().is_none());
}

#[tokio::test]
async fn issue_codes_flips_available_codes_in_order() {
    let db = create_db().await;
    let batch = db
        .vouchers()
        .create_batch(create_batch_input("SPRING", GrantType::Credit))
        .await
        .unwrap();
    db.vouchers()
        .insert_codes(batch.id, &codes("SPRING", 3))
        .await
        .unwrap();

    let issued = db.vouchers().issue_codes(batch.id, 2).await.unwrap();
    assert_eq!(issued.len(), 2);
    assert_eq!(issued[0].code, "SPRING-0000");
    assert!(issued.iter().all(|c| c.status == VoucherCodeStatus::Issued));
    assert!(issued.iter().all(|c| c.issued_at.is_some()));

    // Only one available code left.
    let issued = db.vouchers().issue_codes(batch.id, 5).await.unwrap();
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].code, "SPRING-0002");
}

#[tokio::test]
async fn redeem_credit_grant_books_carry_on_existing_assignment() {
    let db = create_db().await;
    let plan = create_plan(&db, "starter", 100).await;
    let subject = Subject::User(3);
    let assignment = create_assignment(&db, subject, plan.id, ts(2024, 1, 1, 0)).await;

    let batch = db
        .vouchers()
        .create_batch(create_batch_input("CR", GrantType::Credit))
        .await
        .unwrap();
    db.vouchers().insert_codes(batch.id, &codes("CR", 1)).await.unwrap();

    let cycle_start = ts(2024, 3, 1, 0);
    let mut params = redeem_params("CR-0000", subject);
    params.existing_assignment_id = Some(assignment.id);
    params.credit = Some(CreditGrant {
        metric: QuotaMetric::Requests,
        cycle_start,
        amount: 50,
        expires_at: None,
    });

    let result = db.vouchers().redeem(params).await.unwrap();
    assert_eq!(result.grant_type, GrantType::Credit);
    assert_eq!(result.credit_amount, 50);
    assert_eq!(result.plan_assignment_id, Some(assignment.id));

    let carry = db
        .assignments()
        .carry_for(assignment.id, QuotaMetric::Requests, cycle_start, cycle_start)
        .await
        .unwrap();
    assert_eq!(carry, 50);

    let code = db
        .vouchers()
        .get_code("CR-0000")
        .await
        .unwrap()
        .expect("code should exist");
    assert_eq!(code.status, VoucherCodeStatus::Redeemed);
    assert_eq!(code.redeemed_by, Some(subject));
}

#[tokio::test]
async fn stacked_credits_in_one_cycle_add_up() {
    let db = create_db().await;
    let plan = create_plan(&db, "starter", 100).await;
    let subject = Subject::User(3);
    let assignment = create_assignment(&db, subject, plan.id, ts(2024, 1, 1, 0)).await;

    let cycle_start = ts(2024, 3, 1, 0);
    for prefix in ["CR1", "CR2"] {
        let batch = db
            .vouchers()
            .create_batch(create_batch_input(prefix, GrantType::Credit))
            .await
            .unwrap();
        db.vouchers().insert_codes(batch.id, &codes(prefix, 1)).await.unwrap();

        let mut params = redeem_params(&format!("{}-0000", prefix), subject);
        params.existing_assignment_id = Some(assignment.id);
        params.credit = Some(CreditGrant {
            metric: QuotaMetric::Requests,
            cycle_start,
            amount: 50,
            expires_at: None,
        });
        db.vouchers().redeem(params).await.unwrap();
    }

    // The second credit grows the cycle's pot instead of being swallowed.
    let carry = db
        .assignments()
        .carry_for(assignment.id, QuotaMetric::Requests, cycle_start, cycle_start)
        .await
        .unwrap();
    assert_eq!(carry, 100);
}

#[tokio::test]
async fn redeem_plan_grant_creates_an_assignment() {
    let db = create_db().await;
    let granted_plan = create_plan(&db, "granted", 200).await;
    let subject = Subject::Token(11);

    let mut input = create_batch_input("PG", GrantType::Plan);
    input.plan_grant_id = Some(granted_plan.id);
    input.plan_grant_duration_days = Some(30);
    let batch = db.vouchers().create_batch(input).await.unwrap();
    db.vouchers().insert_codes(batch.id, &codes("PG", 1)).await.unwrap();

    let now = ts(2024, 3, 1, 0);
    let mut params = redeem_params("PG-0000", subject);
    params.assignment = Some(NewAssignment {
        subject,
        plan_id: granted_plan.id,
        billing_mode: BillingMode::Voucher,
        activated_at: now,
        expires_at: Some(ts(2024, 3, 31, 0)),
        carry_policy: CarryPolicy::None,
        auto_fallback_enabled: false,
        fallback_plan_id: None,
        metadata: None,
    });

    let result = db.vouchers().redeem(params).await.unwrap();
    assert_eq!(result.grant_type, GrantType::Plan);
    assert_eq!(result.plan_granted_id, Some(granted_plan.id));
    let assignment_id = result.plan_assignment_id.expect("assignment created");

    let assignment = db
        .assignments()
        .get_by_id(assignment_id)
        .await
        .unwrap()
        .expect("assignment should exist");
    assert_eq!(assignment.subject, subject);
    assert_eq!(assignment.billing_mode, BillingMode::Voucher);
    assert_eq!(assignment.expires_at, Some(ts(2024, 3, 31, 0)));
}

#[tokio::test]
async fn double_redeem_conflicts() {
    let db = create_db().await;
    let plan = create_plan(&db, "starter", 100).await;
    let subject = Subject::User(3);
    let assignment = create_assignment(&db, subject, plan.id, ts(2024, 1, 1, 0)).await;

    let batch = db
        .vouchers()
        .create_batch(create_batch_input("CR", GrantType::Credit))
        .await
        .unwrap();
    db.vouchers().insert_codes(batch.id, &codes("CR", 1)).await.unwrap();

    let mut params = redeem_params("CR-0000", subject);
    params.existing_assignment_id = Some(assignment.id);
    db.vouchers().redeem(params.clone()).await.unwrap();

    params.subject = Subject::User(4);
    let again = db.vouchers().redeem(params).await;
    assert!(matches!(again, Err(DbError::Conflict(_))));
}

#[tokio::test]
async fn redemption_caps_are_enforced() {
    let db = create_db().await;
    let plan = create_plan(&db, "starter", 100).await;
    let subject = Subject::User(3);
    let assignment = create_assignment(&db, subject, plan.id, ts(2024, 1, 1, 0)).await;

    let mut input = create_batch_input("CAP", GrantType::Credit);
    input.max_redemptions = 1;
    let batch = db.vouchers().create_batch(input).await.unwrap();
    db.vouchers().insert_codes(batch.id, &codes("CAP", 2)).await.unwrap();

    let mut params = redeem_params("CAP-0000", subject);
    params.existing_assignment_id = Some(assignment.id);
    db.vouchers().redeem(params).await.unwrap();
    assert_eq!(db.vouchers().redemption_count(batch.id).await.unwrap(), 1);

    // Batch cap reached, second code in the batch is no longer redeemable.
    let other = Subject::User(8);
    let other_assignment = create_assignment(&db, other, plan.id, ts(2024, 1, 1, 0)).await;
    let mut params = redeem_params("CAP-0001", other);
    params.existing_assignment_id = Some(other_assignment.id);
    let capped = db.vouchers().redeem(params).await;
    assert!(matches!(capped, Err(DbError::Validation(_))));
}

#[tokio::test]
async fn per_subject_cap_is_enforced() {
    let db = create_db().await;
    let plan = create_plan(&db, "starter", 100).await;
    let subject = Subject::User(3);
    let assignment = create_assignment(&db, subject, plan.id, ts(2024, 1, 1, 0)).await;

    let mut input = create_batch_input("ONE", GrantType::Credit);
    input.max_per_subject = 1;
    let batch = db.vouchers().create_batch(input).await.unwrap();
    db.vouchers().insert_codes(batch.id, &codes("ONE", 2)).await.unwrap();

    let mut params = redeem_params("ONE-0000", subject);
    params.existing_assignment_id = Some(assignment.id);
    db.vouchers().redeem(params).await.unwrap();

    let mut params = redeem_params("ONE-0001", subject);
    params.existing_assignment_id = Some(assignment.id);
    let second = db.vouchers().redeem(params).await;
    assert!(matches!(second, Err(DbError::Validation(_))));

    assert_eq!(
        db.vouchers()
            .redemption_count_for_subject(batch.id, &subject)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn validity_window_is_enforced() {
    let db = create_db().await;
    let plan = create_plan(&db, "starter", 100).await;
    let subject = Subject::User(3);
    let assignment = create_assignment(&db, subject, plan.id, ts(2024, 1, 1, 0)).await;

    let mut input = create_batch_input("LATE", GrantType::Credit);
    input.valid_until = Some(ts(2024, 2, 1, 0));
    let batch = db.vouchers().create_batch(input).await.unwrap();
    db.vouchers().insert_codes(batch.id, &codes("LATE", 1)).await.unwrap();

    let mut params = redeem_params("LATE-0000", subject);
    params.existing_assignment_id = Some(assignment.id);
    let expired = db.vouchers().redeem(params).await;
    assert!(matches!(expired, Err(DbError::Validation(_))));

    let unknown = db
        .vouchers()
        .redeem(redeem_params("NOPE-0000", subject))
        .await;
    assert!(matches!(unknown, Err(DbError::NotFound)));
}
