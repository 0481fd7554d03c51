use crate::{
    db::{DbError, tests::fixtures::*, tests::harness::create_db},
    models::{CarryPolicy, PlanFilter, UpdatePlan},
};

#[tokio::test]
async fn create_and_fetch_by_code() {
    let db = create_db().await;

    let plan = create_plan(&db, "starter", 100).await;
    assert_eq!(plan.code, "starter");
    assert_eq!(plan.quota_amount, 100);
    assert!(plan.is_active);

    let fetched = db
        .plans()
        .get_by_code("starter")
        .await
        .unwrap()
        .expect("plan should exist");
    assert_eq!(fetched.id, plan.id);
}

#[tokio::test]
async fn duplicate_code_conflicts() {
    let db = create_db().await;
    create_plan(&db, "starter", 100).await;

    let result = db.plans().create(create_plan_input("starter", 200)).await;
    assert!(matches!(result, Err(DbError::Conflict(_))));
}

#[tokio::test]
async fn code_is_reusable_after_soft_delete() {
    let db = create_db().await;
    let plan = create_plan(&db, "starter", 100).await;

    db.plans().soft_delete(plan.id).await.unwrap();
    assert!(db.plans().get_by_id(plan.id).await.unwrap().is_none());
    assert!(db.plans().get_by_code("starter").await.unwrap().is_none());

    // Partial unique index only covers live rows.
    let replacement = create_plan(&db, "starter", 500).await;
    assert_ne!(replacement.id, plan.id);
}

#[tokio::test]
async fn update_is_partial() {
    let db = create_db().await;
    let plan = create_plan(&db, "starter", 100).await;

    let updated = db
        .plans()
        .update(
            plan.id,
            UpdatePlan {
                quota_amount: Some(250),
                carry_policy: Some(CarryPolicy::CarryAll),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.quota_amount, 250);
    assert_eq!(updated.carry_policy, CarryPolicy::CarryAll);
    // Untouched fields survive.
    assert_eq!(updated.name, plan.name);
    assert_eq!(updated.cycle_type, plan.cycle_type);
}

#[tokio::test]
async fn update_missing_plan_is_not_found() {
    let db = create_db().await;
    let result = db.plans().update(9999, UpdatePlan::default()).await;
    assert!(matches!(result, Err(DbError::NotFound)));
}

#[tokio::test]
async fn list_filters_inactive_and_system() {
    let db = create_db().await;

    create_plan(&db, "active", 10).await;

    let inactive = create_plan(&db, "inactive", 10).await;
    db.plans()
        .update(
            inactive.id,
            UpdatePlan {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut system_input = create_plan_input("system", 0);
    system_input.is_system = true;
    db.plans().create(system_input).await.unwrap();

    let default_list = db.plans().list(PlanFilter::default()).await.unwrap();
    assert_eq!(default_list.len(), 1);
    assert_eq!(default_list[0].code, "active");

    let with_inactive = db
        .plans()
        .list(PlanFilter {
            include_inactive: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(with_inactive.len(), 2);

    let with_system = db
        .plans()
        .list(PlanFilter {
            include_system: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(with_system.len(), 2);
}
