use crate::{
    cycle::CycleWindow,
    db::{
        error::DbError,
        tests::{fixtures::*, harness::create_db},
    },
    models::{ConsumeOutcome, QuotaMetric, Subject},
};

fn march_window() -> CycleWindow {
    CycleWindow {
        start: ts(2024, 3, 1, 0),
        end: ts(2024, 4, 1, 0),
    }
}

#[tokio::test]
async fn increment_accumulates_within_a_cycle() {
    let db = create_db().await;
    let plan = create_plan(&db, "starter", 100).await;
    let assignment = create_assignment(&db, Subject::User(1), plan.id, ts(2024, 1, 1, 0)).await;
    let window = march_window();

    let counter = db
        .usage_counters()
        .increment(assignment.id, QuotaMetric::Requests, window, 3)
        .await
        .unwrap();
    assert_eq!(counter.consumed_amount, 3);
    assert_eq!(counter.cycle_start, window.start);
    assert_eq!(counter.cycle_end, window.end);

    let counter = db
        .usage_counters()
        .increment(assignment.id, QuotaMetric::Requests, window, 4)
        .await
        .unwrap();
    assert_eq!(counter.consumed_amount, 7);

    // A different metric gets its own row.
    let tokens = db
        .usage_counters()
        .increment(assignment.id, QuotaMetric::Tokens, window, 500)
        .await
        .unwrap();
    assert_eq!(tokens.consumed_amount, 500);
    assert_ne!(tokens.id, counter.id);
}

#[tokio::test]
async fn check_and_consume_charges_up_to_the_ceiling() {
    let db = create_db().await;
    let plan = create_plan(&db, "starter", 10).await;
    let assignment = create_assignment(&db, Subject::User(1), plan.id, ts(2024, 1, 1, 0)).await;
    let window = march_window();

    let outcome = db
        .usage_counters()
        .check_and_consume(assignment.id, QuotaMetric::Requests, window, 6, 10)
        .await
        .unwrap();
    assert_eq!(outcome, ConsumeOutcome::Consumed { remaining: 4 });

    // Exact fit still passes.
    let outcome = db
        .usage_counters()
        .check_and_consume(assignment.id, QuotaMetric::Requests, window, 4, 10)
        .await
        .unwrap();
    assert_eq!(outcome, ConsumeOutcome::Consumed { remaining: 0 });

    // Overrun is rejected without charging.
    let outcome = db
        .usage_counters()
        .check_and_consume(assignment.id, QuotaMetric::Requests, window, 1, 10)
        .await
        .unwrap();
    assert_eq!(outcome, ConsumeOutcome::Exceeded { remaining: 0 });

    let counter = db
        .usage_counters()
        .get(assignment.id, QuotaMetric::Requests, window.start)
        .await
        .unwrap()
        .expect("counter should exist");
    assert_eq!(counter.consumed_amount, 10);
}

#[tokio::test]
async fn check_and_consume_honors_a_raised_ceiling() {
    let db = create_db().await;
    let plan = create_plan(&db, "starter", 10).await;
    let assignment = create_assignment(&db, Subject::User(1), plan.id, ts(2024, 1, 1, 0)).await;
    let window = march_window();

    db.usage_counters()
        .check_and_consume(assignment.id, QuotaMetric::Requests, window, 10, 10)
        .await
        .unwrap();

    // Carried-over credit widens the ceiling for the same counter row.
    let outcome = db
        .usage_counters()
        .check_and_consume(assignment.id, QuotaMetric::Requests, window, 5, 15)
        .await
        .unwrap();
    assert_eq!(outcome, ConsumeOutcome::Consumed { remaining: 0 });
}

#[tokio::test]
async fn latest_ended_before_picks_the_most_recent_closed_cycle() {
    let db = create_db().await;
    let plan = create_plan(&db, "starter", 100).await;
    let assignment = create_assignment(&db, Subject::User(1), plan.id, ts(2024, 1, 1, 0)).await;

    let january = CycleWindow {
        start: ts(2024, 1, 1, 0),
        end: ts(2024, 2, 1, 0),
    };
    let february = CycleWindow {
        start: ts(2024, 2, 1, 0),
        end: ts(2024, 3, 1, 0),
    };
    db.usage_counters()
        .increment(assignment.id, QuotaMetric::Requests, january, 10)
        .await
        .unwrap();
    db.usage_counters()
        .increment(assignment.id, QuotaMetric::Requests, february, 20)
        .await
        .unwrap();

    let latest = db
        .usage_counters()
        .latest_ended_before(assignment.id, QuotaMetric::Requests, ts(2024, 3, 15, 0))
        .await
        .unwrap()
        .expect("closed cycle should exist");
    assert_eq!(latest.cycle_start, february.start);
    assert_eq!(latest.consumed_amount, 20);

    // A still-open cycle does not count as closed.
    let none = db
        .usage_counters()
        .latest_ended_before(assignment.id, QuotaMetric::Requests, ts(2024, 1, 15, 0))
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn increment_rejects_negative_amounts() {
    let db = create_db().await;
    let plan = create_plan(&db, "starter", 100).await;
    let assignment = create_assignment(&db, Subject::User(1), plan.id, ts(2024, 1, 1, 0)).await;
    let window = march_window();

    db.usage_counters()
        .increment(assignment.id, QuotaMetric::Requests, window, 8)
        .await
        .unwrap();

    let refund = db
        .usage_counters()
        .increment(assignment.id, QuotaMetric::Requests, window, -5)
        .await;
    assert!(matches!(refund, Err(DbError::Validation(_))));

    let counter = db
        .usage_counters()
        .get(assignment.id, QuotaMetric::Requests, window.start)
        .await
        .unwrap()
        .expect("counter should exist");
    assert_eq!(counter.consumed_amount, 8);
}

#[tokio::test]
async fn increment_of_zero_opens_no_row() {
    let db = create_db().await;
    let plan = create_plan(&db, "starter", 100).await;
    let assignment = create_assignment(&db, Subject::User(1), plan.id, ts(2024, 1, 1, 0)).await;
    let window = march_window();

    let counter = db
        .usage_counters()
        .increment(assignment.id, QuotaMetric::Requests, window, 0)
        .await
        .unwrap();
    assert_eq!(counter.consumed_amount, 0);

    let none = db
        .usage_counters()
        .get(assignment.id, QuotaMetric::Requests, window.start)
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn cycle_end_never_moves_backward() {
    let db = create_db().await;
    let plan = create_plan(&db, "starter", 100).await;
    let assignment = create_assignment(&db, Subject::User(1), plan.id, ts(2024, 1, 1, 0)).await;

    let window = march_window();
    db.usage_counters()
        .increment(assignment.id, QuotaMetric::Requests, window, 3)
        .await
        .unwrap();

    // A late increment carrying a shorter window for the same cycle.
    let stale = CycleWindow {
        start: window.start,
        end: ts(2024, 3, 15, 0),
    };
    let counter = db
        .usage_counters()
        .increment(assignment.id, QuotaMetric::Requests, stale, 2)
        .await
        .unwrap();
    assert_eq!(counter.consumed_amount, 5);
    assert_eq!(counter.cycle_end, window.end);
}

#[tokio::test]
async fn reset_deletes_the_cycle_row() {
    let db = create_db().await;
    let plan = create_plan(&db, "starter", 100).await;
    let assignment = create_assignment(&db, Subject::User(1), plan.id, ts(2024, 1, 1, 0)).await;
    let window = march_window();

    db.usage_counters()
        .increment(assignment.id, QuotaMetric::Requests, window, 42)
        .await
        .unwrap();
    db.usage_counters()
        .reset(assignment.id, QuotaMetric::Requests, window.start)
        .await
        .unwrap();

    let gone = db
        .usage_counters()
        .get(assignment.id, QuotaMetric::Requests, window.start)
        .await
        .unwrap();
    assert!(gone.is_none());

    // A voided cycle is no longer a carry-over source.
    let none = db
        .usage_counters()
        .latest_ended_before(assignment.id, QuotaMetric::Requests, ts(2024, 4, 15, 0))
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn remaining_clamps_at_zero() {
    let counter = crate::models::UsageCounter {
        id: 1,
        plan_assignment_id: 1,
        metric: QuotaMetric::Requests,
        cycle_start: ts(2024, 3, 1, 0),
        cycle_end: ts(2024, 4, 1, 0),
        consumed_amount: 12,
        created_at: ts(2024, 3, 1, 0),
        updated_at: ts(2024, 3, 1, 0),
    };
    assert_eq!(counter.remaining(10), 0);
    assert_eq!(counter.remaining(20), 8);
}
