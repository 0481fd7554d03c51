use chrono::{DateTime, Utc};

use crate::{
    db::{
        repos::NewRequestLog,
        tests::{fixtures::ts, harness::create_db},
    },
    models::{CreateRequestFlag, FlagReason, QuotaMetric, RequestLogFilter, Subject, SubjectType},
};

fn new_log(request_id: &str, occurred_at: DateTime<Utc>) -> NewRequestLog {
    NewRequestLog {
        request_id: request_id.to_string(),
        occurred_at,
        model_alias: "gpt-4o".to_string(),
        upstream_provider: "openai".to_string(),
        subject_type: SubjectType::User,
        anonymized_subject_hash: "a".repeat(32),
        plan_id: None,
        plan_assignment_id: None,
        usage_metric: QuotaMetric::Requests,
        prompt_tokens: 10,
        completion_tokens: 20,
        total_tokens: 30,
        latency_ms: 120,
        normalized_url: "/v1/chat/completions".to_string(),
        http_method: "POST".to_string(),
        user_agent: "curl/8.0".to_string(),
        param_digest: "d".repeat(64),
        sanitized_cookies: String::new(),
        auth_key_fingerprint: "f".repeat(16),
        metadata: None,
    }
}

#[tokio::test]
async fn insert_is_idempotent_per_request_id() {
    let db = create_db().await;

    let inserted = db
        .request_logs()
        .insert(new_log("req-1", ts(2024, 3, 1, 12)))
        .await
        .unwrap();
    assert!(inserted);

    // Duplicate delivery of the same event is dropped silently.
    let mut dup = new_log("req-1", ts(2024, 3, 1, 12));
    dup.total_tokens = 999;
    let inserted = db.request_logs().insert(dup).await.unwrap();
    assert!(!inserted);

    let log = db
        .request_logs()
        .get_by_request_id("req-1")
        .await
        .unwrap()
        .expect("log should exist");
    assert_eq!(log.total_tokens, 30);
}

#[tokio::test]
async fn list_applies_filters_newest_first() {
    let db = create_db().await;

    db.request_logs()
        .insert(new_log("req-1", ts(2024, 3, 1, 10)))
        .await
        .unwrap();
    db.request_logs()
        .insert(new_log("req-2", ts(2024, 3, 1, 11)))
        .await
        .unwrap();

    let mut other_model = new_log("req-3", ts(2024, 3, 1, 12));
    other_model.model_alias = "claude-sonnet".to_string();
    other_model.subject_type = SubjectType::Token;
    db.request_logs().insert(other_model).await.unwrap();

    let all = db
        .request_logs()
        .list(RequestLogFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].request_id, "req-3");

    let by_model = db
        .request_logs()
        .list(RequestLogFilter {
            model_alias: Some("gpt-4o".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_model.len(), 2);

    let by_subject_type = db
        .request_logs()
        .list(RequestLogFilter {
            subject_type: Some(SubjectType::Token),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_subject_type.len(), 1);
    assert_eq!(by_subject_type[0].request_id, "req-3");

    let windowed = db
        .request_logs()
        .list(RequestLogFilter {
            occurred_after: Some(ts(2024, 3, 1, 11)),
            occurred_before: Some(ts(2024, 3, 1, 12)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(windowed.len(), 1);
    assert_eq!(windowed[0].request_id, "req-2");

    let paged = db
        .request_logs()
        .list(RequestLogFilter {
            limit: Some(1),
            offset: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(paged.len(), 1);
    assert_eq!(paged[0].request_id, "req-2");
}

#[tokio::test]
async fn flags_are_mirrored_onto_the_log_row() {
    let db = create_db().await;
    db.request_logs()
        .insert(new_log("req-1", ts(2024, 3, 1, 10)))
        .await
        .unwrap();

    let flag = db
        .request_logs()
        .create_flag(CreateRequestFlag {
            request_id: "req-1".to_string(),
            subject: Subject::User(5),
            reason: FlagReason::Abuse,
            rerouted_model_alias: Some("gpt-4o-mini".to_string()),
            ttl_at: Some(ts(2024, 3, 8, 10)),
        })
        .await
        .unwrap();
    assert_eq!(flag.reason, FlagReason::Abuse);

    let log = db
        .request_logs()
        .get_by_request_id("req-1")
        .await
        .unwrap()
        .expect("log should exist");
    assert_eq!(log.flag_ids, Some(vec![flag.id]));

    let flags = db.request_logs().flags_for("req-1").await.unwrap();
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].id, flag.id);
    assert_eq!(flags[0].rerouted_model_alias.as_deref(), Some("gpt-4o-mini"));
}

#[tokio::test]
async fn flag_without_a_log_row_still_persists() {
    let db = create_db().await;

    // Enforcement can flag a request whose log has not arrived yet.
    let flag = db
        .request_logs()
        .create_flag(CreateRequestFlag {
            request_id: "req-missing".to_string(),
            subject: Subject::Token(9),
            reason: FlagReason::Violation,
            rerouted_model_alias: None,
            ttl_at: None,
        })
        .await
        .unwrap();

    let flags = db.request_logs().flags_for("req-missing").await.unwrap();
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].id, flag.id);
}

#[tokio::test]
async fn retention_deletes_in_batches_up_to_the_cap() {
    let db = create_db().await;

    for i in 0..5 {
        db.request_logs()
            .insert(new_log(&format!("old-{}", i), ts(2024, 1, 1, i)))
            .await
            .unwrap();
    }
    db.request_logs()
        .insert(new_log("fresh", ts(2024, 3, 1, 0)))
        .await
        .unwrap();

    let deleted = db
        .request_logs()
        .delete_logs_before(ts(2024, 2, 1, 0), 2, 3)
        .await
        .unwrap();
    assert_eq!(deleted, 3);

    let deleted = db
        .request_logs()
        .delete_logs_before(ts(2024, 2, 1, 0), 2, 100)
        .await
        .unwrap();
    assert_eq!(deleted, 2);

    let remaining = db
        .request_logs()
        .list(RequestLogFilter::default())
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].request_id, "fresh");
}

#[tokio::test]
async fn expired_flags_are_purged() {
    let db = create_db().await;

    db.request_logs()
        .create_flag(CreateRequestFlag {
            request_id: "req-1".to_string(),
            subject: Subject::User(5),
            reason: FlagReason::Abuse,
            rerouted_model_alias: None,
            ttl_at: Some(ts(2024, 3, 1, 0)),
        })
        .await
        .unwrap();
    db.request_logs()
        .create_flag(CreateRequestFlag {
            request_id: "req-2".to_string(),
            subject: Subject::User(5),
            reason: FlagReason::Abuse,
            rerouted_model_alias: None,
            ttl_at: None,
        })
        .await
        .unwrap();

    let purged = db
        .request_logs()
        .delete_expired_flags(ts(2024, 3, 2, 0))
        .await
        .unwrap();
    assert_eq!(purged, 1);

    // Flags without a ttl never expire.
    let flags = db.request_logs().flags_for("req-2").await.unwrap();
    assert_eq!(flags.len(), 1);
}
