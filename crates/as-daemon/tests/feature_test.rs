use as_core::gates::{GateStage, GateVerdict};
use as_core::plan::{FeaturePlan, PlanDocument};
use as_core::store::StateDb;
use as_core::types::*;
use as_daemon::allocator::ConvoyAllocator;
use as_daemon::feature::{FeatureError, FeatureLifecycle};
use as_daemon::state_machine::TaskStateMachine;
use uuid::Uuid;

const DOCS: &str = "librarian";

fn chained_plan() -> FeaturePlan {
    let doc = PlanDocument::from_json(
        r#"{
            "name": "billing",
            "convoys": [
                {"key": "model", "story": "invoice model", "files": ["src/invoice.rs"],
                 "tasks": [{"title": "struct", "file_path": "src/invoice.rs"}]},
                {"key": "api", "story": "invoice api", "files": ["src/routes.rs"], "depends_on": ["model"],
                 "tasks": [{"title": "route", "file_path": "src/routes.rs"}]}
            ]
        }"#,
    )
    .unwrap();
    FeaturePlan::from_document(&doc).unwrap()
}

/// Drive a claimed task through every gate.
async fn finish(sm: &TaskStateMachine, db: &StateDb, task_id: Uuid) {
    sm.submit(db, task_id).await.unwrap();
    for stage in [GateStage::CodeQuality, GateStage::TestQuality, GateStage::SecurityMerge] {
        sm.apply_verdict(db, task_id, &GateVerdict::pass(stage))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn completion_rolls_up_from_task_state() {
    let db = StateDb::new_in_memory().await.unwrap();
    let lifecycle = FeatureLifecycle::new(DOCS);
    let plan = chained_plan();
    let feature = lifecycle.start_feature(&db, &plan).await.unwrap();
    let allocator = ConvoyAllocator::default();
    let sm = TaskStateMachine::new(3, "human-review");

    let model = allocator.allocate(&db, feature.id, "developer-1").await.unwrap().unwrap();
    let task = sm.claim_next(&db, model.id, "developer-1").await.unwrap().unwrap();
    finish(&sm, &db, task.id).await;

    // The task is done but nothing has recorded it on the convoy yet.
    assert_eq!(
        db.get_convoy(model.id).await.unwrap().unwrap().status,
        ConvoyStatus::InProgress
    );

    let report = lifecycle.reconcile(&db, feature.id).await.unwrap();
    assert_eq!(report.convoys_completed, vec![model.id]);
    assert_eq!(report.unblocked, vec![plan.convoys[1].id]);
    assert!(!report.feature_done);

    let docs = db.queue().consume(DOCS).await.unwrap().unwrap();
    assert_eq!(docs.event_type, event_types::UPDATE_DOCS);
    assert_eq!(docs.payload["convoy_id"], model.id.to_string());

    let again = lifecycle.reconcile(&db, feature.id).await.unwrap();
    assert!(again.is_empty(), "reconcile is idempotent: {again:?}");

    let api = allocator.allocate(&db, feature.id, "developer-2").await.unwrap().unwrap();
    assert_eq!(api.id, plan.convoys[1].id);
    let task = sm.claim_next(&db, api.id, "developer-2").await.unwrap().unwrap();
    finish(&sm, &db, task.id).await;

    let last = lifecycle.reconcile(&db, feature.id).await.unwrap();
    assert!(last.feature_done);
    let stored = db.get_feature(feature.id).await.unwrap().unwrap();
    assert_eq!(stored.status, FeatureStatus::Done);
    assert!(stored.completed_at.is_some());

    let types: Vec<String> = db
        .list_events(Some(DOCS), None, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        types,
        vec![event_types::UPDATE_DOCS, event_types::UPDATE_DOCS, event_types::FEATURE_DONE]
    );
}

#[tokio::test]
async fn partially_done_convoy_stays_in_progress() {
    let db = StateDb::new_in_memory().await.unwrap();
    let doc = PlanDocument::from_json(
        r#"{"name": "half", "convoys": [{"key": "c", "story": "c", "files": ["a", "b"],
            "tasks": [{"title": "a", "file_path": "a"}, {"title": "b", "file_path": "b"}]}]}"#,
    )
    .unwrap();
    let plan = FeaturePlan::from_document(&doc).unwrap();
    let lifecycle = FeatureLifecycle::new(DOCS);
    let feature = lifecycle.start_feature(&db, &plan).await.unwrap();
    let sm = TaskStateMachine::new(3, "human-review");

    let convoy = ConvoyAllocator::default()
        .allocate(&db, feature.id, "developer-1")
        .await
        .unwrap()
        .unwrap();
    let first = sm.claim_next(&db, convoy.id, "developer-1").await.unwrap().unwrap();
    finish(&sm, &db, first.id).await;

    let report = lifecycle.reconcile(&db, feature.id).await.unwrap();
    assert!(report.convoys_completed.is_empty());
    assert_eq!(
        db.get_convoy(convoy.id).await.unwrap().unwrap().status,
        ConvoyStatus::InProgress
    );
}

#[tokio::test]
async fn blocked_convoys_list_what_they_wait_on() {
    let db = StateDb::new_in_memory().await.unwrap();
    let lifecycle = FeatureLifecycle::new(DOCS);
    let plan = chained_plan();
    let feature = lifecycle.start_feature(&db, &plan).await.unwrap();

    let blocked = lifecycle.blocked_convoys(&db, feature.id).await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].convoy.id, plan.convoys[1].id);
    assert_eq!(blocked[0].waiting_on, vec![plan.convoys[0].id]);
}

#[tokio::test]
async fn stop_notifies_active_sessions_and_sets_the_flag() {
    let db = StateDb::new_in_memory().await.unwrap();
    let lifecycle = FeatureLifecycle::new(DOCS);
    let feature = lifecycle.start_feature(&db, &chained_plan()).await.unwrap();

    db.upsert_session(&AgentSession::new("developer-1", AgentRole::Developer))
        .await
        .unwrap();
    let mut crashed = AgentSession::new("developer-2", AgentRole::Developer);
    crashed.status = SessionStatus::Crashed;
    db.upsert_session(&crashed).await.unwrap();

    assert!(!lifecycle.is_stopping(&db, feature.id).await.unwrap());
    let notified = lifecycle
        .stop_feature(&db, feature.id, "requirements changed")
        .await
        .unwrap();
    assert_eq!(notified, 1);
    assert!(lifecycle.is_stopping(&db, feature.id).await.unwrap());

    let stop = db.queue().consume("developer-1").await.unwrap().unwrap();
    assert_eq!(stop.event_type, event_types::STOP);
    assert_eq!(stop.payload["reason"], "requirements changed");
    assert!(db.queue().consume("developer-2").await.unwrap().is_none());

    // Stopping twice is a no-op.
    assert_eq!(lifecycle.stop_feature(&db, feature.id, "again").await.unwrap(), 0);
    // And a new feature may start.
    lifecycle.start_feature(&db, &chained_plan()).await.unwrap();
}

#[tokio::test]
async fn stopping_an_unknown_feature_fails() {
    let db = StateDb::new_in_memory().await.unwrap();
    let err = FeatureLifecycle::new(DOCS)
        .stop_feature(&db, Uuid::new_v4(), "why")
        .await
        .unwrap_err();
    assert!(matches!(err, FeatureError::NotFound(_)));
}
