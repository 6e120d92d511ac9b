use std::sync::Arc;

use as_core::plan::{FeaturePlan, PlanDocument};
use as_core::store::{StateDb, StoreError};
use as_core::types::*;
use chrono::{Duration, Utc};

fn two_convoy_plan(name: &str) -> FeaturePlan {
    let doc = PlanDocument::from_json(&format!(
        r#"{{
            "name": "{name}",
            "convoys": [
                {{"key": "a", "story": "a", "priority": "p1", "files": ["src/a.rs"],
                  "tasks": [{{"title": "a1", "file_path": "src/a.rs"}},
                            {{"title": "a2", "file_path": "src/a.rs"}}]}},
                {{"key": "b", "story": "b", "files": ["src/b.rs"], "depends_on": ["a"],
                  "tasks": [{{"title": "b1", "file_path": "src/b.rs"}}]}}
            ]
        }}"#
    ))
    .unwrap();
    FeaturePlan::from_document(&doc).unwrap()
}

#[tokio::test]
async fn insert_plan_starts_feature_and_writes_children() {
    let db = StateDb::new_in_memory().await.unwrap();
    let plan = two_convoy_plan("checkout");

    let feature = db.insert_plan(&plan).await.unwrap();
    assert_eq!(feature.status, FeatureStatus::InProgress);
    assert!(feature.started_at.is_some());

    let convoys = db.list_convoys(feature.id).await.unwrap();
    assert_eq!(convoys.len(), 2);
    assert_eq!(convoys[0].status, ConvoyStatus::Available);
    assert_eq!(convoys[1].status, ConvoyStatus::Blocked);
    assert_eq!(convoys[1].dependencies, vec![convoys[0].id]);
    assert!(convoys[0].files.contains("src/a.rs"));

    let tasks = db.list_tasks(convoys[0].id).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].title, "a1");
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Todo));
}

#[tokio::test]
async fn second_plan_is_refused_and_leaves_nothing_behind() {
    let db = StateDb::new_in_memory().await.unwrap();
    db.insert_plan(&two_convoy_plan("first")).await.unwrap();

    let second = two_convoy_plan("second");
    let err = db.insert_plan(&second).await.unwrap_err();
    assert!(matches!(err, StoreError::FeatureBusy(_)));

    assert!(db.get_feature(second.feature.id).await.unwrap().is_none());
    assert!(db.list_convoys(second.feature.id).await.unwrap().is_empty());
    assert_eq!(db.list_features().await.unwrap().len(), 1);
}

#[tokio::test]
async fn feature_transition_respects_single_tenancy() {
    let db = StateDb::new_in_memory().await.unwrap();
    let a = Feature::new("a");
    let b = Feature::new("b");
    db.insert_feature(&a).await.unwrap();
    db.insert_feature(&b).await.unwrap();

    db.transition_feature(a.id, FeatureStatus::Ready, FeatureStatus::InProgress)
        .await
        .unwrap();
    let err = db
        .transition_feature(b.id, FeatureStatus::Ready, FeatureStatus::InProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::FeatureBusy(_)));

    let active = db.active_feature().await.unwrap().unwrap();
    assert_eq!(active.id, a.id);

    let done = db
        .transition_feature(a.id, FeatureStatus::InProgress, FeatureStatus::Done)
        .await
        .unwrap();
    assert!(done.completed_at.is_some());
    db.transition_feature(b.id, FeatureStatus::Ready, FeatureStatus::InProgress)
        .await
        .unwrap();
}

#[tokio::test]
async fn conditional_claim_reports_lost_and_missing() {
    let db = StateDb::new_in_memory().await.unwrap();
    let plan = two_convoy_plan("claims");
    db.insert_plan(&plan).await.unwrap();
    let convoy = plan.convoys[0].id;

    let won = db
        .claim_convoy(convoy, ConvoyStatus::Available, ConvoyStatus::InProgress, "developer-1")
        .await
        .unwrap();
    assert_eq!(won.assignee.as_deref(), Some("developer-1"));
    assert!(won.started_at.is_some());

    let lost = db
        .claim_convoy(convoy, ConvoyStatus::Available, ConvoyStatus::InProgress, "developer-2")
        .await
        .unwrap_err();
    assert!(lost.is_claim_lost());

    let missing = db
        .claim_convoy(
            uuid::Uuid::new_v4(),
            ConvoyStatus::Available,
            ConvoyStatus::InProgress,
            "developer-2",
        )
        .await
        .unwrap_err();
    assert!(matches!(missing, StoreError::NotFound { entity: "convoy", .. }));

    let after = db.get_convoy(convoy).await.unwrap().unwrap();
    assert_eq!(after.assignee.as_deref(), Some("developer-1"));
}

#[tokio::test]
async fn concurrent_claims_on_a_file_database_yield_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    let setup = StateDb::new(&path).await.unwrap();
    let plan = two_convoy_plan("race");
    setup.insert_plan(&plan).await.unwrap();
    let convoy = plan.convoys[0].id;

    let mut handles = Vec::new();
    for i in 0..8 {
        let db = Arc::new(StateDb::new(&path).await.unwrap());
        handles.push(tokio::spawn(async move {
            db.claim_convoy(
                convoy,
                ConvoyStatus::Available,
                ConvoyStatus::InProgress,
                &format!("developer-{i}"),
            )
            .await
        }));
    }

    let mut winners = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert!(e.is_claim_lost(), "unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn swap_task_guards_on_failure_count() {
    let db = StateDb::new_in_memory().await.unwrap();
    let plan = two_convoy_plan("swap");
    db.insert_plan(&plan).await.unwrap();
    let task_id = plan.tasks[0].id;

    let claimed = db.claim_task(task_id, "developer-1").await.unwrap();
    assert_eq!(claimed.status, TaskStatus::InProgress);

    let mut first = claimed.clone();
    first.failure_count = 1;
    first.failure_reason = Some("stuck".into());
    db.swap_task(&claimed, &first).await.unwrap();

    // A writer holding the stale copy loses.
    let mut stale = claimed.clone();
    stale.failure_count = 1;
    let err = db.swap_task(&claimed, &stale).await.unwrap_err();
    assert!(err.is_claim_lost());

    let stored = db.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(stored.failure_count, 1);
    assert_eq!(stored.failure_reason.as_deref(), Some("stuck"));
}

#[tokio::test]
async fn tasks_for_assignee_orders_most_recent_first() {
    let db = StateDb::new_in_memory().await.unwrap();
    let plan = two_convoy_plan("assignee");
    db.insert_plan(&plan).await.unwrap();

    let older = db.claim_task(plan.tasks[0].id, "developer-1").await.unwrap();
    let mut backdated = older.clone();
    backdated.started_at = Some(Utc::now() - Duration::minutes(5));
    db.swap_task(&older, &backdated).await.unwrap();
    let newer = db.claim_task(plan.tasks[1].id, "developer-1").await.unwrap();

    let held = db
        .tasks_for_assignee("developer-1", TaskStatus::unfinished())
        .await
        .unwrap();
    assert_eq!(held.len(), 2);
    assert_eq!(held[0].id, newer.id);

    let none = db.tasks_for_assignee("developer-1", &[TaskStatus::Done]).await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn heartbeat_only_refreshes_active_sessions() {
    let db = StateDb::new_in_memory().await.unwrap();
    let mut session = AgentSession::new("developer-1", AgentRole::Developer);
    session.last_heartbeat = Utc::now() - Duration::minutes(10);
    db.upsert_session(&session).await.unwrap();

    assert!(db.record_heartbeat("developer-1", Utc::now()).await.unwrap());
    assert!(!db.record_heartbeat("developer-404", Utc::now()).await.unwrap());

    let stored = db.get_session("developer-1").await.unwrap().unwrap();
    let mut hung = stored.clone();
    hung.status = SessionStatus::Hung;
    db.swap_session(&stored, &hung).await.unwrap();
    assert!(!db.record_heartbeat("developer-1", Utc::now()).await.unwrap());
}

#[tokio::test]
async fn status_snapshot_counts_by_status() {
    let db = StateDb::new_in_memory().await.unwrap();
    let plan = two_convoy_plan("snapshot");
    db.insert_plan(&plan).await.unwrap();
    db.upsert_session(&AgentSession::new("developer-1", AgentRole::Developer))
        .await
        .unwrap();
    db.queue()
        .publish("manager", "PING", serde_json::json!({}))
        .await
        .unwrap();

    let snap = db.status_snapshot().await.unwrap();
    assert_eq!(snap.features, vec![(FeatureStatus::InProgress, 1)]);
    assert!(snap.convoys.contains(&(ConvoyStatus::Available, 1)));
    assert!(snap.convoys.contains(&(ConvoyStatus::Blocked, 1)));
    assert_eq!(snap.tasks, vec![(TaskStatus::Todo, 3)]);
    assert_eq!(snap.sessions, vec![(SessionStatus::Active, 1)]);
    assert_eq!(snap.pending_events, 1);
    assert_eq!(snap.blocked_tasks, 0);
}
