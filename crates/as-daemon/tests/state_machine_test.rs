use as_core::gates::{metric_keys, GateStage, GateThresholds, GateVerdict, Metrics};
use as_core::plan::{FeaturePlan, PlanDocument};
use as_core::store::StateDb;
use as_core::types::{event_types, EventStatus, Task, TaskStatus};
use as_daemon::state_machine::{StateMachineError, TaskStateMachine};
use chrono::Utc;
use uuid::Uuid;

const ESCALATION: &str = "human-review";

async fn started_task(db: &StateDb, criteria: &[&str]) -> Task {
    let criteria = serde_json::to_string(criteria).unwrap();
    let doc = PlanDocument::from_json(&format!(
        r#"{{
            "name": "search",
            "convoys": [{{"key": "idx", "story": "index", "files": ["src/index.rs"],
                "tasks": [{{"title": "build index", "file_path": "src/index.rs",
                            "acceptance_criteria": {criteria}}}]}}]
        }}"#
    ))
    .unwrap();
    let plan = FeaturePlan::from_document(&doc).unwrap();
    db.insert_plan(&plan).await.unwrap();
    plan.tasks[0].clone()
}

fn code_ok() -> Metrics {
    Metrics::new()
        .with(metric_keys::LINT_ERRORS, 0u32)
        .with(metric_keys::TYPE_ERRORS, 0u32)
        .with(metric_keys::MAX_COMPLEXITY, 7u32)
}

fn tests_ok() -> Metrics {
    Metrics::new()
        .with(metric_keys::COVERAGE_PERCENT, 91.0)
        .with(metric_keys::MUTATION_SCORE, 84.0)
}

fn security_ok() -> Metrics {
    Metrics::new()
        .with(metric_keys::SAST_HIGH_FINDINGS, 0u32)
        .with(metric_keys::CRITICAL_CVE_COUNT, 0u32)
        .with(metric_keys::HIGH_CVE_COUNT, 0u32)
        .with(metric_keys::MEDIUM_CVE_COUNT, 2u32)
        .with(metric_keys::SECRET_COUNT, 0u32)
        .with(metric_keys::MERGE_SUCCEEDED, true)
}

fn lint_failure() -> GateVerdict {
    GateVerdict::fail(
        GateStage::CodeQuality,
        vec!["lint_errors 4 exceeds maximum 0".to_string()],
    )
}

async fn fail_review(sm: &TaskStateMachine, db: &StateDb, task_id: Uuid) -> bool {
    sm.submit(db, task_id).await.unwrap();
    sm.apply_verdict(db, task_id, &lint_failure())
        .await
        .unwrap()
        .escalated
}

#[tokio::test]
async fn passing_gates_walk_the_whole_pipeline() {
    let db = StateDb::new_in_memory().await.unwrap();
    let task = started_task(&db, &[]).await;
    let sm = TaskStateMachine::new(3, ESCALATION);
    let thresholds = GateThresholds::default();

    let claimed = sm.claim(&db, task.id, "developer-1").await.unwrap();
    assert_eq!(claimed.status, TaskStatus::InProgress);
    assert_eq!(claimed.assignee.as_deref(), Some("developer-1"));

    sm.submit(&db, task.id).await.unwrap();
    let (v, t) = sm
        .run_gate(&db, task.id, GateStage::CodeQuality, &code_ok(), &thresholds)
        .await
        .unwrap();
    assert!(v.passed);
    assert_eq!(t.task.status, TaskStatus::InTests);

    let (_, t) = sm
        .run_gate(&db, task.id, GateStage::TestQuality, &tests_ok(), &thresholds)
        .await
        .unwrap();
    assert_eq!(t.task.status, TaskStatus::InDocs);

    let (_, t) = sm
        .run_gate(&db, task.id, GateStage::SecurityMerge, &security_ok(), &thresholds)
        .await
        .unwrap();
    assert_eq!(t.task.status, TaskStatus::Done);
    assert!(t.task.completed_at.is_some());
    assert_eq!(t.task.failure_count, 0);
    assert!(t.task.validation_results.is_some());
}

#[tokio::test]
async fn coverage_failure_rolls_back_with_reason_and_rework_event() {
    let db = StateDb::new_in_memory().await.unwrap();
    let task = started_task(&db, &[]).await;
    let sm = TaskStateMachine::new(3, ESCALATION);
    let thresholds = GateThresholds::default();

    sm.claim(&db, task.id, "developer-1").await.unwrap();
    sm.submit(&db, task.id).await.unwrap();
    sm.run_gate(&db, task.id, GateStage::CodeQuality, &code_ok(), &thresholds)
        .await
        .unwrap();

    let low = Metrics::new()
        .with(metric_keys::COVERAGE_PERCENT, 65.0)
        .with(metric_keys::MUTATION_SCORE, 84.0);
    let (verdict, t) = sm
        .run_gate(&db, task.id, GateStage::TestQuality, &low, &thresholds)
        .await
        .unwrap();

    assert!(!verdict.passed);
    assert_eq!(t.from, TaskStatus::InTests);
    assert_eq!(t.task.status, TaskStatus::InProgress);
    assert_eq!(t.task.failure_count, 1);
    let reason = t.task.failure_reason.unwrap();
    assert!(reason.contains("65") && reason.contains("80"), "{reason}");

    let rework = db.queue().consume("developer-1").await.unwrap().unwrap();
    assert_eq!(rework.event_type, event_types::REWORK_NEEDED);
    assert_eq!(rework.payload["task_id"], task.id.to_string());
}

#[tokio::test]
async fn third_failure_blocks_and_escalates_exactly_once() {
    let db = StateDb::new_in_memory().await.unwrap();
    let task = started_task(&db, &[]).await;
    let sm = TaskStateMachine::new(3, ESCALATION);
    sm.claim(&db, task.id, "developer-1").await.unwrap();

    assert!(!fail_review(&sm, &db, task.id).await);
    assert!(!fail_review(&sm, &db, task.id).await);
    assert_eq!(db.count_events(ESCALATION, EventStatus::Pending).await.unwrap(), 0);
    assert!(fail_review(&sm, &db, task.id).await);

    let stored = db.get_task(task.id).await.unwrap().unwrap();
    assert!(stored.blocked);
    assert_eq!(stored.status, TaskStatus::InProgress);
    assert_eq!(stored.failure_count, 3);

    let escalations = db
        .list_events(Some(ESCALATION), None, 10)
        .await
        .unwrap();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].event_type, event_types::ESCALATE_TASK);
    assert_eq!(escalations[0].payload["failure_count"], 3);

    // Frozen until unblocked.
    let err = sm.submit(&db, task.id).await.unwrap_err();
    assert!(matches!(err, StateMachineError::TaskBlocked(id) if id == task.id));
    assert_eq!(db.count_events(ESCALATION, EventStatus::Pending).await.unwrap(), 1);
}

#[tokio::test]
async fn unblocked_task_escalates_again_one_threshold_later() {
    let db = StateDb::new_in_memory().await.unwrap();
    let task = started_task(&db, &[]).await;
    let sm = TaskStateMachine::new(3, ESCALATION);
    sm.claim(&db, task.id, "developer-1").await.unwrap();
    for _ in 0..3 {
        fail_review(&sm, &db, task.id).await;
    }

    let unblocked = sm.unblock(&db, task.id).await.unwrap();
    assert!(!unblocked.blocked);
    assert_eq!(unblocked.failure_count, 3);

    assert!(!fail_review(&sm, &db, task.id).await);
    assert!(!fail_review(&sm, &db, task.id).await);
    assert!(fail_review(&sm, &db, task.id).await);

    assert_eq!(db.count_events(ESCALATION, EventStatus::Pending).await.unwrap(), 2);
    assert_eq!(db.get_task(task.id).await.unwrap().unwrap().failure_count, 6);
}

#[tokio::test]
async fn verdict_for_the_wrong_stage_is_refused() {
    let db = StateDb::new_in_memory().await.unwrap();
    let task = started_task(&db, &[]).await;
    let sm = TaskStateMachine::new(3, ESCALATION);
    sm.claim(&db, task.id, "developer-1").await.unwrap();
    sm.submit(&db, task.id).await.unwrap();

    let err = sm
        .apply_verdict(&db, task.id, &GateVerdict::pass(GateStage::TestQuality))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StateMachineError::StageMismatch { status: TaskStatus::InReview, .. }
    ));
    let stored = db.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::InReview);
    assert_eq!(stored.failure_count, 0);
}

#[tokio::test]
async fn unsatisfied_criteria_fail_the_test_gate() {
    let db = StateDb::new_in_memory().await.unwrap();
    let task = started_task(&db, &["returns results", "handles empty query"]).await;
    let sm = TaskStateMachine::new(3, ESCALATION);
    let thresholds = GateThresholds::default();

    sm.claim(&db, task.id, "developer-1").await.unwrap();
    sm.submit(&db, task.id).await.unwrap();
    sm.run_gate(&db, task.id, GateStage::CodeQuality, &code_ok(), &thresholds)
        .await
        .unwrap();
    sm.mark_criterion(&db, task.id, "ac-1", true, "tester-1")
        .await
        .unwrap();

    let (verdict, t) = sm
        .run_gate(&db, task.id, GateStage::TestQuality, &tests_ok(), &thresholds)
        .await
        .unwrap();
    assert!(!verdict.passed);
    assert!(verdict.reasons[0].contains("ac_satisfied_percent 50"));
    assert_eq!(t.task.status, TaskStatus::InProgress);

    let marked = &t.task.acceptance_criteria[0];
    assert!(marked.satisfied);
    assert_eq!(marked.validator.as_deref(), Some("tester-1"));
    assert!(marked.validated_at.is_some());
}

#[tokio::test]
async fn unknown_criterion_is_reported() {
    let db = StateDb::new_in_memory().await.unwrap();
    let task = started_task(&db, &["one"]).await;
    let sm = TaskStateMachine::new(3, ESCALATION);

    let err = sm
        .mark_criterion(&db, task.id, "ac-9", true, "tester-1")
        .await
        .unwrap_err();
    assert!(matches!(err, StateMachineError::UnknownCriterion { .. }));
}

#[tokio::test]
async fn claim_next_takes_oldest_and_skips_claimed() {
    let db = StateDb::new_in_memory().await.unwrap();
    let doc = PlanDocument::from_json(
        r#"{
            "name": "two tasks",
            "convoys": [{"key": "c", "story": "c", "files": ["a.rs", "b.rs"],
                "tasks": [{"title": "first", "file_path": "a.rs"},
                          {"title": "second", "file_path": "b.rs"}]}]
        }"#,
    )
    .unwrap();
    let plan = FeaturePlan::from_document(&doc).unwrap();
    db.insert_plan(&plan).await.unwrap();
    let convoy_id = plan.convoys[0].id;
    let sm = TaskStateMachine::new(3, ESCALATION);

    let one = sm.claim_next(&db, convoy_id, "developer-1").await.unwrap().unwrap();
    let two = sm.claim_next(&db, convoy_id, "developer-2").await.unwrap().unwrap();
    assert_eq!(one.title, "first");
    assert_eq!(two.title, "second");
    assert!(sm.claim_next(&db, convoy_id, "developer-3").await.unwrap().is_none());
}

#[tokio::test]
async fn stuck_failure_counts_towards_escalation() {
    let db = StateDb::new_in_memory().await.unwrap();
    let task = started_task(&db, &[]).await;
    let sm = TaskStateMachine::new(2, ESCALATION);
    let claimed = sm.claim(&db, task.id, "developer-1").await.unwrap();

    let first = sm.record_failure(&db, &claimed, "stuck", Utc::now()).await.unwrap();
    assert!(!first.escalated);
    fail_review(&sm, &db, task.id).await;

    let stored = db.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.failure_count, 2);
    assert!(stored.blocked);
    assert_eq!(db.count_events(ESCALATION, EventStatus::Pending).await.unwrap(), 1);
}

#[tokio::test]
async fn stale_failure_observation_is_not_counted() {
    let db = StateDb::new_in_memory().await.unwrap();
    let task = started_task(&db, &[]).await;
    let sm = TaskStateMachine::new(3, ESCALATION);
    let observed = sm.claim(&db, task.id, "developer-1").await.unwrap();

    sm.record_failure(&db, &observed, "stuck", Utc::now()).await.unwrap();
    let err = sm.record_failure(&db, &observed, "stuck", Utc::now()).await.unwrap_err();
    assert!(matches!(err, StateMachineError::Store(ref e) if e.is_claim_lost()));

    let stored = db.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.failure_count, 1);
}
