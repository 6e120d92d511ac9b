use as_core::store::StateDb;
use as_core::types::EventStatus;
use serde_json::json;

#[tokio::test]
async fn publish_then_consume_returns_payload_once() {
    let db = StateDb::new_in_memory().await.unwrap();
    let queue = db.queue();

    let sent = queue
        .publish("developer-1", "REWORK_NEEDED", json!({"reasons": ["coverage"]}))
        .await
        .unwrap();

    let got = queue.consume("developer-1").await.unwrap().expect("one event");
    assert_eq!(got.id, sent.id);
    assert_eq!(got.payload, json!({"reasons": ["coverage"]}));
    assert_eq!(got.status, EventStatus::Processing);

    assert!(queue.consume("developer-1").await.unwrap().is_none());

    let done = queue.ack(got.id).await.unwrap();
    assert_eq!(done.status, EventStatus::Done);
    assert!(done.processed_at.is_some());
}

#[tokio::test]
async fn consume_is_fifo_per_target() {
    let db = StateDb::new_in_memory().await.unwrap();
    let queue = db.queue();
    for n in 0..3 {
        queue.publish("manager", "N", json!({ "n": n })).await.unwrap();
        queue.publish("librarian", "N", json!({ "n": n + 10 })).await.unwrap();
    }

    for n in 0..3 {
        let e = queue.consume("manager").await.unwrap().unwrap();
        assert_eq!(e.payload["n"], n);
        queue.ack(e.id).await.unwrap();
    }
    assert_eq!(queue.pending_count("librarian").await.unwrap(), 3);
}

#[tokio::test]
async fn nack_records_reason_and_ack_after_nack_is_refused() {
    let db = StateDb::new_in_memory().await.unwrap();
    let queue = db.queue();
    queue.publish("manager", "X", json!(null)).await.unwrap();

    let e = queue.consume("manager").await.unwrap().unwrap();
    let failed = queue.nack(e.id, "handler panicked").await.unwrap();
    assert_eq!(failed.status, EventStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("handler panicked"));

    assert!(queue.ack(e.id).await.unwrap_err().is_claim_lost());
}

#[tokio::test]
async fn orphaned_processing_events_are_not_redelivered() {
    let db = StateDb::new_in_memory().await.unwrap();
    let queue = db.queue();
    queue.publish("tester-1", "X", json!({})).await.unwrap();

    let claimed = queue.consume("tester-1").await.unwrap().unwrap();
    // Consumer dies without ack.
    assert!(queue.consume("tester-1").await.unwrap().is_none());

    let orphans = queue.orphaned("tester-1").await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].id, claimed.id);
}

#[tokio::test]
async fn racing_consumers_on_separate_connections_get_one_event_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    let db = StateDb::new(&path).await.unwrap();
    let sent = db
        .queue()
        .publish("tester", "VALIDATE", json!({"task": "t-1"}))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let consumer_db = StateDb::new(&path).await.unwrap();
        handles.push(tokio::spawn(async move {
            consumer_db.queue().consume("tester").await.unwrap()
        }));
    }

    let mut claimed = Vec::new();
    for h in handles {
        if let Some(event) = h.await.unwrap() {
            claimed.push(event);
        }
    }
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, sent.id);
    assert_eq!(db.count_events("tester", EventStatus::Processing).await.unwrap(), 1);
    assert_eq!(db.queue().pending_count("tester").await.unwrap(), 0);
}
