//! Durable per-target mailbox on top of the `events` table.
//!
//! Consumers compete for events with the store's conditional transition, so
//! an event moves `pending -> processing` for exactly one caller. Delivery is
//! at-least-once: an event left in `processing` by a crashed consumer is not
//! requeued. Work is re-derived from task and convoy state instead.

use serde_json::Value;
use uuid::Uuid;

use crate::store::{StateDb, StoreError, StoreResult};
use crate::types::{Event, EventStatus};

/// How many lost races `consume` tolerates before reporting an empty queue.
const MAX_CONSUME_ATTEMPTS: usize = 8;
const ORPHAN_SCAN_LIMIT: usize = 1000;

pub struct EventQueue<'a> {
    db: &'a StateDb,
}

impl StateDb {
    pub fn queue(&self) -> EventQueue<'_> {
        EventQueue { db: self }
    }
}

impl<'a> EventQueue<'a> {
    pub async fn publish(
        &self,
        target: &str,
        event_type: &str,
        payload: Value,
    ) -> StoreResult<Event> {
        let event = Event::new(target, event_type, payload);
        self.db.insert_event(&event).await?;
        tracing::debug!(event_id = %event.id, target, event_type, "event published");
        Ok(event)
    }

    /// Claim the oldest pending event for `target`. Returns `None` when the
    /// mailbox is empty.
    pub async fn consume(&self, target: &str) -> StoreResult<Option<Event>> {
        for _ in 0..MAX_CONSUME_ATTEMPTS {
            let Some(head) = self.db.oldest_pending_event(target).await? else {
                return Ok(None);
            };
            match self
                .db
                .transition_event(head.id, EventStatus::Pending, EventStatus::Processing, None)
                .await
            {
                Ok(event) => {
                    tracing::debug!(event_id = %event.id, target, "event claimed");
                    return Ok(Some(event));
                }
                Err(StoreError::ClaimLost { .. }) => {
                    tracing::trace!(event_id = %head.id, target, "event claimed elsewhere");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    pub async fn ack(&self, id: Uuid) -> StoreResult<Event> {
        self.db
            .transition_event(id, EventStatus::Processing, EventStatus::Done, None)
            .await
    }

    pub async fn nack(&self, id: Uuid, reason: &str) -> StoreResult<Event> {
        tracing::warn!(event_id = %id, reason, "event failed");
        self.db
            .transition_event(
                id,
                EventStatus::Processing,
                EventStatus::Failed,
                Some(reason.to_string()),
            )
            .await
    }

    pub async fn pending_count(&self, target: &str) -> StoreResult<u64> {
        self.db.count_events(target, EventStatus::Pending).await
    }

    /// Events stuck in `processing` for `target`. Reported for operators only.
    pub async fn orphaned(&self, target: &str) -> StoreResult<Vec<Event>> {
        self.db
            .list_events(Some(target), Some(EventStatus::Processing), ORPHAN_SCAN_LIMIT)
            .await
    }
}
