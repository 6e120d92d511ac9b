//! Feature lifecycle: start from a validated plan, advisory stop, and
//! completion rollup.
//!
//! Convoy and feature completion are never trusted from a cached flag.
//! [`FeatureLifecycle::reconcile`] re-derives them from task state, so a
//! crash between a task reaching `done` and its convoy being marked `done`
//! heals on the next sweep.

use std::collections::HashMap;

use serde_json::json;
use uuid::Uuid;

use as_core::config::Config;
use as_core::plan::FeaturePlan;
use as_core::store::{StateDb, StoreError};
use as_core::types::{
    event_types, Convoy, ConvoyStatus, Feature, FeatureStatus, SessionId, SessionStatus,
    TaskStatus,
};

use crate::allocator::{validate_plan, AllocatorError};

#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    #[error("feature {0} not found")]
    NotFound(Uuid),
    #[error("feature {id} is {from:?} and cannot move to {to:?}")]
    InvalidTransition {
        id: Uuid,
        from: FeatureStatus,
        to: FeatureStatus,
    },
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub convoys_completed: Vec<Uuid>,
    pub unblocked: Vec<Uuid>,
    pub reblocked: Vec<Uuid>,
    pub feature_done: bool,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.convoys_completed.is_empty()
            && self.unblocked.is_empty()
            && self.reblocked.is_empty()
            && !self.feature_done
    }
}

#[derive(Debug, Clone)]
pub struct BlockedConvoy {
    pub convoy: Convoy,
    /// Dependencies not yet `done`.
    pub waiting_on: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct FeatureLifecycle {
    docs_target: SessionId,
}

impl FeatureLifecycle {
    pub fn new(docs_target: impl Into<SessionId>) -> Self {
        Self {
            docs_target: docs_target.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.escalation.docs_target.clone())
    }

    /// Validate the plan and write it in one transaction. Nothing is written
    /// when validation fails or another feature is in progress.
    pub async fn start_feature(
        &self,
        db: &StateDb,
        plan: &FeaturePlan,
    ) -> Result<Feature, FeatureError> {
        validate_plan(plan)?;
        let feature = db.insert_plan(plan).await?;
        tracing::info!(
            feature_id = %feature.id,
            name = %feature.name,
            convoys = plan.convoys.len(),
            tasks = plan.tasks.len(),
            "feature started"
        );
        Ok(feature)
    }

    /// Advisory stop. The feature is marked `failed` and every active
    /// session gets a `STOP` event; workers finish their current transition
    /// and exit when they see it. Returns the number of sessions notified.
    pub async fn stop_feature(
        &self,
        db: &StateDb,
        feature_id: Uuid,
        reason: &str,
    ) -> Result<usize, FeatureError> {
        let feature = db
            .get_feature(feature_id)
            .await?
            .ok_or(FeatureError::NotFound(feature_id))?;

        match feature.status {
            FeatureStatus::Failed => return Ok(0),
            FeatureStatus::Done => {
                return Err(FeatureError::InvalidTransition {
                    id: feature_id,
                    from: FeatureStatus::Done,
                    to: FeatureStatus::Failed,
                })
            }
            from => match db.transition_feature(feature_id, from, FeatureStatus::Failed).await {
                Ok(_) => {}
                // Someone else stopped or finished it first.
                Err(e) if e.is_claim_lost() => return Ok(0),
                Err(e) => return Err(e.into()),
            },
        }

        let sessions = db.list_sessions_by_status(SessionStatus::Active).await?;
        let queue = db.queue();
        for session in &sessions {
            queue
                .publish(
                    &session.id,
                    event_types::STOP,
                    json!({ "feature_id": feature_id, "reason": reason }),
                )
                .await?;
        }

        tracing::warn!(
            feature_id = %feature_id,
            reason,
            notified = sessions.len(),
            "feature stopped"
        );
        Ok(sessions.len())
    }

    /// The flag workers poll between transitions.
    pub async fn is_stopping(&self, db: &StateDb, feature_id: Uuid) -> Result<bool, FeatureError> {
        let feature = db
            .get_feature(feature_id)
            .await?
            .ok_or(FeatureError::NotFound(feature_id))?;
        Ok(feature.status == FeatureStatus::Failed)
    }

    /// Re-derive convoy and feature status from task state. Idempotent; a
    /// lost race on any single row is left for the next pass.
    pub async fn reconcile(
        &self,
        db: &StateDb,
        feature_id: Uuid,
    ) -> Result<ReconcileReport, FeatureError> {
        let feature = db
            .get_feature(feature_id)
            .await?
            .ok_or(FeatureError::NotFound(feature_id))?;
        let mut report = ReconcileReport::default();
        if feature.status != FeatureStatus::InProgress {
            return Ok(report);
        }

        let queue = db.queue();
        let mut convoys = db.list_convoys(feature_id).await?;

        for convoy in convoys.iter_mut() {
            if convoy.status != ConvoyStatus::InProgress {
                continue;
            }
            let tasks = db.list_tasks(convoy.id).await?;
            if tasks.is_empty() || !tasks.iter().all(|t| t.status == TaskStatus::Done) {
                continue;
            }

            let mut next = convoy.clone();
            next.status = ConvoyStatus::Done;
            next.completed_at = Some(chrono::Utc::now());
            match db.swap_convoy(convoy, &next).await {
                Ok(stored) => {
                    *convoy = stored;
                    report.convoys_completed.push(convoy.id);
                    queue
                        .publish(
                            &self.docs_target,
                            event_types::UPDATE_DOCS,
                            json!({
                                "feature_id": feature_id,
                                "convoy_id": convoy.id,
                                "story": convoy.story,
                                "files": convoy.files,
                            }),
                        )
                        .await?;
                    tracing::info!(convoy_id = %convoy.id, "convoy done");
                }
                Err(e) if e.is_claim_lost() => {
                    tracing::debug!(convoy_id = %convoy.id, "convoy changed during reconcile");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let done: HashMap<Uuid, bool> = convoys
            .iter()
            .map(|c| (c.id, c.status == ConvoyStatus::Done))
            .collect();

        for convoy in convoys.iter_mut() {
            let deps_done = convoy
                .dependencies
                .iter()
                .all(|d| done.get(d).copied().unwrap_or(false));
            let to = match (convoy.status, deps_done) {
                (ConvoyStatus::Blocked, true) => ConvoyStatus::Available,
                (ConvoyStatus::Available, false) => ConvoyStatus::Blocked,
                _ => continue,
            };

            let mut next = convoy.clone();
            next.status = to;
            match db.swap_convoy(convoy, &next).await {
                Ok(stored) => {
                    *convoy = stored;
                    if to == ConvoyStatus::Available {
                        report.unblocked.push(convoy.id);
                        tracing::info!(convoy_id = %convoy.id, "convoy unblocked");
                    } else {
                        report.reblocked.push(convoy.id);
                        tracing::info!(convoy_id = %convoy.id, "convoy blocked on dependencies");
                    }
                }
                Err(e) if e.is_claim_lost() => {}
                Err(e) => return Err(e.into()),
            }
        }

        if !convoys.is_empty() && convoys.iter().all(|c| c.status == ConvoyStatus::Done) {
            match db
                .transition_feature(feature_id, FeatureStatus::InProgress, FeatureStatus::Done)
                .await
            {
                Ok(_) => {
                    report.feature_done = true;
                    queue
                        .publish(
                            &self.docs_target,
                            event_types::FEATURE_DONE,
                            json!({ "feature_id": feature_id, "name": feature.name }),
                        )
                        .await?;
                    tracing::info!(feature_id = %feature_id, "feature done");
                }
                Err(e) if e.is_claim_lost() => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(report)
    }

    pub async fn blocked_convoys(
        &self,
        db: &StateDb,
        feature_id: Uuid,
    ) -> Result<Vec<BlockedConvoy>, FeatureError> {
        let convoys = db.list_convoys(feature_id).await?;
        let status: HashMap<Uuid, ConvoyStatus> =
            convoys.iter().map(|c| (c.id, c.status)).collect();

        Ok(convoys
            .iter()
            .filter(|c| c.status == ConvoyStatus::Blocked)
            .map(|c| BlockedConvoy {
                convoy: c.clone(),
                waiting_on: c
                    .dependencies
                    .iter()
                    .filter(|d| status.get(d) != Some(&ConvoyStatus::Done))
                    .copied()
                    .collect(),
            })
            .collect())
    }
}
