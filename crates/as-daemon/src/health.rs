//! Heartbeat-based failure detection and session recovery.
//!
//! [`HealthMonitor::check`] is one sweep: classify every active session,
//! replace the ones that failed, and retry replacements that could not be
//! spawned earlier. Replacement workers find their work in the store; no
//! context travels with the recovery event.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use as_core::config::Config;
use as_core::store::{StateDb, StoreError};
use as_core::types::{
    event_types, AgentSession, SessionId, SessionStatus, Task, TaskStatus,
};
use as_telemetry::metrics::{global_metrics, names};

use crate::process::{Assignment, ProcessError, ProcessManager};
use crate::state_machine::{StateMachineError, TaskStateMachine};

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
}

/// What one sweep found and did.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub checked: usize,
    pub crashed: Vec<SessionId>,
    pub hung: Vec<SessionId>,
    pub stuck: Vec<SessionId>,
    /// `(old, replacement)`
    pub replaced: Vec<(SessionId, SessionId)>,
    pub restart_failures: Vec<SessionId>,
    /// Sessions whose restart limit was reached during this sweep.
    pub escalated: Vec<SessionId>,
}

impl HealthReport {
    pub fn is_quiet(&self) -> bool {
        self.crashed.is_empty()
            && self.hung.is_empty()
            && self.stuck.is_empty()
            && self.replaced.is_empty()
            && self.restart_failures.is_empty()
    }
}

pub struct HealthMonitor {
    hung_after: Duration,
    stuck_after: Duration,
    restart_limit: u32,
    escalation_target: SessionId,
    coordinator_target: SessionId,
    state_machine: TaskStateMachine,
}

impl HealthMonitor {
    pub fn new(
        hung_after: Duration,
        stuck_after: Duration,
        restart_limit: u32,
        state_machine: TaskStateMachine,
    ) -> Self {
        Self {
            hung_after,
            stuck_after,
            restart_limit: restart_limit.max(1),
            escalation_target: "human-review".into(),
            coordinator_target: "manager".into(),
            state_machine,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            hung_after: Duration::from_secs(config.timeouts.agent_hung_secs),
            stuck_after: Duration::from_secs(config.timeouts.task_max_duration_secs),
            restart_limit: config.escalation.restart_limit.max(1),
            escalation_target: config.escalation.target.clone(),
            coordinator_target: config.escalation.coordinator_target.clone(),
            state_machine: TaskStateMachine::from_config(config),
        }
    }

    pub fn with_targets(
        mut self,
        escalation_target: impl Into<SessionId>,
        coordinator_target: impl Into<SessionId>,
    ) -> Self {
        self.escalation_target = escalation_target.into();
        self.coordinator_target = coordinator_target.into();
        self
    }

    pub async fn check(
        &self,
        db: &StateDb,
        pm: &Arc<dyn ProcessManager>,
    ) -> Result<HealthReport, HealthError> {
        self.check_at(db, pm, Utc::now()).await
    }

    /// One sweep against an explicit clock.
    pub async fn check_at(
        &self,
        db: &StateDb,
        pm: &Arc<dyn ProcessManager>,
        now: DateTime<Utc>,
    ) -> Result<HealthReport, HealthError> {
        let mut report = HealthReport::default();
        let sessions = db.list_sessions().await?;
        report.checked = sessions.len();

        for session in sessions {
            let failed = if session.status == SessionStatus::Active {
                let Some(status) = self.classify(db, pm, &session, now).await? else {
                    continue;
                };
                let mut next = session.clone();
                next.status = status;
                next.crashed_at = Some(now);
                match db.swap_session(&session, &next).await {
                    Ok(stored) => stored,
                    // Heartbeat landed or another monitor got there first.
                    Err(e) if e.is_claim_lost() => continue,
                    Err(e) => return Err(e.into()),
                }
            } else if session.restart_failures < self.restart_limit {
                session
            } else {
                continue;
            };

            match failed.status {
                SessionStatus::Crashed => report.crashed.push(failed.id.clone()),
                SessionStatus::Hung => report.hung.push(failed.id.clone()),
                SessionStatus::Stuck => report.stuck.push(failed.id.clone()),
                SessionStatus::Active => {}
            }
            self.recover(db, pm, failed, &mut report).await?;
        }

        let active = db.list_sessions_by_status(SessionStatus::Active).await?.len();
        global_metrics().set_gauge(names::ACTIVE_SESSIONS, active as i64);

        if !report.is_quiet() {
            tracing::info!(
                checked = report.checked,
                crashed = report.crashed.len(),
                hung = report.hung.len(),
                stuck = report.stuck.len(),
                replaced = report.replaced.len(),
                "health sweep"
            );
        }
        Ok(report)
    }

    async fn classify(
        &self,
        db: &StateDb,
        pm: &Arc<dyn ProcessManager>,
        session: &AgentSession,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionStatus>, HealthError> {
        if !pm.is_alive(&session.id).await {
            tracing::warn!(session = %session.id, "session crashed");
            return Ok(Some(SessionStatus::Crashed));
        }

        if exceeds(now, session.last_heartbeat, self.hung_after) {
            tracing::warn!(
                session = %session.id,
                last_heartbeat = %session.last_heartbeat,
                "session hung"
            );
            return Ok(Some(SessionStatus::Hung));
        }

        let Some(task) = current_task(db, session).await? else {
            return Ok(None);
        };
        let over = task
            .started_at
            .map(|started| exceeds(now, started, self.stuck_after))
            .unwrap_or(false);
        if task.status != TaskStatus::InProgress || task.blocked || !over {
            return Ok(None);
        }

        tracing::warn!(session = %session.id, task_id = %task.id, "session stuck");
        let reason = format!(
            "in_progress for more than {}s without reaching review",
            self.stuck_after.as_secs()
        );
        // Swapped against the row judged above; if it moved, another sweep
        // already counted this episode or the worker made progress.
        match self.state_machine.record_failure(db, &task, &reason, now).await {
            Ok(_) => {}
            Err(StateMachineError::Store(e)) if e.is_claim_lost() => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        Ok(Some(SessionStatus::Stuck))
    }

    /// Terminate what is left of the session and spawn a replacement that
    /// inherits its assignment.
    async fn recover(
        &self,
        db: &StateDb,
        pm: &Arc<dyn ProcessManager>,
        failed: AgentSession,
        report: &mut HealthReport,
    ) -> Result<(), HealthError> {
        let reason = failed.status.as_str();

        if pm.is_alive(&failed.id).await {
            match pm.terminate(&failed.id).await {
                Ok(()) | Err(ProcessError::UnknownSession(_)) => {}
                Err(e) => tracing::warn!(session = %failed.id, error = %e, "terminate failed"),
            }
        }

        let assignment = recover_assignment(db, &failed.id).await?;
        let new_id = match pm.spawn(failed.role, &assignment).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(session = %failed.id, error = %e, "replacement spawn failed");
                global_metrics().increment_counter(
                    names::SESSION_RECOVERIES_TOTAL,
                    &[("reason", reason), ("outcome", "failed")],
                );
                return self.count_restart_failure(db, failed, &e, report).await;
            }
        };

        let mut replacement = AgentSession::new(new_id.clone(), failed.role);
        replacement.convoy_id = assignment.convoy_id;
        replacement.task_id = assignment.task_id;
        db.upsert_session(&replacement).await?;

        if let Some(convoy_id) = assignment.convoy_id {
            reassign_convoy(db, convoy_id, &failed.id, &new_id).await?;
        }
        if let Some(task_id) = assignment.task_id {
            reassign_task(db, task_id, &failed.id, &new_id).await?;
        }
        db.delete_session(&failed.id).await?;

        db.queue()
            .publish(
                &self.coordinator_target,
                event_types::SESSION_REPLACED,
                json!({
                    "old_session": failed.id,
                    "new_session": new_id,
                    "reason": reason,
                    "convoy_id": assignment.convoy_id,
                    "task_id": assignment.task_id,
                }),
            )
            .await?;

        global_metrics().increment_counter(
            names::SESSION_RECOVERIES_TOTAL,
            &[("reason", reason), ("outcome", "replaced")],
        );
        tracing::info!(
            old_session = %failed.id,
            new_session = %new_id,
            task_id = ?assignment.task_id,
            "session replaced"
        );
        report.replaced.push((failed.id, new_id));
        Ok(())
    }

    async fn count_restart_failure(
        &self,
        db: &StateDb,
        failed: AgentSession,
        error: &ProcessError,
        report: &mut HealthReport,
    ) -> Result<(), HealthError> {
        let mut next = failed.clone();
        next.restart_failures += 1;
        let stored = match db.swap_session(&failed, &next).await {
            Ok(s) => s,
            Err(e) if e.is_claim_lost() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        report.restart_failures.push(stored.id.clone());

        if stored.restart_failures == self.restart_limit {
            db.queue()
                .publish(
                    &self.escalation_target,
                    event_types::AGENT_RESTART_FAILED,
                    json!({
                        "session": stored.id,
                        "role": stored.role,
                        "convoy_id": stored.convoy_id,
                        "task_id": stored.task_id,
                        "restart_failures": stored.restart_failures,
                        "error": error.to_string(),
                    }),
                )
                .await?;
            global_metrics().increment_counter(names::ESCALATIONS_TOTAL, &[("kind", "restart")]);
            tracing::error!(
                session = %stored.id,
                restart_failures = stored.restart_failures,
                "restart limit reached, escalated"
            );
            report.escalated.push(stored.id);
        }
        Ok(())
    }
}

fn exceeds(now: DateTime<Utc>, since: DateTime<Utc>, limit: Duration) -> bool {
    (now - since).to_std().map(|age| age > limit).unwrap_or(false)
}

async fn current_task(db: &StateDb, session: &AgentSession) -> Result<Option<Task>, StoreError> {
    if let Some(id) = session.task_id {
        if let Some(task) = db.get_task(id).await? {
            return Ok(Some(task));
        }
    }
    Ok(db
        .tasks_for_assignee(&session.id, &[TaskStatus::InProgress])
        .await?
        .into_iter()
        .next())
}

/// Refresh the heartbeat of an active session. `false` when the session is
/// unknown or no longer active.
pub async fn record_heartbeat(db: &StateDb, session: &str) -> Result<bool, StoreError> {
    let refreshed = db.record_heartbeat(session, Utc::now()).await?;
    if !refreshed {
        tracing::debug!(session, "heartbeat ignored");
    }
    Ok(refreshed)
}

/// The work a session owns according to the store: its own row first, then
/// any unfinished task still assigned to it.
pub async fn recover_assignment(db: &StateDb, session: &str) -> Result<Assignment, StoreError> {
    let mut assignment = match db.get_session(session).await? {
        Some(s) => Assignment {
            convoy_id: s.convoy_id,
            task_id: s.task_id,
        },
        None => Assignment::default(),
    };

    if assignment.task_id.is_none() {
        let unfinished = db
            .tasks_for_assignee(session, TaskStatus::unfinished())
            .await?;
        if let Some(task) = unfinished.into_iter().next() {
            assignment.convoy_id.get_or_insert(task.convoy_id);
            assignment.task_id = Some(task.id);
        }
    }
    Ok(assignment)
}

async fn reassign_convoy(
    db: &StateDb,
    convoy_id: Uuid,
    from: &str,
    to: &str,
) -> Result<(), StoreError> {
    let Some(convoy) = db.get_convoy(convoy_id).await? else {
        return Ok(());
    };
    if convoy.assignee.as_deref() != Some(from) {
        return Ok(());
    }
    let mut next = convoy.clone();
    next.assignee = Some(to.to_string());
    match db.swap_convoy(&convoy, &next).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_claim_lost() => Ok(()),
        Err(e) => Err(e),
    }
}

async fn reassign_task(db: &StateDb, task_id: Uuid, from: &str, to: &str) -> Result<(), StoreError> {
    let Some(task) = db.get_task(task_id).await? else {
        return Ok(());
    };
    if task.assignee.as_deref() != Some(from) {
        return Ok(());
    }
    let mut next = task.clone();
    next.assignee = Some(to.to_string());
    match db.swap_task(&task, &next).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_claim_lost() => Ok(()),
        Err(e) => Err(e),
    }
}
