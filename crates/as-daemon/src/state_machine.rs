//! Task pipeline: `todo -> in_progress -> in_review -> in_tests -> in_docs -> done`.
//!
//! Every gated exit applies a [`GateVerdict`]. A failing verdict rolls the
//! task back to `in_progress`, records the reason and bumps the failure
//! count; each time the count reaches a multiple of the threshold the task is
//! frozen (`blocked`) and one escalation event is published.
//!
//! All writes are compare-and-swap on the task row, so two callers racing on
//! the same task can never both apply a transition.

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use as_core::config::Config;
use as_core::gates::{self, metric_keys, GateStage, GateThresholds, GateVerdict, Metrics};
use as_core::store::{StateDb, StoreError};
use as_core::types::{event_types, SessionId, Task, TaskStatus};
use as_telemetry::metrics::{global_metrics, names};

const MAX_ATTEMPTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task {task} is {status}; the {stage} gate does not apply")]
    StageMismatch {
        task: Uuid,
        status: TaskStatus,
        stage: GateStage,
    },
    #[error("task {0} is blocked pending external review")]
    TaskBlocked(Uuid),
    #[error("task {0} not found")]
    NotFound(Uuid),
    #[error("task {task} has no acceptance criterion {criterion}")]
    UnknownCriterion { task: Uuid, criterion: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of applying a gate verdict or a recorded failure.
#[derive(Debug, Clone)]
pub struct Transition {
    pub task: Task,
    pub from: TaskStatus,
    /// `true` when this transition froze the task and escalated it.
    pub escalated: bool,
}

#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    failure_threshold: u32,
    escalation_target: SessionId,
}

impl TaskStateMachine {
    pub fn new(failure_threshold: u32, escalation_target: impl Into<SessionId>) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            escalation_target: escalation_target.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.escalation.failure_threshold,
            config.escalation.target.clone(),
        )
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// A count escalates when it lands on a multiple of the threshold, so
    /// after an unblock the next escalation fires `threshold` failures later.
    fn escalates(&self, failure_count: u32) -> bool {
        failure_count > 0 && failure_count % self.failure_threshold == 0
    }

    // -----------------------------------------------------------------------
    // Claiming
    // -----------------------------------------------------------------------

    /// Worker self-claim `todo -> in_progress`. A lost race surfaces as
    /// `StoreError::ClaimLost`.
    pub async fn claim(
        &self,
        db: &StateDb,
        task_id: Uuid,
        session: &str,
    ) -> Result<Task, StateMachineError> {
        let task = db
            .get_task(task_id)
            .await?
            .ok_or(StateMachineError::NotFound(task_id))?;
        if task.blocked {
            return Err(StateMachineError::TaskBlocked(task_id));
        }
        if task.status != TaskStatus::Todo {
            return Err(StateMachineError::InvalidTransition {
                task: task_id,
                from: task.status,
                to: TaskStatus::InProgress,
            });
        }

        match db.claim_task(task_id, session).await {
            Ok(task) => {
                global_metrics()
                    .increment_counter(names::CLAIMS_TOTAL, &[("entity", "task"), ("outcome", "won")]);
                db.set_session_assignment(session, Some(task.convoy_id), Some(task.id))
                    .await?;
                tracing::info!(task_id = %task.id, session, "task claimed");
                Ok(task)
            }
            Err(e) => {
                if e.is_claim_lost() {
                    global_metrics().increment_counter(
                        names::CLAIMS_TOTAL,
                        &[("entity", "task"), ("outcome", "lost")],
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Claim the oldest claimable task of a convoy, retrying when another
    /// worker wins the race. `None` when nothing is left to claim.
    pub async fn claim_next(
        &self,
        db: &StateDb,
        convoy_id: Uuid,
        session: &str,
    ) -> Result<Option<Task>, StateMachineError> {
        for _ in 0..MAX_ATTEMPTS {
            let Some(candidate) = db.next_todo_task(convoy_id).await? else {
                return Ok(None);
            };
            match self.claim(db, candidate.id, session).await {
                Ok(task) => return Ok(Some(task)),
                Err(StateMachineError::Store(e)) if e.is_claim_lost() => continue,
                Err(StateMachineError::TaskBlocked(_))
                | Err(StateMachineError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Ungated hand-off `in_progress -> in_review`.
    pub async fn submit(&self, db: &StateDb, task_id: Uuid) -> Result<Task, StateMachineError> {
        let (_, task) = update_task(db, task_id, |current| {
            if current.blocked {
                return Err(StateMachineError::TaskBlocked(task_id));
            }
            if current.status != TaskStatus::InProgress {
                return Err(StateMachineError::InvalidTransition {
                    task: task_id,
                    from: current.status,
                    to: TaskStatus::InReview,
                });
            }
            let mut next = current.clone();
            next.status = TaskStatus::InReview;
            Ok(next)
        })
        .await?;
        tracing::info!(task_id = %task_id, "task submitted for review");
        Ok(task)
    }

    /// Evaluate the gate guarding the task's current stage and apply the
    /// verdict. `ac_satisfied_percent` is derived from the task's criteria
    /// when the caller does not report it.
    pub async fn run_gate(
        &self,
        db: &StateDb,
        task_id: Uuid,
        stage: GateStage,
        metrics: &Metrics,
        thresholds: &GateThresholds,
    ) -> Result<(GateVerdict, Transition), StateMachineError> {
        let task = db
            .get_task(task_id)
            .await?
            .ok_or(StateMachineError::NotFound(task_id))?;

        let mut metrics = metrics.clone();
        if stage == GateStage::TestQuality && metrics.get(metric_keys::AC_SATISFIED_PERCENT).is_none() {
            metrics.insert(metric_keys::AC_SATISFIED_PERCENT, task.ac_satisfied_percent());
        }

        let verdict = gates::evaluate(stage, &metrics, thresholds);
        let transition = self.apply_verdict(db, task_id, &verdict).await?;
        Ok((verdict, transition))
    }

    /// Move the task forward on a passing verdict, roll it back on a failing
    /// one. The verdict must be for the gate guarding the current stage.
    pub async fn apply_verdict(
        &self,
        db: &StateDb,
        task_id: Uuid,
        verdict: &GateVerdict,
    ) -> Result<Transition, StateMachineError> {
        let snapshot = serde_json::to_value(verdict).ok();
        let (before, task) = update_task(db, task_id, |current| {
            if current.blocked {
                return Err(StateMachineError::TaskBlocked(task_id));
            }
            if current.status.exit_gate() != Some(verdict.stage) {
                return Err(StateMachineError::StageMismatch {
                    task: task_id,
                    status: current.status,
                    stage: verdict.stage,
                });
            }

            let mut next = current.clone();
            next.validation_results = snapshot.clone();
            if verdict.passed {
                let to = match current.status.next() {
                    Some(s) => s,
                    None => {
                        return Err(StateMachineError::InvalidTransition {
                            task: task_id,
                            from: current.status,
                            to: current.status,
                        })
                    }
                };
                next.status = to;
                if to == TaskStatus::Done {
                    next.completed_at = Some(Utc::now());
                }
            } else {
                self.roll_back(&mut next, verdict.summary(), Utc::now());
            }
            Ok(next)
        })
        .await?;

        let stage = verdict.stage.to_string();
        let result = if verdict.passed { "pass" } else { "fail" };
        global_metrics().increment_counter(
            names::GATE_VERDICTS_TOTAL,
            &[("stage", stage.as_str()), ("result", result)],
        );

        let escalated = task.blocked && !before.blocked;
        if verdict.passed {
            tracing::info!(
                task_id = %task_id,
                from = %before.status,
                to = %task.status,
                "gate passed"
            );
        } else {
            tracing::info!(
                task_id = %task_id,
                from = %before.status,
                failure_count = task.failure_count,
                reasons = ?verdict.reasons,
                "gate failed, task rolled back"
            );
            self.after_failure(db, &task, escalated, Some(verdict.reasons.as_slice()))
                .await?;
        }

        Ok(Transition {
            task,
            from: before.status,
            escalated,
        })
    }

    /// Count a failure observed outside the gates (a stuck session). The task
    /// returns to `in_progress` with its attempt clock restarted at `at`.
    ///
    /// The swap is made once against `observed`, the row the caller judged.
    /// If the row has moved since, the observation is stale and the result is
    /// `ClaimLost`; it is never re-applied to the newer row.
    pub async fn record_failure(
        &self,
        db: &StateDb,
        observed: &Task,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition, StateMachineError> {
        let task_id = observed.id;
        let unfinished = TaskStatus::unfinished().contains(&observed.status);
        if !unfinished
            || (observed.status != TaskStatus::InProgress
                && !observed.status.can_transition_to(&TaskStatus::InProgress))
        {
            return Err(StateMachineError::InvalidTransition {
                task: task_id,
                from: observed.status,
                to: TaskStatus::InProgress,
            });
        }
        let mut next = observed.clone();
        self.roll_back(&mut next, reason.to_string(), at);
        let task = db.swap_task(observed, &next).await?;

        let escalated = task.blocked && !observed.blocked;
        tracing::warn!(
            task_id = %task_id,
            failure_count = task.failure_count,
            reason,
            "task failure recorded"
        );
        self.after_failure(db, &task, escalated, None).await?;
        Ok(Transition {
            task,
            from: observed.status,
            escalated,
        })
    }

    fn roll_back(&self, task: &mut Task, reason: String, at: DateTime<Utc>) {
        task.status = TaskStatus::InProgress;
        task.failure_count += 1;
        task.failure_reason = Some(reason);
        task.started_at = Some(at);
        if self.escalates(task.failure_count) {
            task.blocked = true;
        }
    }

    async fn after_failure(
        &self,
        db: &StateDb,
        task: &Task,
        escalated: bool,
        reasons: Option<&[String]>,
    ) -> Result<(), StateMachineError> {
        let queue = db.queue();
        if escalated {
            queue
                .publish(
                    &self.escalation_target,
                    event_types::ESCALATE_TASK,
                    json!({
                        "task_id": task.id,
                        "convoy_id": task.convoy_id,
                        "assignee": task.assignee,
                        "failure_count": task.failure_count,
                        "reason": task.failure_reason,
                    }),
                )
                .await?;
            global_metrics().increment_counter(names::ESCALATIONS_TOTAL, &[("kind", "task")]);
            tracing::warn!(
                task_id = %task.id,
                failure_count = task.failure_count,
                target = %self.escalation_target,
                "task escalated"
            );
            return Ok(());
        }

        if let (Some(reasons), Some(assignee)) = (reasons, task.assignee.as_deref()) {
            queue
                .publish(
                    assignee,
                    event_types::REWORK_NEEDED,
                    json!({
                        "task_id": task.id,
                        "failure_count": task.failure_count,
                        "reasons": reasons,
                    }),
                )
                .await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // External actions
    // -----------------------------------------------------------------------

    pub async fn mark_criterion(
        &self,
        db: &StateDb,
        task_id: Uuid,
        criterion_id: &str,
        satisfied: bool,
        validator: &str,
    ) -> Result<Task, StateMachineError> {
        let (_, task) = update_task(db, task_id, |current| {
            let mut next = current.clone();
            let criterion = next
                .acceptance_criteria
                .iter_mut()
                .find(|c| c.id == criterion_id)
                .ok_or_else(|| StateMachineError::UnknownCriterion {
                    task: task_id,
                    criterion: criterion_id.to_string(),
                })?;
            criterion.satisfied = satisfied;
            criterion.validator = Some(validator.to_string());
            criterion.validated_at = Some(Utc::now());
            Ok(next)
        })
        .await?;
        tracing::debug!(task_id = %task_id, criterion_id, satisfied, validator, "criterion updated");
        Ok(task)
    }

    /// Lift an escalation freeze. The failure count is kept.
    pub async fn unblock(&self, db: &StateDb, task_id: Uuid) -> Result<Task, StateMachineError> {
        let (_, task) = update_task(db, task_id, |current| {
            let mut next = current.clone();
            next.blocked = false;
            if next.status == TaskStatus::InProgress {
                next.started_at = Some(Utc::now());
            }
            Ok(next)
        })
        .await?;
        tracing::info!(task_id = %task_id, failure_count = task.failure_count, "task unblocked");
        Ok(task)
    }
}

/// Read, transform and compare-and-swap a task, re-reading on a lost race.
/// Returns the row as read and the row as stored.
async fn update_task<F>(
    db: &StateDb,
    task_id: Uuid,
    mut change: F,
) -> Result<(Task, Task), StateMachineError>
where
    F: FnMut(&Task) -> Result<Task, StateMachineError>,
{
    let mut lost = None;
    for _ in 0..MAX_ATTEMPTS {
        let current = db
            .get_task(task_id)
            .await?
            .ok_or(StateMachineError::NotFound(task_id))?;
        let next = change(&current)?;
        if next.status != current.status && !current.status.can_transition_to(&next.status) {
            return Err(StateMachineError::InvalidTransition {
                task: task_id,
                from: current.status,
                to: next.status,
            });
        }
        match db.swap_task(&current, &next).await {
            Ok(stored) => return Ok((current, stored)),
            Err(e) if e.is_claim_lost() => {
                tracing::debug!(task_id = %task_id, "task changed underneath, retrying");
                lost = Some(e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(lost
        .map(StateMachineError::Store)
        .unwrap_or(StateMachineError::NotFound(task_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_fires_on_multiples_of_threshold() {
        let sm = TaskStateMachine::new(3, "human-review");
        let fired: Vec<u32> = (1..=9).filter(|n| sm.escalates(*n)).collect();
        assert_eq!(fired, vec![3, 6, 9]);
        assert!(!sm.escalates(0));
    }

    #[test]
    fn zero_threshold_is_clamped() {
        let sm = TaskStateMachine::new(0, "human-review");
        assert_eq!(sm.failure_threshold(), 1);
        assert!(sm.escalates(1));
    }

    #[test]
    fn roll_back_restarts_the_attempt() {
        let sm = TaskStateMachine::new(3, "human-review");
        let mut task = Task::new(Uuid::new_v4(), "t", "src/a.rs");
        task.status = TaskStatus::InTests;
        sm.roll_back(&mut task, "coverage_percent 65 below threshold 80".into(), Utc::now());
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.failure_count, 1);
        assert!(task.started_at.is_some());
        assert!(!task.blocked);
    }
}
