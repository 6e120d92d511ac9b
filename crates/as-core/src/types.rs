use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gates::GateStage;

/// Identifier of an agent session or any other event target (`"manager"`,
/// `"human-review"`, `"developer-3f2a91c0"`).
pub type SessionId = String;

// ---------------------------------------------------------------------------
// Feature
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Ready,
    InProgress,
    Done,
    Failed,
}

impl FeatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureStatus::Ready => "ready",
            FeatureStatus::InProgress => "in_progress",
            FeatureStatus::Done => "done",
            FeatureStatus::Failed => "failed",
        }
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    /// `Failed` is terminal.
    pub fn can_transition_to(&self, target: &FeatureStatus) -> bool {
        matches!(
            (self, target),
            (FeatureStatus::Ready, FeatureStatus::InProgress)
                | (FeatureStatus::Ready, FeatureStatus::Failed)
                | (FeatureStatus::InProgress, FeatureStatus::Done)
                | (FeatureStatus::InProgress, FeatureStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: Uuid,
    pub name: String,
    pub spec_path: Option<String>,
    pub status: FeatureStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Feature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            spec_path: None,
            status: FeatureStatus::Ready,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Priority tier of a convoy. `P1` is the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    P1,
    #[default]
    P2,
    P3,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P1 => "p1",
            Priority::P2 => "p2",
            Priority::P3 => "p3",
        }
    }

    /// Numeric rank for sorting (higher = more important).
    pub fn rank(&self) -> u8 {
        match self {
            Priority::P1 => 2,
            Priority::P2 => 1,
            Priority::P3 => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Convoy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvoyStatus {
    Available,
    Blocked,
    InProgress,
    Done,
}

impl ConvoyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConvoyStatus::Available => "available",
            ConvoyStatus::Blocked => "blocked",
            ConvoyStatus::InProgress => "in_progress",
            ConvoyStatus::Done => "done",
        }
    }

    pub fn can_transition_to(&self, target: &ConvoyStatus) -> bool {
        matches!(
            (self, target),
            (ConvoyStatus::Available, ConvoyStatus::InProgress)
                | (ConvoyStatus::Available, ConvoyStatus::Blocked)
                | (ConvoyStatus::Blocked, ConvoyStatus::Available)
                | (ConvoyStatus::InProgress, ConvoyStatus::Available)
                | (ConvoyStatus::InProgress, ConvoyStatus::Done)
        )
    }
}

/// A bundle of tasks that exclusively owns a set of file paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Convoy {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub story: String,
    pub priority: Priority,
    pub status: ConvoyStatus,
    pub files: BTreeSet<String>,
    pub dependencies: Vec<Uuid>,
    pub assignee: Option<SessionId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Convoy {
    pub fn new<I, S>(feature_id: Uuid, story: impl Into<String>, priority: Priority, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: Uuid::new_v4(),
            feature_id,
            story: story.into(),
            priority,
            status: ConvoyStatus::Available,
            files: files.into_iter().map(Into::into).collect(),
            dependencies: Vec::new(),
            assignee: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = Uuid>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    InTests,
    InDocs,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::InReview => "in_review",
            TaskStatus::InTests => "in_tests",
            TaskStatus::InDocs => "in_docs",
            TaskStatus::Done => "done",
        }
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Forward edges follow the pipeline one step at a time; every gated
    /// status may roll back to `InProgress` and never further.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Todo, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::InReview)
                | (TaskStatus::InReview, TaskStatus::InTests)
                | (TaskStatus::InReview, TaskStatus::InProgress)
                | (TaskStatus::InTests, TaskStatus::InDocs)
                | (TaskStatus::InTests, TaskStatus::InProgress)
                | (TaskStatus::InDocs, TaskStatus::Done)
                | (TaskStatus::InDocs, TaskStatus::InProgress)
        )
    }

    /// The next status in the pipeline, `None` for `Done`.
    pub fn next(&self) -> Option<TaskStatus> {
        match self {
            TaskStatus::Todo => Some(TaskStatus::InProgress),
            TaskStatus::InProgress => Some(TaskStatus::InReview),
            TaskStatus::InReview => Some(TaskStatus::InTests),
            TaskStatus::InTests => Some(TaskStatus::InDocs),
            TaskStatus::InDocs => Some(TaskStatus::Done),
            TaskStatus::Done => None,
        }
    }

    /// The gate that must pass before a task may leave this status.
    pub fn exit_gate(&self) -> Option<GateStage> {
        match self {
            TaskStatus::InReview => Some(GateStage::CodeQuality),
            TaskStatus::InTests => Some(GateStage::TestQuality),
            TaskStatus::InDocs => Some(GateStage::SecurityMerge),
            _ => None,
        }
    }

    /// Statuses a worker still owns (started but not finished).
    pub fn unfinished() -> &'static [TaskStatus] {
        &[
            TaskStatus::InProgress,
            TaskStatus::InReview,
            TaskStatus::InTests,
            TaskStatus::InDocs,
        ]
    }

    pub fn pipeline_order() -> &'static [TaskStatus] {
        &[
            TaskStatus::Todo,
            TaskStatus::InProgress,
            TaskStatus::InReview,
            TaskStatus::InTests,
            TaskStatus::InDocs,
            TaskStatus::Done,
        ]
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub satisfied: bool,
    #[serde(default)]
    pub validator: Option<String>,
    #[serde(default)]
    pub validated_at: Option<DateTime<Utc>>,
}

impl AcceptanceCriterion {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            satisfied: false,
            validator: None,
            validated_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub convoy_id: Uuid,
    pub title: String,
    pub description: String,
    pub file_path: String,
    pub status: TaskStatus,
    pub assignee: Option<SessionId>,
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    pub validation_results: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub failure_count: u32,
    /// Frozen after escalation until unblocked externally.
    pub blocked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the current `in_progress` attempt began.
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(convoy_id: Uuid, title: impl Into<String>, file_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            convoy_id,
            title: title.into(),
            description: String::new(),
            file_path: file_path.into(),
            status: TaskStatus::Todo,
            assignee: None,
            acceptance_criteria: Vec::new(),
            validation_results: None,
            failure_reason: None,
            failure_count: 0,
            blocked: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Percentage of acceptance criteria marked satisfied. A task without
    /// criteria counts as fully satisfied.
    pub fn ac_satisfied_percent(&self) -> f64 {
        if self.acceptance_criteria.is_empty() {
            return 100.0;
        }
        let satisfied = self
            .acceptance_criteria
            .iter()
            .filter(|c| c.satisfied)
            .count();
        satisfied as f64 * 100.0 / self.acceptance_criteria.len() as f64
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Done => "done",
            EventStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub target: SessionId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: EventStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(
        target: impl Into<SessionId>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            event_type: event_type.into(),
            payload,
            status: EventStatus::Pending,
            error: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }
}

/// Well-known event type tags.
pub mod event_types {
    pub const ESCALATE_TASK: &str = "ESCALATE_TASK";
    pub const AGENT_RESTART_FAILED: &str = "AGENT_RESTART_FAILED";
    pub const REWORK_NEEDED: &str = "REWORK_NEEDED";
    pub const UPDATE_DOCS: &str = "UPDATE_DOCS";
    pub const FEATURE_DONE: &str = "FEATURE_DONE";
    pub const STOP: &str = "STOP";
    pub const SESSION_REPLACED: &str = "SESSION_REPLACED";
}

// ---------------------------------------------------------------------------
// Agent sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Manager,
    Cab,
    Refinery,
    Librarian,
    Developer,
    Tester,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Manager => "manager",
            AgentRole::Cab => "cab",
            AgentRole::Refinery => "refinery",
            AgentRole::Librarian => "librarian",
            AgentRole::Developer => "developer",
            AgentRole::Tester => "tester",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Crashed,
    Hung,
    Stuck,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Crashed => "crashed",
            SessionStatus::Hung => "hung",
            SessionStatus::Stuck => "stuck",
        }
    }

    pub fn glyph(&self) -> &'static str {
        match self {
            SessionStatus::Active => "@",
            SessionStatus::Crashed => "x",
            SessionStatus::Hung => "?",
            SessionStatus::Stuck => "!",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: SessionId,
    pub role: AgentRole,
    pub convoy_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub status: SessionStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub crashed_at: Option<DateTime<Utc>>,
    /// Failed attempts at spawning a replacement for this session.
    pub restart_failures: u32,
}

impl AgentSession {
    pub fn new(id: impl Into<SessionId>, role: AgentRole) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            role,
            convoy_id: None,
            task_id: None,
            status: SessionStatus::Active,
            last_heartbeat: now,
            started_at: now,
            crashed_at: None,
            restart_failures: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

/// Point-in-time counts across every record type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub features: Vec<(FeatureStatus, u64)>,
    pub convoys: Vec<(ConvoyStatus, u64)>,
    pub tasks: Vec<(TaskStatus, u64)>,
    pub sessions: Vec<(SessionStatus, u64)>,
    pub blocked_tasks: u64,
    pub pending_events: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_pipeline_follows_next() {
        let order = TaskStatus::pipeline_order();
        for pair in order.windows(2) {
            assert_eq!(pair[0].next(), Some(pair[1]));
            assert!(pair[0].can_transition_to(&pair[1]));
        }
        assert_eq!(TaskStatus::Done.next(), None);
    }

    #[test]
    fn rollback_never_goes_past_in_progress() {
        for status in [TaskStatus::InReview, TaskStatus::InTests, TaskStatus::InDocs] {
            assert!(status.can_transition_to(&TaskStatus::InProgress));
            assert!(!status.can_transition_to(&TaskStatus::Todo));
        }
        assert!(!TaskStatus::Done.can_transition_to(&TaskStatus::InProgress));
    }

    #[test]
    fn exit_gates_cover_the_three_reviewed_stages() {
        assert_eq!(TaskStatus::InProgress.exit_gate(), None);
        assert_eq!(TaskStatus::InReview.exit_gate(), Some(GateStage::CodeQuality));
        assert_eq!(TaskStatus::InTests.exit_gate(), Some(GateStage::TestQuality));
        assert_eq!(TaskStatus::InDocs.exit_gate(), Some(GateStage::SecurityMerge));
    }

    #[test]
    fn failed_feature_is_terminal() {
        for target in [
            FeatureStatus::Ready,
            FeatureStatus::InProgress,
            FeatureStatus::Done,
        ] {
            assert!(!FeatureStatus::Failed.can_transition_to(&target));
        }
    }

    #[test]
    fn priority_rank_orders_p1_first() {
        assert!(Priority::P1.rank() > Priority::P2.rank());
        assert!(Priority::P2.rank() > Priority::P3.rank());
    }

    #[test]
    fn ac_percent_counts_satisfied_criteria() {
        let mut task = Task::new(Uuid::new_v4(), "t", "src/a.rs");
        assert_eq!(task.ac_satisfied_percent(), 100.0);
        task.acceptance_criteria = vec![
            AcceptanceCriterion::new("ac-1", "one"),
            AcceptanceCriterion::new("ac-2", "two"),
        ];
        assert_eq!(task.ac_satisfied_percent(), 0.0);
        task.acceptance_criteria[0].satisfied = true;
        assert_eq!(task.ac_satisfied_percent(), 50.0);
    }

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_string(&TaskStatus::InReview).unwrap();
        assert_eq!(s, "\"in_review\"");
        let p = serde_json::to_string(&Priority::P1).unwrap();
        assert_eq!(p, "\"p1\"");
    }
}
