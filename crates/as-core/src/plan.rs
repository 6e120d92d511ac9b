//! Plan documents: the planner's description of a feature, turned into
//! concrete records with ids before anything is written to the store.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AcceptanceCriterion, Convoy, ConvoyStatus, Feature, Priority, Task};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("failed to read plan: {0}")]
    Io(String),
    #[error("failed to parse plan: {0}")]
    Parse(String),
    #[error("convoy key `{0}` is declared more than once")]
    DuplicateKey(String),
    #[error("convoy {convoy} depends on unknown convoy {dependency}")]
    UnknownDependency { convoy: String, dependency: String },
    #[error("task `{task}` targets {file}, which convoy {convoy} does not own")]
    TaskFileOutsideConvoy {
        task: String,
        file: String,
        convoy: String,
    },
    #[error("task `{0}` belongs to no convoy in the plan")]
    OrphanTask(String),
    #[error("convoy {0} has no tasks")]
    EmptyConvoy(String),
}

// ---------------------------------------------------------------------------
// Document format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDocument {
    pub name: String,
    #[serde(default)]
    pub spec_path: Option<String>,
    pub convoys: Vec<ConvoyPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvoyPlan {
    /// Plan-local handle referenced by `depends_on`.
    pub key: String,
    pub story: String,
    #[serde(default)]
    pub priority: Priority,
    pub files: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<TaskPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub file_path: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl PlanDocument {
    pub fn from_json(raw: &str) -> Result<Self, PlanError> {
        serde_json::from_str(raw).map_err(|e| PlanError::Parse(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let raw = std::fs::read_to_string(path).map_err(|e| PlanError::Io(e.to_string()))?;
        Self::from_json(&raw)
    }
}

// ---------------------------------------------------------------------------
// FeaturePlan
// ---------------------------------------------------------------------------

/// A feature with all of its convoys and tasks, ids assigned, ready to be
/// validated and inserted.
#[derive(Debug, Clone)]
pub struct FeaturePlan {
    pub feature: Feature,
    pub convoys: Vec<Convoy>,
    pub tasks: Vec<Task>,
}

impl FeaturePlan {
    /// Assign ids and resolve `depends_on` keys.
    ///
    /// Creation timestamps are spaced one microsecond apart in document
    /// order so FIFO allocation follows the order the planner wrote.
    pub fn from_document(doc: &PlanDocument) -> Result<Self, PlanError> {
        let mut feature = Feature::new(doc.name.clone());
        feature.spec_path = doc.spec_path.clone();

        let mut ids: HashMap<&str, Uuid> = HashMap::new();
        for c in &doc.convoys {
            if ids.insert(c.key.as_str(), Uuid::new_v4()).is_some() {
                return Err(PlanError::DuplicateKey(c.key.clone()));
            }
        }

        let base = Utc::now();
        let mut convoys = Vec::with_capacity(doc.convoys.len());
        let mut tasks = Vec::new();
        let mut tick = 0i64;

        for c in &doc.convoys {
            let mut deps = Vec::with_capacity(c.depends_on.len());
            for key in &c.depends_on {
                let dep = ids.get(key.as_str()).ok_or_else(|| PlanError::UnknownDependency {
                    convoy: c.key.clone(),
                    dependency: key.clone(),
                })?;
                deps.push(*dep);
            }

            let mut convoy = Convoy::new(feature.id, c.story.clone(), c.priority, c.files.clone())
                .with_dependencies(deps);
            convoy.id = ids[c.key.as_str()];
            convoy.created_at = base + Duration::microseconds(tick);
            if !convoy.dependencies.is_empty() {
                convoy.status = ConvoyStatus::Blocked;
            }
            tick += 1;

            for t in &c.tasks {
                let mut task = Task::new(convoy.id, t.title.clone(), t.file_path.clone());
                task.description = t.description.clone();
                task.acceptance_criteria = t
                    .acceptance_criteria
                    .iter()
                    .enumerate()
                    .map(|(i, d)| AcceptanceCriterion::new(format!("ac-{}", i + 1), d.clone()))
                    .collect();
                task.created_at = base + Duration::microseconds(tick);
                task.updated_at = task.created_at;
                tick += 1;
                tasks.push(task);
            }
            convoys.push(convoy);
        }

        Ok(Self {
            feature,
            convoys,
            tasks,
        })
    }

    pub fn tasks_of(&self, convoy_id: Uuid) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(move |t| t.convoy_id == convoy_id)
    }

    /// Structural checks that do not involve the dependency graph or file
    /// overlap between convoys.
    pub fn check_structure(&self) -> Result<(), PlanError> {
        let ids: HashSet<Uuid> = self.convoys.iter().map(|c| c.id).collect();

        for convoy in &self.convoys {
            if self.tasks_of(convoy.id).next().is_none() {
                return Err(PlanError::EmptyConvoy(convoy.id.to_string()));
            }
            if let Some(dep) = convoy.dependencies.iter().find(|d| !ids.contains(d)) {
                return Err(PlanError::UnknownDependency {
                    convoy: convoy.id.to_string(),
                    dependency: dep.to_string(),
                });
            }
        }

        for task in &self.tasks {
            let Some(convoy) = self.convoys.iter().find(|c| c.id == task.convoy_id) else {
                return Err(PlanError::OrphanTask(task.title.clone()));
            };
            if !convoy.files.contains(&task.file_path) {
                return Err(PlanError::TaskFileOutsideConvoy {
                    task: task.title.clone(),
                    file: task.file_path.clone(),
                    convoy: convoy.id.to_string(),
                });
            }
        }
        Ok(())
    }
}
