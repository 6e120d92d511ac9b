//! Convoy allocation.
//!
//! Planning time: convoys of one feature must own pairwise disjoint file
//! sets and form an acyclic dependency graph. Runtime: a requesting worker
//! gets the highest-priority, oldest `available` convoy whose dependencies
//! are all `done`, claimed with a conditional update so that at most one
//! worker ever holds it.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use as_core::plan::{FeaturePlan, PlanError};
use as_core::store::{StateDb, StoreError};
use as_core::types::{Convoy, ConvoyStatus};
use as_telemetry::metrics::{global_metrics, names};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOverlap {
    pub first: Uuid,
    pub second: Uuid,
    /// Shared paths, sorted.
    pub paths: Vec<String>,
}

impl std::fmt::Display for FileOverlap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "convoys {} and {} both own {}",
            self.first,
            self.second,
            self.paths.join(", ")
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("file ownership overlaps: {}", format_overlaps(.0))]
    FileOverlap(Vec<FileOverlap>),
    #[error("dependency cycle among convoys: {}", format_ids(.0))]
    DependencyCycle(Vec<Uuid>),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn format_overlaps(overlaps: &[FileOverlap]) -> String {
    overlaps
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_ids(ids: &[Uuid]) -> String {
    ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(", ")
}

// ---------------------------------------------------------------------------
// Planning-time validation
// ---------------------------------------------------------------------------

/// Reject a plan before anything is written: structural problems first,
/// then every overlapping convoy pair, then dependency cycles.
pub fn validate_plan(plan: &FeaturePlan) -> Result<(), AllocatorError> {
    plan.check_structure()?;

    let overlaps = find_overlaps(&plan.convoys);
    if !overlaps.is_empty() {
        return Err(AllocatorError::FileOverlap(overlaps));
    }

    let cycle = unresolvable(&plan.convoys);
    if !cycle.is_empty() {
        return Err(AllocatorError::DependencyCycle(cycle));
    }
    Ok(())
}

/// Every intersecting pair, in plan order.
pub fn find_overlaps(convoys: &[Convoy]) -> Vec<FileOverlap> {
    let mut overlaps = Vec::new();
    for (i, first) in convoys.iter().enumerate() {
        for second in &convoys[i + 1..] {
            // BTreeSet intersection yields sorted paths.
            let paths: Vec<String> = first.files.intersection(&second.files).cloned().collect();
            if !paths.is_empty() {
                overlaps.push(FileOverlap {
                    first: first.id,
                    second: second.id,
                    paths,
                });
            }
        }
    }
    overlaps
}

/// Peel convoys whose dependencies are already peeled until no progress is
/// made; whatever remains sits on or behind a cycle. A self-dependency never
/// peels.
fn unresolvable(convoys: &[Convoy]) -> Vec<Uuid> {
    let mut done: HashSet<Uuid> = HashSet::new();
    let mut remaining: Vec<&Convoy> = convoys.iter().collect();

    while !remaining.is_empty() {
        let mut progressed = false;
        remaining.retain(|convoy| {
            if convoy.dependencies.iter().all(|d| done.contains(d)) {
                done.insert(convoy.id);
                progressed = true;
                false
            } else {
                true
            }
        });
        if !progressed {
            break;
        }
    }

    remaining.iter().map(|c| c.id).collect()
}

// ---------------------------------------------------------------------------
// Runtime allocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConvoyAllocator {
    max_attempts: usize,
}

impl Default for ConvoyAllocator {
    fn default() -> Self {
        Self { max_attempts: 16 }
    }
}

impl ConvoyAllocator {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Convoys of the feature that may be claimed right now, in allocation
    /// order: priority tier first, then creation time, then id.
    pub async fn candidates(
        &self,
        db: &StateDb,
        feature_id: Uuid,
    ) -> Result<Vec<Convoy>, AllocatorError> {
        let convoys = db.list_convoys(feature_id).await?;
        let status: HashMap<Uuid, ConvoyStatus> =
            convoys.iter().map(|c| (c.id, c.status)).collect();

        let mut ready: Vec<Convoy> = convoys
            .into_iter()
            .filter(|c| c.status == ConvoyStatus::Available)
            .filter(|c| {
                c.dependencies
                    .iter()
                    .all(|d| status.get(d) == Some(&ConvoyStatus::Done))
            })
            .collect();

        ready.sort_by(|a, b| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(ready)
    }

    /// Single-shot allocation for `session`. `None` means nothing is
    /// claimable now; the caller sleeps and asks again.
    pub async fn allocate(
        &self,
        db: &StateDb,
        feature_id: Uuid,
        session: &str,
    ) -> Result<Option<Convoy>, AllocatorError> {
        for attempt in 0..self.max_attempts {
            let candidates = self.candidates(db, feature_id).await?;
            let Some(pick) = candidates.first() else {
                tracing::debug!(feature_id = %feature_id, session, "no convoy available");
                return Ok(None);
            };

            match db
                .claim_convoy(pick.id, ConvoyStatus::Available, ConvoyStatus::InProgress, session)
                .await
            {
                Ok(convoy) => {
                    global_metrics().increment_counter(
                        names::CLAIMS_TOTAL,
                        &[("entity", "convoy"), ("outcome", "won")],
                    );
                    if !db.set_session_assignment(session, Some(convoy.id), None).await? {
                        tracing::debug!(session, "allocating to an unregistered session");
                    }
                    tracing::info!(
                        convoy_id = %convoy.id,
                        session,
                        priority = ?convoy.priority,
                        "convoy allocated"
                    );
                    return Ok(Some(convoy));
                }
                Err(e) if e.is_claim_lost() => {
                    global_metrics().increment_counter(
                        names::CLAIMS_TOTAL,
                        &[("entity", "convoy"), ("outcome", "lost")],
                    );
                    tracing::debug!(convoy_id = %pick.id, session, attempt, "convoy claim lost, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Hand an unfinished convoy back to the pool (`in_progress ->
    /// available`). Only the current holder may release it.
    pub async fn release(
        &self,
        db: &StateDb,
        convoy_id: Uuid,
        session: &str,
    ) -> Result<Convoy, AllocatorError> {
        let current = db.get_convoy(convoy_id).await?.ok_or_else(|| StoreError::NotFound {
            entity: "convoy",
            id: convoy_id.to_string(),
        })?;
        if current.status != ConvoyStatus::InProgress || current.assignee.as_deref() != Some(session) {
            return Err(StoreError::ClaimLost {
                entity: "convoy",
                id: convoy_id.to_string(),
                expected: format!("in_progress held by {session}"),
            }
            .into());
        }

        let mut next = current.clone();
        next.status = ConvoyStatus::Available;
        next.assignee = None;
        next.started_at = None;
        let released = db.swap_convoy(&current, &next).await?;
        tracing::info!(convoy_id = %convoy_id, session, "convoy released");
        Ok(released)
    }
}
