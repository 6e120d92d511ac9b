//! Process-manager seam. The core only ever asks for a worker to be spawned
//! or terminated and whether it is still observable; how a worker session
//! is actually hosted stays behind [`ProcessManager`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

use as_core::types::{AgentRole, SessionId};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("no worker command configured")]
    NotConfigured,
    #[error("failed to spawn {role} worker: {reason}")]
    Spawn { role: AgentRole, reason: String },
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("failed to terminate {session}: {reason}")]
    Terminate { session: SessionId, reason: String },
}

/// Environment a spawned worker receives.
pub mod env {
    pub const SESSION_ID: &str = "AI_SPRINT_SESSION_ID";
    pub const ROLE: &str = "AI_SPRINT_ROLE";
    pub const CONVOY_ID: &str = "AI_SPRINT_CONVOY_ID";
    pub const TASK_ID: &str = "AI_SPRINT_TASK_ID";
    pub const DATABASE: &str = "AI_SPRINT_DATABASE";
}

/// What a freshly spawned worker should pick up. Workers re-read the same
/// assignment from the store, so this is a hint and may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub convoy_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
}

/// `developer-3f2a91c0`
pub fn new_session_id(role: AgentRole) -> SessionId {
    let simple = Uuid::new_v4().simple().to_string();
    format!("{}-{}", role.as_str(), &simple[..8])
}

#[async_trait::async_trait]
pub trait ProcessManager: Send + Sync {
    /// Start a worker and return its session id.
    async fn spawn(&self, role: AgentRole, assignment: &Assignment)
        -> Result<SessionId, ProcessError>;

    async fn terminate(&self, session: &str) -> Result<(), ProcessError>;

    /// Whether the session's process is still observable.
    async fn is_alive(&self, session: &str) -> bool;
}

// ---------------------------------------------------------------------------
// Command-backed implementation
// ---------------------------------------------------------------------------

/// Runs the configured worker command as a child process per session.
///
/// Sessions this manager did not spawn (workers started by hand or by an
/// earlier daemon) are reported alive; their heartbeat decides.
pub struct CommandProcessManager {
    command: Vec<String>,
    database_path: PathBuf,
    children: Mutex<HashMap<SessionId, Child>>,
}

impl CommandProcessManager {
    pub fn new(command: Vec<String>, database_path: PathBuf) -> Self {
        Self {
            command,
            database_path,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.command.is_empty()
    }

    pub async fn child_count(&self) -> usize {
        self.children.lock().await.len()
    }
}

fn opt_env(id: Option<Uuid>) -> String {
    id.map(|u| u.to_string()).unwrap_or_default()
}

#[async_trait::async_trait]
impl ProcessManager for CommandProcessManager {
    async fn spawn(
        &self,
        role: AgentRole,
        assignment: &Assignment,
    ) -> Result<SessionId, ProcessError> {
        let (program, args) = self.command.split_first().ok_or(ProcessError::NotConfigured)?;
        let session = new_session_id(role);

        let child = Command::new(program)
            .args(args)
            .env(env::SESSION_ID, &session)
            .env(env::ROLE, role.as_str())
            .env(env::CONVOY_ID, opt_env(assignment.convoy_id))
            .env(env::TASK_ID, opt_env(assignment.task_id))
            .env(env::DATABASE, &self.database_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::Spawn {
                role,
                reason: e.to_string(),
            })?;

        tracing::info!(session = %session, role = %role, pid = ?child.id(), "worker spawned");
        self.children.lock().await.insert(session.clone(), child);
        Ok(session)
    }

    async fn terminate(&self, session: &str) -> Result<(), ProcessError> {
        let mut children = self.children.lock().await;
        let mut child = children
            .remove(session)
            .ok_or_else(|| ProcessError::UnknownSession(session.to_string()))?;
        child.kill().await.map_err(|e| ProcessError::Terminate {
            session: session.to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(session, "worker terminated");
        Ok(())
    }

    async fn is_alive(&self, session: &str) -> bool {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(session) else {
            return true;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!(session, %status, "worker exited");
                children.remove(session);
                false
            }
            Err(e) => {
                tracing::warn!(session, error = %e, "worker status unavailable");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_carry_the_role() {
        let id = new_session_id(AgentRole::Tester);
        assert!(id.starts_with("tester-"));
        assert_eq!(id.len(), "tester-".len() + 8);
        assert_ne!(id, new_session_id(AgentRole::Tester));
    }

    #[tokio::test]
    async fn spawn_without_command_is_refused() {
        let pm = CommandProcessManager::new(Vec::new(), PathBuf::from("state.db"));
        assert!(!pm.is_configured());
        let err = pm
            .spawn(AgentRole::Developer, &Assignment::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::NotConfigured));
    }

    #[tokio::test]
    async fn unknown_sessions_are_left_to_the_heartbeat() {
        let pm = CommandProcessManager::new(vec!["true".into()], PathBuf::from("state.db"));
        assert!(pm.is_alive("developer-00000000").await);
        assert!(matches!(
            pm.terminate("developer-00000000").await,
            Err(ProcessError::UnknownSession(_))
        ));
    }
}
