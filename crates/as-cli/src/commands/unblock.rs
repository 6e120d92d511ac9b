use as_core::config::Config;
use as_daemon::state_machine::TaskStateMachine;
use uuid::Uuid;

use super::{label, open_db};

pub async fn run(config: &Config, task: Uuid) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let task = TaskStateMachine::from_config(config).unblock(&db, task).await?;
    println!(
        "task {} unblocked ({}, failures={})",
        task.id,
        label(&task.status),
        task.failure_count
    );
    Ok(())
}
