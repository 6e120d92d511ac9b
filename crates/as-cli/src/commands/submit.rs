use as_core::config::Config;
use as_daemon::state_machine::TaskStateMachine;
use uuid::Uuid;

use super::open_db;

/// Run the `submit` subcommand: hand a finished task to review.
pub async fn run(config: &Config, task: Uuid) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let task = TaskStateMachine::from_config(config).submit(&db, task).await?;
    println!("task {} {}", task.id, task.status);
    Ok(())
}
