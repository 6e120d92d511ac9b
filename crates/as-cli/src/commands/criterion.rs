use as_core::config::Config;
use as_daemon::state_machine::TaskStateMachine;
use uuid::Uuid;

use super::open_db;

/// Run the `criterion` subcommand: record an acceptance criterion result.
pub async fn run(
    config: &Config,
    task: Uuid,
    criterion: &str,
    satisfied: bool,
    validator: &str,
) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let task = TaskStateMachine::from_config(config)
        .mark_criterion(&db, task, criterion, satisfied, validator)
        .await?;
    println!(
        "task {} criterion {} {} ({:.0}% satisfied)",
        task.id,
        criterion,
        if satisfied { "satisfied" } else { "unsatisfied" },
        task.ac_satisfied_percent()
    );
    Ok(())
}
