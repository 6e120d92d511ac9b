use as_core::config::Config;
use as_daemon::state_machine::TaskStateMachine;
use uuid::Uuid;

use super::open_db;

/// Run the `claim-next` subcommand: start the oldest open task of a convoy.
pub async fn run(config: &Config, convoy: Uuid, session: &str) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    match TaskStateMachine::from_config(config)
        .claim_next(&db, convoy, session)
        .await?
    {
        Some(task) => println!("{} {} {}", task.id, task.file_path, task.title),
        None => println!("no task available"),
    }
    Ok(())
}
