use as_core::config::Config;

use super::open_db;

/// Run the `consume` subcommand: claim the oldest pending event for
/// `target` and print it as one JSON line. Prints nothing when the mailbox
/// is empty.
pub async fn run(config: &Config, target: &str) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    if let Some(event) = db.queue().consume(target).await? {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
