use as_core::config::Config;
use uuid::Uuid;

use super::open_db;

/// Run the `nack` subcommand: mark a consumed event failed with a reason.
pub async fn run(config: &Config, event: Uuid, reason: &str) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let event = db.queue().nack(event, reason).await?;
    println!("event {} {}: {}", event.id, event.status.as_str(), reason);
    Ok(())
}
