use as_core::config::Config;
use as_daemon::allocator::ConvoyAllocator;
use uuid::Uuid;

use super::open_db;

/// Run the `release` subcommand: hand a held convoy back to the pool.
pub async fn run(config: &Config, convoy: Uuid, session: &str) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let convoy = ConvoyAllocator::default()
        .release(&db, convoy, session)
        .await?;
    println!("convoy {} released", convoy.id);
    Ok(())
}
