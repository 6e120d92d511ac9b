use anyhow::Context;
use as_core::config::Config;
use as_daemon::allocator::ConvoyAllocator;
use uuid::Uuid;

use super::open_db;

/// Run the `allocate` subcommand: claim the next convoy of the feature (the
/// one in progress by default) for `session`.
pub async fn run(config: &Config, session: &str, feature: Option<Uuid>) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let feature_id = match feature {
        Some(id) => id,
        None => db
            .active_feature()
            .await?
            .map(|f| f.id)
            .context("no feature in progress")?,
    };

    match ConvoyAllocator::default()
        .allocate(&db, feature_id, session)
        .await?
    {
        Some(convoy) => println!("{} {}", convoy.id, convoy.story),
        None => println!("no convoy available"),
    }
    Ok(())
}
