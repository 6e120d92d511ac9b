use as_core::config::Config;
use as_daemon::health::record_heartbeat;

use super::open_db;

pub async fn run(config: &Config, session: &str) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    if record_heartbeat(&db, session).await? {
        println!("heartbeat recorded for {session}");
        Ok(())
    } else {
        anyhow::bail!("{session} is not an active session")
    }
}
