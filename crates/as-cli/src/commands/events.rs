use as_core::config::Config;
use as_core::types::EventStatus;

use super::{label, open_db};

pub async fn run(
    config: &Config,
    target: Option<&str>,
    status: Option<EventStatus>,
    limit: usize,
) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let events = db.list_events(target, status, limit).await?;
    if events.is_empty() {
        println!("no events");
        return Ok(());
    }

    for e in events {
        println!(
            "{} {:<10} {:<16} {:<22} {}",
            e.created_at.format("%m-%d %H:%M:%S"),
            label(&e.status),
            e.target,
            e.event_type,
            e.payload
        );
        if let Some(error) = e.error {
            println!("    error: {error}");
        }
    }
    Ok(())
}
