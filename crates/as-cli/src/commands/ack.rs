use as_core::config::Config;
use uuid::Uuid;

use super::open_db;

/// Run the `ack` subcommand: mark a consumed event done.
pub async fn run(config: &Config, event: Uuid) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let event = db.queue().ack(event).await?;
    println!("event {} {}", event.id, event.status.as_str());
    Ok(())
}

#[cfg(test)]
mod tests {
    use as_core::types::EventStatus;
    use serde_json::json;

    use super::*;
    use crate::commands::testing;

    #[tokio::test]
    async fn acks_only_consumed_events() {
        let (_dir, config) = testing::config();
        let db = open_db(&config).await.unwrap();
        let sent = db.queue().publish("tester-1", "VALIDATE", json!({})).await.unwrap();

        // Still pending: nobody holds it.
        assert!(run(&config, sent.id).await.is_err());

        db.queue().consume("tester-1").await.unwrap().unwrap();
        run(&config, sent.id).await.unwrap();
        assert_eq!(db.count_events("tester-1", EventStatus::Done).await.unwrap(), 1);
    }
}
