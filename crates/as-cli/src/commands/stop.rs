use as_core::config::Config;
use as_daemon::feature::FeatureLifecycle;
use uuid::Uuid;

use super::open_db;

pub async fn run(config: &Config, feature: Uuid, reason: &str) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let notified = FeatureLifecycle::from_config(config)
        .stop_feature(&db, feature, reason)
        .await?;
    println!("feature {feature} stopping, {notified} session(s) notified");
    Ok(())
}
