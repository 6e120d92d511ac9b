pub mod ack;
pub mod allocate;
pub mod claim;
pub mod config;
pub mod consume;
pub mod criterion;
pub mod events;
pub mod gate;
pub mod heartbeat;
pub mod nack;
pub mod release;
pub mod start;
pub mod status;
pub mod stop;
pub mod submit;
pub mod unblock;

use anyhow::Context;
use as_core::config::Config;
use as_core::store::StateDb;
use serde::Serialize;

/// Open the configured state database.
pub async fn open_db(config: &Config) -> anyhow::Result<StateDb> {
    let path = config.database_path();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    StateDb::new(&path)
        .await
        .with_context(|| format!("failed to open state database {}", path.display()))
}

/// The snake_case wire name of a status enum.
pub fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "?".to_string(),
    }
}
