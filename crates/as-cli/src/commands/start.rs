use std::path::Path;

use as_core::config::Config;
use as_core::plan::{FeaturePlan, PlanDocument};
use as_daemon::feature::FeatureLifecycle;

use super::open_db;

/// Run the `start` subcommand: validate the plan and start its feature.
pub async fn run(config: &Config, plan_path: &Path) -> anyhow::Result<()> {
    let doc = PlanDocument::load(plan_path)?;
    let plan = FeaturePlan::from_document(&doc)?;
    let db = open_db(config).await?;

    let feature = FeatureLifecycle::from_config(config)
        .start_feature(&db, &plan)
        .await?;

    println!("started feature {} ({})", feature.name, feature.id);
    for convoy in &plan.convoys {
        println!(
            "  convoy {} [{}] {} tasks={}",
            convoy.id,
            super::label(&convoy.status),
            convoy.story,
            plan.tasks_of(convoy.id).count()
        );
    }
    Ok(())
}
