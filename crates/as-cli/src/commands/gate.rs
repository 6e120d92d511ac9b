use std::io::Read;
use std::path::Path;

use anyhow::Context;
use as_core::config::Config;
use as_core::gates::{GateStage, Metrics};
use as_daemon::state_machine::TaskStateMachine;
use uuid::Uuid;

use super::open_db;

/// Read a metrics JSON object from `path`, or from stdin when it is `-`.
fn read_metrics(path: &Path) -> anyhow::Result<Metrics> {
    let raw = if path == Path::new("-") {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("failed to read metrics from stdin")?;
        raw
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?
    };
    serde_json::from_str(&raw).context("metrics must be a JSON object of numbers and booleans")
}

/// Run the `gate` subcommand: evaluate the gate guarding the task's stage
/// with the configured thresholds and apply the verdict.
pub async fn run(
    config: &Config,
    task: Uuid,
    stage: GateStage,
    metrics_path: &Path,
) -> anyhow::Result<()> {
    let metrics = read_metrics(metrics_path)?;
    let db = open_db(config).await?;
    let (verdict, transition) = TaskStateMachine::from_config(config)
        .run_gate(&db, task, stage, &metrics, &config.gate_thresholds())
        .await?;

    let outcome = if verdict.passed { "passed" } else { "failed" };
    println!(
        "{} gate {}: task {} {} -> {}",
        verdict.stage, outcome, transition.task.id, transition.from, transition.task.status
    );
    for reason in &verdict.reasons {
        println!("  fail: {reason}");
    }
    for warning in &verdict.warnings {
        println!("  warn: {warning}");
    }
    if transition.escalated {
        println!(
            "  escalated after {} failures; task is blocked",
            transition.task.failure_count
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use as_core::types::TaskStatus;

    use super::*;
    use crate::commands::{allocate, claim, criterion, submit, testing};

    fn metrics_file(dir: &Path, name: &str, json: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, json).unwrap();
        path
    }

    #[tokio::test]
    async fn metrics_file_drives_the_pipeline() {
        let (dir, config) = testing::config();
        let (db, plan) = testing::started(&config).await;
        let task_id = plan.tasks[0].id;
        allocate::run(&config, "developer-1", None).await.unwrap();
        claim::run(&config, plan.convoys[0].id, "developer-1").await.unwrap();
        submit::run(&config, task_id).await.unwrap();

        let code = metrics_file(
            dir.path(),
            "code.json",
            r#"{"lint_errors": 0, "type_errors": 0, "max_complexity": 6}"#,
        );
        run(&config, task_id, GateStage::CodeQuality, &code).await.unwrap();
        assert_eq!(
            db.get_task(task_id).await.unwrap().unwrap().status,
            TaskStatus::InTests
        );

        // The criterion is still open, so the test gate fails on it.
        let tests = metrics_file(
            dir.path(),
            "tests.json",
            r#"{"coverage_percent": 92.5, "mutation_score": 85}"#,
        );
        run(&config, task_id, GateStage::TestQuality, &tests).await.unwrap();
        let task = db.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.failure_count, 1);
        assert!(task.failure_reason.unwrap().contains("ac_satisfied_percent"));

        submit::run(&config, task_id).await.unwrap();
        run(&config, task_id, GateStage::CodeQuality, &code).await.unwrap();
        criterion::run(&config, task_id, "ac-1", true, "tester-1").await.unwrap();
        run(&config, task_id, GateStage::TestQuality, &tests).await.unwrap();
        assert_eq!(
            db.get_task(task_id).await.unwrap().unwrap().status,
            TaskStatus::InDocs
        );
    }

    #[tokio::test]
    async fn wrong_stage_is_refused() {
        let (dir, config) = testing::config();
        let (_db, plan) = testing::started(&config).await;
        let metrics = metrics_file(dir.path(), "m.json", r#"{"merge_succeeded": true}"#);
        let err = run(&config, plan.tasks[0].id, GateStage::SecurityMerge, &metrics)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not apply"));
    }

    #[test]
    fn malformed_metrics_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = metrics_file(dir.path(), "bad.json", r#"["coverage_percent"]"#);
        assert!(read_metrics(&path).is_err());
    }
}
