use as_core::config::Config;
use as_daemon::feature::FeatureLifecycle;

use super::{label, open_db};

/// Run the `status` subcommand: counts per status plus what is blocked.
pub async fn run(config: &Config) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let snapshot = db.status_snapshot().await?;

    println!("ai-sprint status ({})", snapshot.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();

    let active = db.active_feature().await?;
    match &active {
        Some(feature) => println!("Feature   {} ({})", feature.name, feature.id),
        None => println!("Feature   none in progress"),
    }

    print_counts("Features", &snapshot.features);
    print_counts("Convoys", &snapshot.convoys);
    print_counts("Tasks", &snapshot.tasks);

    print!("{:<10}", "Sessions");
    if snapshot.sessions.is_empty() {
        print!("none");
    }
    for (status, n) in &snapshot.sessions {
        print!("{} {}={}  ", status.glyph(), label(status), n);
    }
    println!();

    println!("{:<10}blocked={}  pending_events={}", "Queue", snapshot.blocked_tasks, snapshot.pending_events);

    if let Some(feature) = &active {
        let waiting = FeatureLifecycle::from_config(config)
            .blocked_convoys(&db, feature.id)
            .await?;
        if !waiting.is_empty() {
            println!();
            println!("Waiting convoys:");
            for w in waiting {
                let deps: Vec<String> = w.waiting_on.iter().map(|d| d.to_string()).collect();
                println!("  {} {} <- {}", w.convoy.id, w.convoy.story, deps.join(", "));
            }
        }
    }

    let blocked = db.blocked_tasks().await?;
    if !blocked.is_empty() {
        println!();
        println!("Escalated tasks:");
        for t in blocked {
            println!(
                "  {} {} (failures={}) {}",
                t.id,
                t.title,
                t.failure_count,
                t.failure_reason.unwrap_or_default()
            );
        }
    }

    Ok(())
}

fn print_counts<T: serde::Serialize>(heading: &str, counts: &[(T, u64)]) {
    let line: Vec<String> = counts
        .iter()
        .map(|(status, n)| format!("{}={}", label(status), n))
        .collect();
    let line = if line.is_empty() { "none".to_string() } else { line.join("  ") };
    println!("{heading:<10}{line}");
}
