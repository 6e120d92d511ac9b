mod commands;

use std::path::PathBuf;

use anyhow::Context;
use as_core::config::Config;
use as_core::gates::GateStage;
use as_core::types::EventStatus;
use as_daemon::process::env::{
    CONVOY_ID as CONVOY_ENV, DATABASE as DATABASE_ENV, SESSION_ID as SESSION_ENV,
    TASK_ID as TASK_ENV,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::Instrument;
use uuid::Uuid;

/// ai-sprint CLI -- inspect and steer the coordination state store. Worker
/// commands read their session from `AI_SPRINT_SESSION_ID` when not given.
#[derive(Parser)]
#[command(name = "as", version, about)]
struct Cli {
    /// Configuration file (defaults to ~/.ai-sprint/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State database, overriding `general.database_path`. Spawned workers
    /// get it from the daemon.
    #[arg(long, global = true, env = DATABASE_ENV)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show feature, convoy, task and session counts (default).
    Status,

    /// Validate a plan document and start its feature.
    Start {
        /// Path to the plan JSON.
        plan: PathBuf,
    },

    /// Stop a feature; active workers receive a STOP event.
    Stop {
        feature: Uuid,
        #[arg(short, long, default_value = "stopped by operator")]
        reason: String,
    },

    /// Lift the escalation freeze on a task.
    Unblock { task: Uuid },

    /// List events.
    Events {
        /// Only events addressed to this target.
        #[arg(short, long)]
        target: Option<String>,
        #[arg(short, long, value_enum)]
        status: Option<EventFilter>,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Refresh a session's heartbeat.
    Heartbeat {
        #[arg(env = SESSION_ENV)]
        session: String,
    },

    /// Claim the next convoy for a worker session.
    Allocate {
        #[arg(short, long, env = SESSION_ENV)]
        session: String,
        /// Feature to allocate from (defaults to the one in progress).
        #[arg(short, long)]
        feature: Option<Uuid>,
    },

    /// Hand a held convoy back to the pool.
    Release {
        convoy: Uuid,
        #[arg(short, long, env = SESSION_ENV)]
        session: String,
    },

    /// Start the oldest open task of a convoy.
    ClaimNext {
        #[arg(env = CONVOY_ENV)]
        convoy: Uuid,
        #[arg(short, long, env = SESSION_ENV)]
        session: String,
    },

    /// Hand an in-progress task to review.
    Submit {
        #[arg(env = TASK_ENV)]
        task: Uuid,
    },

    /// Evaluate a quality gate from a metrics JSON file and apply the verdict.
    Gate {
        task: Uuid,
        #[arg(value_enum)]
        stage: StageArg,
        /// Metrics JSON object; `-` reads stdin.
        #[arg(short, long)]
        metrics: PathBuf,
    },

    /// Record an acceptance criterion result.
    Criterion {
        task: Uuid,
        /// Criterion id (`ac-1`, `ac-2`, ...).
        criterion: String,
        /// Record the criterion as not satisfied.
        #[arg(long)]
        unsatisfied: bool,
        #[arg(short, long, env = SESSION_ENV)]
        validator: String,
    },

    /// Claim the oldest pending event of a mailbox and print it as JSON.
    Consume {
        #[arg(env = SESSION_ENV)]
        target: String,
    },

    /// Mark a consumed event done.
    Ack { event: Uuid },

    /// Mark a consumed event failed.
    Nack {
        event: Uuid,
        #[arg(short, long)]
        reason: String,
    },

    /// Print the effective configuration.
    Config {
        /// Print only the configuration file path.
        #[arg(long)]
        path: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StageArg {
    CodeQuality,
    TestQuality,
    SecurityMerge,
}

impl From<StageArg> for GateStage {
    fn from(s: StageArg) -> Self {
        match s {
            StageArg::CodeQuality => GateStage::CodeQuality,
            StageArg::TestQuality => GateStage::TestQuality,
            StageArg::SecurityMerge => GateStage::SecurityMerge,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum EventFilter {
    Pending,
    Processing,
    Done,
    Failed,
}

impl From<EventFilter> for EventStatus {
    fn from(f: EventFilter) -> Self {
        match f {
            EventFilter::Pending => EventStatus::Pending,
            EventFilter::Processing => EventStatus::Processing,
            EventFilter::Done => EventStatus::Done,
            EventFilter::Failed => EventStatus::Failed,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = if config_path.exists() {
        Config::load_from(&config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?
    } else {
        Config::default()
    };
    if let Some(database) = &cli.database {
        config.general.database_path = database.display().to_string();
    }
    // The CLI prints its results; logs stay quiet unless asked for.
    as_telemetry::logging::init("as", "warn", config.general.log_json);
    let session = std::env::var(SESSION_ENV).ok();
    let span = as_telemetry::logging::process_span("as", session.as_deref());

    dispatch(cli.command, &config, &config_path).instrument(span).await
}

async fn dispatch(
    command: Option<Commands>,
    config: &Config,
    config_path: &std::path::Path,
) -> anyhow::Result<()> {
    match command {
        None | Some(Commands::Status) => commands::status::run(config).await?,
        Some(Commands::Start { plan }) => commands::start::run(config, &plan).await?,
        Some(Commands::Stop { feature, reason }) => {
            commands::stop::run(config, feature, &reason).await?
        }
        Some(Commands::Unblock { task }) => commands::unblock::run(config, task).await?,
        Some(Commands::Events {
            target,
            status,
            limit,
        }) => {
            commands::events::run(config, target.as_deref(), status.map(Into::into), limit)
                .await?
        }
        Some(Commands::Heartbeat { session }) => {
            commands::heartbeat::run(config, &session).await?
        }
        Some(Commands::Allocate { session, feature }) => {
            commands::allocate::run(config, &session, feature).await?
        }
        Some(Commands::Release { convoy, session }) => {
            commands::release::run(config, convoy, &session).await?
        }
        Some(Commands::ClaimNext { convoy, session }) => {
            commands::claim::run(config, convoy, &session).await?
        }
        Some(Commands::Submit { task }) => commands::submit::run(config, task).await?,
        Some(Commands::Gate {
            task,
            stage,
            metrics,
        }) => commands::gate::run(config, task, stage.into(), &metrics).await?,
        Some(Commands::Criterion {
            task,
            criterion,
            unsatisfied,
            validator,
        }) => {
            commands::criterion::run(config, task, &criterion, !unsatisfied, &validator).await?
        }
        Some(Commands::Consume { target }) => commands::consume::run(config, &target).await?,
        Some(Commands::Ack { event }) => commands::ack::run(config, event).await?,
        Some(Commands::Nack { event, reason }) => {
            commands::nack::run(config, event, &reason).await?
        }
        Some(Commands::Config { path }) => commands::config::run(config, config_path, path)?,
    }

    Ok(())
}
