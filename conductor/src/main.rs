use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use conductor::backend::HttpCloudBackend;
use conductor::config::AppConfig;
use conductor::db::connection::{close_pool, create_pool, with_conn};
use conductor::db::migrate::migrate;
use conductor::db::DbPool;
use conductor::events::start_persister;
use conductor::models::backup_schedule::{self, CreateScheduleData};
use conductor::models::instance::{self, CreateInstanceData};
use conductor::models::{audit_event, backup, BackupSource};
use conductor::queue::store;
use conductor::queue::worker::start_workers;
use conductor::services::backup_orchestrator;
use conductor::services::provisioning::request_provisioning;
use conductor::services::sweep_scheduler::SweepScheduler;
use conductor::state::AppState;
use conductor::strategy::instance::SOURCE_TYPE;
use conductor::utils::logger;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SETTLED_TASK_RETENTION_DAYS: i64 = 7;

#[derive(Parser, Debug)]
#[command(name = "conductor", version, about = "Backup lifecycle and provisioning orchestration worker")]
struct Cli {
    /// SQLite database path (overrides DATABASE_PATH)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (overrides LOG_LEVEL)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run task workers and the sweep scheduler until interrupted
    Run,
    #[command(subcommand)]
    Backup(BackupCommand),
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    #[command(subcommand)]
    Instance(InstanceCommand),
    /// Show recent audit events
    Events {
        /// Only events for this entity
        #[arg(long)]
        entity: Option<Uuid>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[derive(Args, Debug)]
struct SourceArgs {
    #[arg(long, default_value = SOURCE_TYPE)]
    source_type: String,
    #[arg(long)]
    source_id: Uuid,
}

impl SourceArgs {
    fn into_source(self) -> BackupSource {
        BackupSource::new(self.source_type, self.source_id)
    }
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    /// Queue a backup of a source
    Create {
        #[command(flatten)]
        source: SourceArgs,
        /// Keep the backup for this many days
        #[arg(long)]
        keep_days: Option<i64>,
    },
    /// Queue the restoration of a ready backup onto an instance
    Restore {
        backup: Uuid,
        #[arg(long)]
        instance: Uuid,
        /// Extra restore parameters as a JSON object
        #[arg(long)]
        input: Option<String>,
    },
    /// Queue the deletion of a ready or erred backup
    Delete { backup: Uuid },
    List,
}

#[derive(Subcommand, Debug)]
enum ScheduleCommand {
    Create {
        #[command(flatten)]
        source: SourceArgs,
        /// Cron expression, five fields or six with seconds
        #[arg(long)]
        schedule: String,
        #[arg(long)]
        retention_days: i64,
        #[arg(long)]
        max_backups: Option<i64>,
        /// Create the schedule without activating it
        #[arg(long)]
        inactive: bool,
    },
    Activate { schedule: Uuid },
    Deactivate { schedule: Uuid },
    List,
}

#[derive(Subcommand, Debug)]
enum InstanceCommand {
    /// Register an instance and queue its provisioning
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        flavor: String,
        #[arg(long)]
        system_volume: Option<String>,
        #[arg(long)]
        data_volume: Option<String>,
    },
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(database) = cli.database {
        config.db_path = database;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    logger::init(&config.log_level)?;

    let pool = open_database(&config)?;

    let result = match cli.command {
        Command::Run => run(pool.clone(), config).await,
        Command::Backup(command) => backup_command(&pool, command).await,
        Command::Schedule(command) => schedule_command(&pool, command).await,
        Command::Instance(command) => instance_command(&pool, command).await,
        Command::Events { entity, limit } => {
            let events =
                with_conn(&pool, move |conn| audit_event::find_recent(conn, entity, limit)).await?;
            print_json(&events)
        }
    };

    close_pool(&pool);
    result
}

fn open_database(config: &AppConfig) -> anyhow::Result<DbPool> {
    let data_dir = config
        .db_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path).with_context(|| format!("opening database {db_path}"))?;
    migrate(&pool, data_dir)?;
    Ok(pool)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(pool: DbPool, config: AppConfig) -> anyhow::Result<()> {
    tracing::info!(
        database = %config.db_path.display(),
        backend = %config.backend_url,
        workers = config.worker_concurrency,
        "Starting conductor"
    );

    let purged = with_conn(&pool, |conn| {
        store::purge_settled(conn, chrono::Utc::now() - chrono::Duration::days(SETTLED_TASK_RETENTION_DAYS))
    })
    .await?;
    if purged > 0 {
        tracing::info!(purged, "Removed old settled tasks");
    }

    let backend = HttpCloudBackend::new(&config.backend_url, config.backend_timeout)?;
    let sweep_cron = config.sweep_cron.clone();
    let state = Arc::new(AppState::new(pool, config, Arc::new(backend)));
    tracing::info!(source_types = ?state.strategies.source_types(), "Backup strategies registered");

    let cancel = CancellationToken::new();
    let persister = start_persister(&state.events, state.db.clone(), cancel.clone());
    let workers = start_workers(state.clone(), cancel.clone());

    let scheduler = match SweepScheduler::new(state.clone()).await {
        Ok(s) => {
            if let Err(e) = s.schedule_sweeps(&sweep_cron).await {
                tracing::warn!("Failed to schedule sweeps: {}", e);
            }
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(s)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    shutdown_signal(cancel.clone()).await;

    tracing::info!("Shutting down...");
    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    for joined in futures_util::future::join_all(workers).await {
        if let Err(e) = joined {
            tracing::warn!("Worker ended abnormally: {}", e);
        }
    }
    if let Err(e) = persister.await {
        tracing::warn!("Audit persister ended abnormally: {}", e);
    }

    tracing::info!("Conductor stopped");
    Ok(())
}

async fn backup_command(pool: &DbPool, command: BackupCommand) -> anyhow::Result<()> {
    match command {
        BackupCommand::Create { source, keep_days } => {
            let source = source.into_source();
            let kept_until = keep_days.map(|days| chrono::Utc::now() + chrono::Duration::days(days));
            let created = with_conn(pool, move |conn| {
                backup_orchestrator::request_backup(conn, &source, kept_until)
            })
            .await?;
            print_json(&created)
        }
        BackupCommand::Restore {
            backup,
            instance,
            input,
        } => {
            let user_input = match input {
                Some(raw) => serde_json::from_str(&raw).context("--input must be valid JSON")?,
                None => serde_json::Value::Null,
            };
            with_conn(pool, move |conn| {
                backup_orchestrator::start_restoration(conn, backup, instance, user_input)
            })
            .await?;
            println!("Restoration of {backup} onto {instance} queued");
            Ok(())
        }
        BackupCommand::Delete { backup } => {
            with_conn(pool, move |conn| backup_orchestrator::start_deletion(conn, backup)).await?;
            println!("Deletion of {backup} queued");
            Ok(())
        }
        BackupCommand::List => print_json(&with_conn(pool, |conn| backup::find_all(conn)).await?),
    }
}

async fn schedule_command(pool: &DbPool, command: ScheduleCommand) -> anyhow::Result<()> {
    match command {
        ScheduleCommand::Create {
            source,
            schedule,
            retention_days,
            max_backups,
            inactive,
        } => {
            let data = CreateScheduleData {
                backup_source: source.into_source(),
                schedule,
                retention_days,
                maximal_number_of_backups: max_backups,
                is_active: !inactive,
            };
            let created = with_conn(pool, move |conn| backup_schedule::create(conn, &data)).await?;
            print_json(&created)
        }
        ScheduleCommand::Activate { schedule } => set_active(pool, schedule, true).await,
        ScheduleCommand::Deactivate { schedule } => set_active(pool, schedule, false).await,
        ScheduleCommand::List => {
            print_json(&with_conn(pool, |conn| backup_schedule::find_all(conn)).await?)
        }
    }
}

async fn set_active(pool: &DbPool, uuid: Uuid, is_active: bool) -> anyhow::Result<()> {
    let updated = with_conn(pool, move |conn| {
        backup_schedule::set_active(conn, uuid, is_active, chrono::Utc::now())
    })
    .await?
    .ok_or_else(|| anyhow::anyhow!("schedule {uuid} does not exist"))?;
    print_json(&updated)
}

async fn instance_command(pool: &DbPool, command: InstanceCommand) -> anyhow::Result<()> {
    match command {
        InstanceCommand::Create {
            name,
            flavor,
            system_volume,
            data_volume,
        } => {
            let data = CreateInstanceData {
                name,
                flavor_id: flavor,
                system_volume_id: system_volume,
                data_volume_id: data_volume,
            };
            let created = with_conn(pool, move |conn| request_provisioning(conn, &data)).await?;
            print_json(&created)
        }
        InstanceCommand::List => print_json(&with_conn(pool, |conn| instance::find_all(conn)).await?),
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
}
