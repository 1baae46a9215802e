use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};

use replexon::config::{AppConfig, LogFormat, LoggingConfig};
use replexon::runs::{BackupRun, DateWindow, RunStatus, RunType};
use replexon::scheduler::{CycleReport, PollState, ScheduleBook};
use replexon::storage::{self, CursorStore, RunFilter, RunStore, TriggerLedger, DEFAULT_PER_PAGE};
use replexon::trigger::{TriggerError, TriggerService};

#[derive(Parser)]
#[command(
    name = "replexon",
    about = "Backup history ingestion and metrics for Plex backup jobs",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults: $REPLEXON_CONFIG, /etc/replexon/replexon.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (poller + API server)
    Serve {
        /// Bind address, overriding the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Ingest both sources from the beginning and exit
    Import,

    /// Launch the backup script now
    Trigger,

    /// Show the most recent run
    Latest {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Check that the backup log and tracking feed are readable
    Check,

    /// List stored runs, newest first
    Runs {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        /// daily_mirror, snapshot, cleanup, manual or script_backup
        #[arg(long = "type")]
        run_type: Option<RunType>,
        /// success, failed, running or unknown
        #[arg(long)]
        status: Option<RunStatus>,
        /// Substring of the log excerpt
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value = "1")]
        page: u32,
        #[arg(long, default_value_t = DEFAULT_PER_PAGE)]
        per_page: u32,
        #[arg(long)]
        json: bool,
    },

    /// Summary metrics over the last N days
    Metrics {
        #[arg(long, default_value = "30")]
        days: u32,
        #[arg(long)]
        json: bool,
    },

    /// Inspect configured schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all schedules
    List,

    /// Preview what will run in the next N hours
    Preview {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (mut config, origin) = AppConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);
    origin.log();

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting Replexon daemon");
            replexon::serve(config).await?;
        }
        Commands::Import => {
            tracing::info!("Importing backup history from the beginning");
            let sources = config.sources.clone();
            let totals = tokio::task::spawn_blocking(move || import(&config)).await??;
            println!("\nReplexon Import");
            println!("Bytes read:   {}", totals.bytes_read);
            println!("Inserted:     {}", totals.inserted);
            println!("Updated:      {}", totals.updated);
            println!("Unchanged:    {}", totals.unchanged);
            println!("Conflicts:    {}", totals.conflicts);
            println!("Anomalies:    {}", totals.anomalies);
            if totals.log_absent {
                println!("Warning: backup log {} not found", sources.backup_log.display());
            }
            if totals.tracking_absent {
                println!("Warning: tracking feed {} not found", sources.tracking_feed.display());
            }
            println!();
        }
        Commands::Trigger => {
            let pool = storage::open_pool(&config.storage.db_path)?;
            let service =
                TriggerService::from_config(&config.trigger, RunStore::new(pool.clone()), TriggerLedger::new(pool));
            match service.trigger(Local::now().naive_local()).await {
                Ok(run) => {
                    println!("Backup launched at {}.", format_time(&run));
                    println!("Progress is reported by the backup log; see `replexon latest`.");
                }
                Err(TriggerError::Cooldown { remaining_secs }) => {
                    println!("Trigger cooling down, retry in {remaining_secs}s.");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Latest { json } => {
            let store = RunStore::new(storage::open_pool(&config.storage.db_path)?);
            let latest = tokio::task::spawn_blocking(move || store.latest()).await??;
            if json {
                println!("{}", serde_json::to_string_pretty(&latest)?);
            } else {
                match latest {
                    Some(run) => print_run(&run),
                    None => println!("No runs recorded yet."),
                }
            }
        }
        Commands::Check => {
            let healthy = check(&config)?;
            if !healthy {
                std::process::exit(1);
            }
        }
        Commands::Runs {
            from,
            to,
            run_type,
            status,
            search,
            page,
            per_page,
            json,
        } => {
            let store = RunStore::new(storage::open_pool(&config.storage.db_path)?);
            let filter = RunFilter {
                from,
                to,
                run_type,
                status,
                search,
                page,
                per_page,
            };
            let result = tokio::task::spawn_blocking(move || store.list(&filter)).await??;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if result.runs.is_empty() {
                println!("No runs found.");
            } else {
                println!(
                    "{:<10} | {:<13} | {:<7} | {:<19} | {:<11} | {:<10} | Source",
                    "Date", "Type", "Status", "Started", "Duration", "Size"
                );
                println!("{:-<10}-|-{:-<13}-|-{:-<7}-|-{:-<19}-|-{:-<11}-|-{:-<10}-|-{:-<13}", "", "", "", "", "", "", "");
                for run in &result.runs {
                    println!(
                        "{:<10} | {:<13} | {:<7} | {:<19} | {:<11} | {:<10} | {}",
                        run.date,
                        run.run_type,
                        run.status,
                        format_time(run),
                        run.duration_display(),
                        run.size_display(),
                        run.source
                    );
                }
                println!(
                    "\nPage {} of {} ({} runs)",
                    result.page,
                    result.total_pages.max(1),
                    result.total
                );
            }
        }
        Commands::Metrics { days, json } => {
            let store = RunStore::new(storage::open_pool(&config.storage.db_path)?);
            let window = DateWindow::last_days(Local::now().date_naive(), days);
            let service = replexon::analysis::MetricsService::new(store, config.metrics.cache_ttl());
            let metrics = tokio::task::spawn_blocking(move || service.metrics(window)).await??;
            if json {
                println!("{}", serde_json::to_string_pretty(metrics.as_ref())?);
            } else {
                println!("\n=== Backup Metrics (last {days} days) ===");
                println!("Success rate:   {:.1}%", metrics.success_rate);
                println!(
                    "Backups:        {} ({} ok, {} failed)",
                    metrics.total_backups, metrics.success_count, metrics.failure_count
                );
                if let Some(size) = metrics.latest_size {
                    println!("Latest size:    {}", replexon::runs::format_bytes(size));
                }
                if let Some(avg) = metrics.avg_duration_secs {
                    println!("Avg duration:   {avg:.0}s");
                }
                if let Some(last) = &metrics.last_backup {
                    println!("Last backup:    {} {} ({})", last.date, last.run_type, last.status);
                }
                println!("\nBy type:");
                for (run_type, count) in &metrics.type_counts {
                    println!(" - {:<14} {}", run_type.as_str(), count);
                }
                println!("=========================================\n");
            }
        }
        Commands::Schedule { action } => {
            let book = ScheduleBook::new(&config.schedules)?;
            match action {
                ScheduleAction::List => {
                    let list: Vec<_> = book.schedules().collect();
                    if list.is_empty() {
                        println!("No schedules found.");
                    } else {
                        println!("{:<28} | {:<18} | Job", "Name", "Cron");
                        println!("{:-<28}-|-{:-<18}-|-{:-<13}", "", "", "");
                        for schedule in list {
                            println!(
                                "{:<28} | {:<18} | {}",
                                schedule.name, schedule.cron_expr, schedule.job
                            );
                        }
                    }
                }
                ScheduleAction::Preview { hours } => {
                    let preview = book.preview(Local::now(), hours);
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for run in preview {
                            println!("{} : {} ({})", run.at.format("%Y-%m-%d %H:%M %Z"), run.name, run.job);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Read both sources from offset zero until a pass reads nothing new.
fn import(config: &AppConfig) -> Result<CycleReport> {
    let pool = storage::open_pool(&config.storage.db_path)?;
    let ingestor = replexon::ingestor(config, pool);
    let mut state = PollState::backfill(&config.sources);
    let mut totals = CycleReport::default();
    loop {
        let report = ingestor
            .run_cycle(&mut state, Local::now().naive_local())
            .context("import cycle failed")?;
        totals.bytes_read += report.bytes_read;
        totals.inserted += report.inserted;
        totals.updated += report.updated;
        totals.unchanged += report.unchanged;
        totals.conflicts += report.conflicts;
        totals.anomalies += report.anomalies;
        totals.retracted += report.retracted;
        totals.log_absent = report.log_absent;
        totals.tracking_absent = report.tracking_absent;
        if report.bytes_read == 0 {
            break;
        }
    }
    Ok(totals)
}

/// Prints one line per source and returns whether both are usable.
fn check(config: &AppConfig) -> Result<bool> {
    let cursors = match storage::open_pool(&config.storage.db_path) {
        Ok(pool) => Some(CursorStore::new(pool)),
        Err(e) => {
            println!("[FAIL] database {}: {e:#}", config.storage.db_path.display());
            None
        }
    };

    let mut healthy = cursors.is_some();
    for (label, path) in [
        ("backup log", &config.sources.backup_log),
        ("tracking feed", &config.sources.tracking_feed),
    ] {
        healthy &= check_source(label, path, cursors.as_ref());
    }

    let script = &config.trigger.script_path;
    if script.exists() {
        println!("[ OK ] backup script {}", script.display());
    } else {
        println!("[WARN] backup script {} not found; manual triggers will fail", script.display());
    }
    Ok(healthy)
}

fn check_source(label: &str, path: &Path, cursors: Option<&CursorStore>) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => {
            let offset = cursors
                .and_then(|c| c.load(path).ok().flatten())
                .map(|c| c.offset.to_string())
                .unwrap_or_else(|| "none".to_string());
            println!(
                "[ OK ] {label} {} ({}, cursor {offset})",
                path.display(),
                replexon::runs::format_bytes(meta.len())
            );
            true
        }
        Err(e) => {
            println!("[FAIL] {label} {}: {e}", path.display());
            false
        }
    }
}

fn format_time(run: &BackupRun) -> String {
    run.started_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_run(run: &BackupRun) {
    println!("\n=== Latest Backup Run ===");
    println!("Date:        {}", run.date);
    println!("Type:        {}", run.run_type);
    println!("Status:      {}", run.status);
    println!("Started:     {}", format_time(run));
    println!("Duration:    {}", run.duration_display());
    println!("Size:        {}", run.size_display());
    println!("Transferred: {}", run.transferred_display());
    println!("Source:      {}", run.source);
    if let Some(code) = run.exit_code {
        println!("Exit code:   {code}");
    }
    println!("=========================\n");
}
