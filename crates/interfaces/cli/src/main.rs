use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use fs2::FileExt;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use dropline_config::{AppConfig, RiskLevel, WatchBackend};
use dropline_pipeline::{PipelineOptions, run_pipeline};
use dropline_runtime::{DaemonRunner, build_client_watches};
use dropline_telegram::TelegramBot;

#[derive(Debug, Parser)]
#[command(
    name = "dropline",
    version,
    about = "Folder-watch ingestion daemon for courier batch files"
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "config/dropline.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Watch client inbound folders and process dropped files (default).
    Run(RunArgs),
    /// Load and validate the configuration, printing the resolved clients.
    Validate,
    /// List configured client ids.
    Clients,
    /// Run the pipeline once for a single input file.
    Process {
        #[arg(value_name = "FILE")]
        file: String,
        /// Client to process the file as.
        #[arg(long)]
        client: String,
        /// Parse and report without writing any output files.
        #[arg(long)]
        dry_run: bool,
    },
    /// Write a starter configuration if none exists.
    Init,
}

/// Daemon flags. Anything left unset falls back to the config file value.
#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Clients to watch: "all" or a comma-separated list of ids.
    #[arg(long, default_value = "all")]
    clients: String,
    #[arg(long)]
    use_telegram: Option<bool>,
    #[arg(long)]
    use_ai: Option<bool>,
    #[arg(long)]
    auto_apply_max_risk: Option<RiskLevel>,
    #[arg(long)]
    max_ai_calls: Option<u32>,
    /// Watch inbound folders recursively.
    #[arg(long)]
    recursive: Option<bool>,
    /// File watch backend: "notify" or "poll".
    #[arg(long)]
    backend: Option<WatchBackend>,
    #[arg(long)]
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let mut config = AppConfig::load_from(&cli.config)?;
            apply_overrides(&mut config, &args);
            config.validate()?;
            let _guard = init_daemon_logging(Path::new(&config.daemon.log_dir))?;
            run_daemon(config, parse_selection(&args.clients)).await
        }
        command => {
            init_console_logging();
            match command {
                Commands::Run(_) => unreachable!("handled above"),
                Commands::Validate => run_validate(&cli.config),
                Commands::Clients => {
                    let config = AppConfig::load_from(&cli.config)?;
                    for id in config.client_ids() {
                        println!("{id}");
                    }
                    Ok(())
                }
                Commands::Process {
                    file,
                    client,
                    dry_run,
                } => {
                    let config = AppConfig::load_from(&cli.config)?;
                    config.validate()?;
                    run_process(&config, &file, &client, dry_run)
                }
                Commands::Init => run_init(&cli.config),
            }
        }
    }
}

// ── Logging ───────────────────────────────────────────────────────────────────

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
}

fn init_console_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .init();
}

/// Console plus a daily-rolling file in the log directory. The returned guard
/// must stay alive for the duration of the process or buffered lines are lost.
fn init_daemon_logging(log_dir: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log dir {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::daily(log_dir, "dropline.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(default_filter());
    let console_layer = tracing_subscriber::fmt::layer().with_filter(default_filter());
    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();
    Ok(guard)
}

// ── Flag merging ──────────────────────────────────────────────────────────────

fn apply_overrides(config: &mut AppConfig, args: &RunArgs) {
    if let Some(value) = args.use_telegram {
        config.daemon.use_telegram = value;
    }
    if let Some(value) = args.use_ai {
        config.daemon.use_ai = value;
    }
    if let Some(value) = args.auto_apply_max_risk {
        config.daemon.auto_apply_max_risk = value;
    }
    if let Some(value) = args.max_ai_calls {
        config.daemon.max_ai_calls = value;
    }
    if let Some(value) = args.recursive {
        config.daemon.recursive = value;
    }
    if let Some(value) = args.backend {
        config.daemon.backend = value;
    }
    if let Some(dir) = &args.log_dir {
        config.daemon.log_dir = dir.clone();
    }
}

/// `"all"` (or nothing) means every configured client.
fn parse_selection(raw: &str) -> Option<Vec<String>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
        return None;
    }
    Some(
        trimmed
            .split(',')
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect(),
    )
}

// ── Subcommands ───────────────────────────────────────────────────────────────

async fn run_daemon(config: AppConfig, selection: Option<Vec<String>>) -> Result<()> {
    // One daemon per log dir; a second instance would double-process drops.
    let lock_path = Path::new(&config.daemon.log_dir).join("dropline.lock");
    let lock_file = File::create(&lock_path)
        .with_context(|| format!("creating lock file {}", lock_path.display()))?;
    lock_file.try_lock_exclusive().map_err(|_| {
        anyhow::anyhow!(
            "another dropline instance already holds the lock at {}",
            lock_path.display()
        )
    })?;

    let watches = build_client_watches(&config, selection.as_deref())?;

    let bot = if config.daemon.use_telegram {
        match std::env::var("TELEGRAM_BOT_TOKEN") {
            Ok(token) if !token.trim().is_empty() => {
                Some(TelegramBot::new(&token, config.clone())?)
            }
            _ => {
                warn!("TELEGRAM_BOT_TOKEN not set, telegram bot disabled");
                None
            }
        }
    } else {
        None
    };

    let runner = DaemonRunner::new(config, watches)?;
    let handle = runner.start().await?;

    let bot_task = bot.map(|bot| {
        let shutdown = handle.shutdown_receiver();
        tokio::spawn(bot.run(shutdown))
    });

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received");
    handle.stop().await;

    if let Some(task) = bot_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "telegram bot exited with error"),
            Err(err) => warn!(error = %err, "telegram bot task join failed"),
        }
    }
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}

fn run_validate(config_path: &str) -> Result<()> {
    let config = AppConfig::load_from(config_path)?;
    config.validate()?;
    println!("configuration OK: {} client(s)", config.clients.len());
    for id in config.client_ids() {
        let client = config.resolve_client(&id)?;
        println!(
            "  {id}  {}  inbox: {}",
            client.display_name,
            client.folders.inbox.display()
        );
    }
    Ok(())
}

fn run_process(config: &AppConfig, file: &str, client_id: &str, dry_run: bool) -> Result<()> {
    let client = config.resolve_client(client_id)?;
    let path = std::path::absolute(Path::new(file)).unwrap_or_else(|_| PathBuf::from(file));
    let raw_text =
        fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;

    let log_dir = Path::new(&config.daemon.log_dir);
    fs::create_dir_all(log_dir)?;
    let options = PipelineOptions {
        use_ai: config.daemon.use_ai,
        auto_apply_max_risk: config.daemon.auto_apply_max_risk,
        max_ai_calls: config.daemon.max_ai_calls,
        dry_run,
    };
    let report = run_pipeline(
        &client,
        &raw_text,
        &[path.display().to_string()],
        "manual",
        log_dir,
        &options,
    )?;

    println!("processed {} record(s) for {client_id}", report.records.len());
    if report.dry_run {
        println!("dry run: no files written");
    } else {
        println!("ready file:    {}", report.output_ready.display());
        println!("tracking file: {}", report.output_tracking.display());
        if let Some(manifest) = &report.manifest_path {
            println!("manifest:      {}", manifest.display());
        }
    }
    if report.flagged_count > 0 {
        println!("{} record(s) flagged for review", report.flagged_count);
    }
    Ok(())
}

fn run_init(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        bail!("config file already exists at {}", path.display());
    }
    AppConfig::starter().save_to(path)?;
    println!("starter config written to {}", path.display());
    println!("edit the client tables, then run `dropline validate`");
    Ok(())
}
