//! MultiInstance - Run multiple instances of a single-instance game client
//!
//! Headless front end: launches the requested instances, keeps them monitored
//! and tears everything down on Ctrl+C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use single_instance::SingleInstance;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use multiinstance_orchestrator::{
    platform, Database, LaunchMethod, LaunchOptions, Orchestrator, Settings, APP_NAME,
    APP_VERSION,
};

/// Upper bound on teardown once a termination signal arrives
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How long exit waits on runtime tasks still stuck in the OS
const RUNTIME_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "multiinstance", version, about = "Run multiple game client instances side by side")]
struct Cli {
    /// Directory for settings, history and package clones
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Number of instances to launch at startup
    #[arg(short = 'n', long, default_value_t = 1)]
    launch: u32,

    /// Launch strategy: auto, direct, uri-scheme, packaged-clone or scripted
    #[arg(short, long, default_value = "auto")]
    strategy: LaunchMethod,

    /// Game URL to join, e.g. https://www.roblox.com/games/123456
    #[arg(short, long)]
    target_url: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let result = runtime.block_on(run(cli));
    runtime.shutdown_timeout(RUNTIME_DRAIN_TIMEOUT);
    result
}

async fn run(cli: Cli) -> Result<()> {
    // Settings live in the database, which lives in the data directory
    let base = Settings {
        data_directory: cli.data_dir.clone(),
        ..Settings::default()
    };
    let db = Database::open(&base.get_database_path())?;
    db.initialize()?;
    let mut settings = match db.load_settings() {
        Ok(settings) => settings.unwrap_or_default(),
        Err(e) => {
            eprintln!("Ignoring unreadable settings: {:#}", e);
            Settings::default()
        }
    };
    if cli.data_dir.is_some() {
        settings.data_directory = cli.data_dir.clone();
    }

    init_logging(cli.debug || settings.debug_logging);
    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    // Ensure only one orchestrator owns the singleton bypass
    let instance = SingleInstance::new(APP_NAME).context("Failed to create single instance lock")?;
    if !instance.is_single() {
        error!("Another instance of {} is already running!", APP_NAME);
        return Ok(());
    }

    let orchestrator = Arc::new(
        Orchestrator::builder()
            .settings(settings)
            .database(Arc::new(db))
            .build()?,
    );
    let monitor = orchestrator.spawn_monitor();
    let terminated = platform::termination_signal().context("Failed to install signal handlers")?;

    for _ in 0..cli.launch {
        let options = LaunchOptions {
            strategy: cli.strategy,
            target_url: cli.target_url.clone(),
            ..Default::default()
        };
        let launcher = Arc::clone(&orchestrator);
        match tokio::task::spawn_blocking(move || launcher.launch(options)).await? {
            Ok(record) => info!(
                "Launched {} (PID {}, {})",
                record.id, record.os_process_id, record.launch_strategy
            ),
            Err(e) => error!("Launch failed: {}", e),
        }
    }

    info!("Press Ctrl+C to stop all instances");
    terminated.await;

    info!("{} shutting down", APP_NAME);
    let report = orchestrator.shutdown_within(SHUTDOWN_TIMEOUT).await;
    if tokio::time::timeout(RUNTIME_DRAIN_TIMEOUT, monitor).await.is_err() {
        warn!("Monitor did not stop in time");
    }

    let Some(report) = report else {
        anyhow::bail!("Teardown did not finish within {:?}", SHUTDOWN_TIMEOUT);
    };
    info!("Stopped {} instances", report.stopped.len());
    for id in &report.failed {
        warn!("Instance {} could not be stopped", id);
    }
    Ok(())
}

/// Initialize the logging system
fn init_logging(debug: bool) {
    let default = if debug {
        "multiinstance=debug,multiinstance_orchestrator=debug"
    } else {
        "multiinstance=info,multiinstance_orchestrator=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
