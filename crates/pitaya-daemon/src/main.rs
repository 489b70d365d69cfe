use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pitaya_core::{Adapters, VERSION};
use pitaya_daemon::{CommandSurface, Config, OrchestratorSettings};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pitaya - process restriction daemon
///
/// Keeps background anti-cheat agents off the cores your game uses
#[derive(Parser, Debug)]
#[command(name = "pitaya-daemon")]
#[command(version = VERSION)]
#[command(about = "Pitaya Daemon - process restriction and sampling loop", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "pitaya.toml")]
    config: PathBuf,

    /// Override the tick interval (e.g. "30s", "2m")
    #[arg(long, value_parser = humantime::parse_duration)]
    interval: Option<Duration>,

    /// Restrict targets on every tick regardless of the config file
    #[arg(long)]
    auto_restrict: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Periodic sampling, plus restriction when enabled
    Watch,

    /// One verbose restriction run and one sample, then exit
    Once,

    /// Generate default configuration file
    GenerateConfig {
        /// Output path for config file
        #[arg(short, long, default_value = "pitaya.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::GenerateConfig { output }) = &cli.command {
        return generate_config(output);
    }

    let mut config = load_config(&cli.config)?;
    if let Some(interval) = cli.interval {
        config.orchestrator.tick_interval_secs = interval.as_secs().max(1);
    }
    if cli.auto_restrict {
        config.orchestrator.auto_restrict = true;
    }

    // Initialize logging first
    let _guard = init_logging(&config)?;

    info!("Pitaya Daemon v{} starting...", VERSION);

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration validation failed: {}", e))?;

    info!("Configuration loaded and validated successfully");

    let settings = OrchestratorSettings::from_config(&config)?;
    let surface = CommandSurface::new(Adapters::native(), settings)?;

    match cli.command {
        Some(Commands::Once) => run_once(&surface, &config).await?,
        _ => run_watch_loop(&surface).await?,
    }

    Ok(())
}

/// Single restriction run and sample
async fn run_once(surface: &CommandSurface, config: &Config) -> Result<()> {
    let info = surface.get_system_info();
    info!(
        "{} | {} {} | {} logical cores | admin: {}",
        info.cpu_model, info.os_name, info.os_version, info.cpu_logical_cores, info.is_admin
    );
    if !info.is_admin {
        warn!("Not running as administrator: most directives will be skipped");
    }

    let result = surface.restrict_processes(config.restriction).await?;
    for line in result.message.lines() {
        info!("{}", line);
    }

    let samples = surface.get_process_performance().await?;
    info!("=== Watched processes ===");
    for sample in &samples {
        info!(
            "{} (PID {}): CPU {:.1}%, Memory {:.1} MB",
            sample.name, sample.pid, sample.cpu_usage, sample.memory_mb
        );
    }
    if samples.is_empty() {
        info!("No watched process is running");
    }

    Ok(())
}

/// Run the orchestrator loop until Ctrl+C
async fn run_watch_loop(surface: &CommandSurface) -> Result<()> {
    let orchestrator = surface.orchestrator();
    let status = orchestrator.status();
    info!(
        "Tick interval: {:?}, automatic restriction: {}",
        orchestrator.tick_interval(),
        if status.auto_restrict.is_some() { "on" } else { "off" }
    );

    let handle = orchestrator.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, waiting for in-flight work...");

    orchestrator.stop();
    handle.await?;

    let status = orchestrator.status();
    info!("Ticks: {}", status.ticks);
    if let Some(last) = status.last_restriction {
        for target in last.targets {
            info!(
                "{}: found={}, restricted={} (core {}, {})",
                target.name,
                target.found,
                target.restricted,
                last.target_core,
                last.last_run.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

/// Generate default configuration file
fn generate_config(output: &Path) -> Result<()> {
    Config::default()
        .save_to_file(output)
        .map_err(|e| anyhow::anyhow!("Failed to save configuration file: {}", e))?;

    println!("Configuration written to {}", output.display());
    Ok(())
}

/// Load configuration from file or use defaults, with environment overrides
fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load_from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load configuration file: {}", e))
    } else {
        eprintln!(
            "Configuration file not found: {}, using defaults",
            path.display()
        );
        Config::from_env().map_err(|e| anyhow::anyhow!("Invalid environment overrides: {}", e))
    }
}

/// Initialize logging with file and stdout output
fn init_logging(config: &Config) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&config.logging.log_dir)?;

    let file_appender =
        tracing_appender::rolling::daily(&config.logging.log_dir, &config.logging.file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(true)
                .with_target(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.as_str().into()),
        )
        .init();

    info!("Logging initialized");

    Ok(guard)
}
