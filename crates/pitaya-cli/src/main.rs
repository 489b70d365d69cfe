use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use pitaya_core::{
    Adapters, DirectiveOutcome, PriorityReport, PriorityState, RegistryOutcome,
    RestrictionConfig, RestrictionResult, VERSION,
};
use pitaya_daemon::{CommandSurface, Config, OrchestratorSettings};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pitaya")]
#[command(author = "Pitaya Team")]
#[command(version = VERSION)]
#[command(about = "Keep anti-cheat agents off your game's cores - CLI", long_about = None)]
struct Cli {
    /// Print structured JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (targets, timeouts)
    #[arg(short, long, global = true, default_value = "pitaya.toml")]
    config: PathBuf,

    /// Show engine logs on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show CPU, OS and privilege information
    Info,

    /// Apply resource directives to the ACE agent processes
    Restrict(RestrictArgs),

    /// CPU and memory usage of watched processes
    Perf,

    /// Launch at login
    Autostart {
        #[command(subcommand)]
        action: AutostartAction,
    },

    /// Persistent priority overrides (Image File Execution Options)
    Priority {
        #[command(subcommand)]
        action: PriorityCommand,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
struct RestrictArgs {
    /// Pin to the last logical core
    #[arg(long)]
    affinity: bool,

    /// Idle scheduling priority
    #[arg(long)]
    priority: bool,

    /// Efficiency mode (EcoQoS, Windows 11)
    #[arg(long)]
    efficiency: bool,

    /// Very low I/O priority
    #[arg(long)]
    io: bool,

    /// Very low memory priority
    #[arg(long)]
    memory: bool,

    /// Every directive
    #[arg(long, conflicts_with_all = ["affinity", "priority", "efficiency", "io", "memory"])]
    all: bool,
}

impl RestrictArgs {
    fn to_config(&self) -> RestrictionConfig {
        if self.all {
            return RestrictionConfig::all();
        }
        RestrictionConfig {
            cpu_affinity: self.affinity,
            process_priority: self.priority,
            efficiency_mode: self.efficiency,
            io_priority: self.io,
            memory_priority: self.memory,
        }
    }
}

#[derive(Subcommand)]
enum AutostartAction {
    Enable,
    Disable,
    Status,
}

#[derive(Subcommand)]
enum PriorityCommand {
    /// Lower SGuard64.exe and SGuardSvc64.exe
    LowerAce,
    ResetAce,
    /// Show every known override
    Check,
    /// Raise Delta Force
    RaiseDelta,
    ResetDelta,
    /// Raise VALORANT
    RaiseValorant,
    ResetValorant,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "debug".into()),
            )
            .init();
    }

    let command = cli.command.unwrap_or(Commands::Info);
    if let Commands::Completions { shell } = command {
        clap_complete::generate(shell, &mut Cli::command(), "pitaya", &mut std::io::stdout());
        return Ok(());
    }

    let surface = build_surface(&cli.config)?;
    let json = cli.json;

    match command {
        Commands::Info => {
            let info = surface.get_system_info();
            if json {
                return print_json(&info);
            }
            println!("{}", "=== Pitaya System Info ===".green().bold());
            println!("  CPU:        {}", info.cpu_model);
            println!("  Cores:      {} (target core {})", info.cpu_logical_cores, info.target_core());
            println!("  OS:         {} {}", info.os_name, info.os_version);
            println!(
                "  Memory:     {:.1} GB total, {:.1} GB available",
                info.total_memory_gb, info.available_memory_gb
            );
            println!(
                "  EcoQoS:     {}",
                if info.efficiency_mode_supported { "available".green() } else { "unavailable".yellow() }
            );
            if info.is_admin {
                println!("  {}", "✅ Running as administrator".green());
            } else {
                println!("  {}", "⚠️  Not elevated: most directives will be skipped".yellow());
            }
        }
        Commands::Restrict(args) => {
            let config = args.to_config();
            let spinner = spinner("Restricting target processes...", json);
            let result = surface.restrict_processes(config).await;
            spinner.finish_and_clear();
            let result = result?;
            if json {
                return print_json(&result);
            }
            print_restriction(&result);
        }
        Commands::Perf => {
            let spinner = spinner("Sampling watched processes...", json);
            let samples = surface.get_process_performance().await;
            spinner.finish_and_clear();
            let samples = samples?;
            if json {
                return print_json(&samples);
            }
            println!("{}", "=== Watched Processes ===".green().bold());
            if samples.is_empty() {
                println!("{}", "No watched process is running".yellow());
            }
            for sample in samples {
                let cpu = format!("{:5.1}%", sample.cpu_usage);
                let cpu = if sample.cpu_usage > 10.0 { cpu.red() } else { cpu.normal() };
                println!(
                    "  {} - PID: {}, CPU: {}, Memory: {:.1} MB",
                    sample.name, sample.pid, cpu, sample.memory_mb
                );
            }
        }
        Commands::Autostart { action } => {
            let enabled = match action {
                AutostartAction::Enable => {
                    surface.enable_autostart().await?;
                    true
                }
                AutostartAction::Disable => {
                    surface.disable_autostart().await?;
                    false
                }
                AutostartAction::Status => surface.check_autostart().await?,
            };
            if json {
                return print_json(&serde_json::json!({ "enabled": enabled }));
            }
            if enabled {
                println!("{}", "✅ Autostart enabled".green());
            } else {
                println!("{}", "Autostart disabled".yellow());
            }
        }
        Commands::Priority { action } => {
            let report = match action {
                PriorityCommand::LowerAce => surface.lower_ace_priority().await,
                PriorityCommand::ResetAce => surface.reset_ace_priority().await,
                PriorityCommand::Check => surface.check_registry_priority().await,
                PriorityCommand::RaiseDelta => surface.raise_delta_priority().await,
                PriorityCommand::ResetDelta => surface.reset_delta_priority().await,
                PriorityCommand::RaiseValorant => surface.modify_valorant_registry_priority().await,
                PriorityCommand::ResetValorant => surface.reset_valorant_priority().await,
            };
            if json {
                print_json(&report)?;
            } else {
                print_priority(&report);
            }
            if !report.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn build_surface(config_path: &Path) -> Result<CommandSurface> {
    let config = if config_path.exists() {
        Config::load_from_file(config_path)
    } else {
        Config::from_env()
    }
    .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration validation failed: {}", e))?;

    let settings = OrchestratorSettings::from_config(&config)?;
    Ok(CommandSurface::new(Adapters::native(), settings)?)
}

fn spinner(message: &str, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_restriction(result: &RestrictionResult) {
    println!("{}", "=== Pitaya Restriction ===".green().bold());
    println!("Target core: {}", result.target_core);

    for target in &result.targets {
        if !target.found {
            println!("\n{}", format!("⚠️  {} not found", target.name).yellow());
            continue;
        }
        let header = format!("{}: {} instance(s)", target.name, target.instances.len());
        if target.restricted {
            println!("\n{}", format!("✅ {}", header).green());
        } else {
            println!("\n{}", format!("⚠️  {}", header).yellow());
        }
        for instance in &target.instances {
            println!("  PID {}:", instance.pid);
            for (kind, outcome) in &instance.outcomes {
                let text = outcome.to_string();
                let text = match outcome {
                    DirectiveOutcome::Applied => text.green(),
                    DirectiveOutcome::Skipped { .. } => text.yellow(),
                    DirectiveOutcome::Failed { .. } => text.red(),
                };
                println!("    {}: {}", kind.label(), text);
            }
        }
    }
    println!();
}

fn print_priority(report: &PriorityReport) {
    println!("{}", "=== Pitaya Priority Overrides ===".green().bold());
    for entry in &report.entries {
        match &entry.outcome {
            RegistryOutcome::Ok { state } => {
                let text = state.to_string();
                let text = match state {
                    PriorityState::Default => text.normal(),
                    PriorityState::Overridden(_) => text.green(),
                    PriorityState::Unrecognized(_) => text.yellow(),
                };
                println!("  {}: {}", entry.executable, text);
            }
            RegistryOutcome::Failed { kind, reason } => {
                println!(
                    "  {}",
                    format!("❌ {}: {} ({})", entry.executable, kind.label(), reason).red()
                );
            }
        }
    }
}
