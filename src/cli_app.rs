//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use app_watchdog::core::config::Config;
use app_watchdog::core::errors::WatchdogError;
use app_watchdog::daemon::loop_main::{DaemonArgs as DaemonOptions, WatchdogDaemon};
use app_watchdog::daemon::self_monitor::{DaemonState, SelfMonitor, is_stale};
use app_watchdog::liveness::client::LivenessClient;
use app_watchdog::supervisor::lifecycle::ProcessPhase;

/// Application watchdog: keeps supervised programs running, healthy and unique.
#[derive(Debug, Parser)]
#[command(
    name = "appwd",
    author,
    version,
    about = "Application Watchdog - Process Supervisor",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the watchdog daemon in the foreground.
    Daemon(DaemonArgs),
    /// Validate the configuration and list supervised applications.
    CheckConfig,
    /// Show the running daemon's status.
    Status,
    /// Send one heartbeat for a process.
    Heartbeat(HeartbeatArgs),
    /// Ask the watchdog to kill a process.
    RequestKill(RequestKillArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct DaemonArgs {
    /// Optional pidfile path for non-service usage.
    #[arg(long, value_name = "PATH")]
    pidfile: Option<PathBuf>,
    /// Systemd watchdog timeout in seconds (0 disables).
    #[arg(long, default_value_t = 0, value_name = "SECONDS")]
    watchdog_sec: u64,
}

#[derive(Debug, Clone, Args)]
struct HeartbeatArgs {
    /// Process id the heartbeat is sent for.
    #[arg(long)]
    pid: u32,
    /// Liveness socket (defaults to the configured one).
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct RequestKillArgs {
    /// Process id to kill.
    #[arg(long)]
    pid: u32,
    /// Do not kill before this many seconds have passed.
    #[arg(long, value_name = "SECONDS")]
    delay: Option<u64>,
    /// Liveness socket (defaults to the configured one).
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,
    /// Close the connection right after sending.
    ///
    /// The watchdog forgets a request when its connection closes, so by default
    /// the connection is held until the delay plus two ticks have passed.
    #[arg(long)]
    no_wait: bool,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

impl From<WatchdogError> for CliError {
    fn from(err: WatchdogError) -> Self {
        match err {
            WatchdogError::InvalidConfig { .. }
            | WatchdogError::MissingConfig { .. }
            | WatchdogError::ConfigParse { .. } => Self::User(err.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }
}

pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Daemon(args) => run_daemon(cli, args),
        Command::CheckConfig => run_check_config(cli),
        Command::Status => run_status(cli),
        Command::Heartbeat(args) => run_heartbeat(cli, args),
        Command::RequestKill(args) => run_request_kill(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn run_daemon(cli: &Cli, args: &DaemonArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let options = DaemonOptions {
        pidfile: args.pidfile.clone(),
        watchdog_sec: args.watchdog_sec,
    };
    let mut daemon = WatchdogDaemon::init(config, &options)?;
    daemon.run()?;
    Ok(())
}

fn run_check_config(cli: &Cli) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let hash = config.stable_hash()?;

    match output_mode(cli) {
        OutputMode::Human => {
            println!("{} {}", "config ok:".green(), config.paths.config_file.display());
            println!("  hash: {hash}");
            println!("  tick interval: {} ms", config.scheduler.tick_interval_ms);
            if config.liveness.enabled {
                println!("  liveness socket: {}", config.liveness.socket_path.display());
            } else {
                println!("  liveness socket: disabled");
            }
            println!("  applications: {}", config.applications.len());
            for app in &config.applications {
                let state = if app.active {
                    "active".green()
                } else {
                    "inactive".yellow()
                };
                println!(
                    "    {:<24} {:<8} {}..{} instances  {}",
                    app.application_name,
                    state,
                    app.min_processes,
                    app.max_processes,
                    app.application_path.display()
                );
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "check-config",
                "status": "ok",
                "config_file": config.paths.config_file.to_string_lossy(),
                "hash": hash,
                "tick_interval_ms": config.scheduler.tick_interval_ms,
                "liveness": {
                    "enabled": config.liveness.enabled,
                    "socket_path": config.liveness.socket_path.to_string_lossy(),
                },
                "applications": serde_json::to_value(&config.applications)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_status(cli: &Cli) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let state = SelfMonitor::read_state(&config.paths.state_file).ok();
    let running = state.as_ref().is_some_and(|state| !is_stale(state));
    match output_mode(cli) {
        OutputMode::Human => print_status_human(&config, state.as_ref(), running),
        OutputMode::Json => {
            let payload = json!({
                "command": "status",
                "daemon_running": running,
                "state_file": config.paths.state_file.to_string_lossy(),
                "state": state.as_ref().map(serde_json::to_value).transpose()?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn print_status_human(config: &Config, state: Option<&DaemonState>, running: bool) {
    println!("Application Watchdog v{}", env!("CARGO_PKG_VERSION"));
    println!("  Config: {}", config.paths.config_file.display());
    let Some(state) = state else {
        println!("  Daemon: {}", "not running".red());
        return;
    };
    if running {
        println!(
            "  Daemon: {} (pid {}, up {}s, {})",
            "running".green(),
            state.pid,
            state.uptime_seconds,
            state.scheduler
        );
    } else {
        println!(
            "  Daemon: {} (last update {})",
            "stale".yellow(),
            state.last_updated
        );
    }
    println!("  Liveness clients: {}", state.liveness_clients);

    println!("\nApplications:");
    println!("  {:<24}  {:<8}  {:>8}  {:<10}  {:<9}", "Name", "Active", "PID", "Phase", "Heartbeat");
    println!("  {}", "-".repeat(67));
    for app in &state.applications {
        let active = if app.active { "yes" } else { "no" };
        if app.processes.is_empty() {
            println!("  {:<24}  {active:<8}  {:>8}  {:<10}  {:<9}", app.name, "-", "-", "-");
        }
        for process in &app.processes {
            let phase = match process.phase {
                ProcessPhase::Running => "running".green(),
                ProcessPhase::Starting => "starting".yellow(),
                ProcessPhase::Killed => "killed".red(),
                ProcessPhase::Exited => "exited".red(),
                ProcessPhase::Idle => "idle".normal(),
            };
            let heartbeat = if process.heartbeat_connected { "connected" } else { "-" };
            println!(
                "  {:<24}  {active:<8}  {:>8}  {:<10}  {heartbeat:<9}",
                app.name, process.pid, phase
            );
        }
    }

    let c = &state.counters;
    println!(
        "\nCounters: {} started, {} exited, {} killed, {} launch failures, {} check failures",
        c.processes_started, c.processes_exited, c.processes_killed, c.launch_failures, c.check_failures
    );
    if c.dropped_log_events > 0 || c.dropped_events > 0 {
        println!(
            "  {} {} log events and {} watchdog events dropped",
            "warning:".yellow(),
            c.dropped_log_events,
            c.dropped_events
        );
    }
}

fn run_heartbeat(cli: &Cli, args: &HeartbeatArgs) -> Result<(), CliError> {
    let socket = resolve_socket(cli, args.socket.clone())?;
    let mut client = LivenessClient::connect(&socket)?;
    client.heartbeat(args.pid)?;
    emit_sent(cli, "heartbeat", args.pid, None, &socket)
}

fn run_request_kill(cli: &Cli, args: &RequestKillArgs) -> Result<(), CliError> {
    if args.pid == 0 {
        return Err(CliError::User("--pid must be greater than 0".to_string()));
    }
    let socket = resolve_socket(cli, args.socket.clone())?;
    let mut client = LivenessClient::connect(&socket)?;
    client.request_kill(args.pid, args.delay.map(Duration::from_secs))?;
    emit_sent(cli, "request-kill", args.pid, args.delay, &socket)?;
    if !args.no_wait {
        std::thread::sleep(hold_duration(cli, args.delay));
    }
    Ok(())
}

fn hold_duration(cli: &Cli, delay: Option<u64>) -> Duration {
    let tick = Config::load(cli.config.as_deref())
        .map_or(Duration::from_secs(1), |config| config.tick_interval());
    delay.map_or(Duration::ZERO, Duration::from_secs) + tick * 2
}

fn resolve_socket(cli: &Cli, explicit: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    let config = Config::load(cli.config.as_deref())?;
    Ok(config.liveness.socket_path)
}

fn emit_sent(
    cli: &Cli,
    command: &str,
    pid: u32,
    delay: Option<u64>,
    socket: &std::path::Path,
) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Human => {
            let delay = delay.map(|secs| format!(" (delay {secs}s)")).unwrap_or_default();
            println!("{command} sent for pid {pid}{delay} via {}", socket.display());
        }
        OutputMode::Json => {
            let payload = json!({
                "command": command,
                "status": "sent",
                "pid": pid,
                "delay_secs": delay,
                "socket": socket.to_string_lossy(),
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("WD_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
