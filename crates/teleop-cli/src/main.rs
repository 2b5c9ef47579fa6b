//! `teleop` – Teleoperation Core command line.
//!
//! 1. Loads `~/.teleop/config.toml`, writing the defaults on first run.
//! 2. `teleop serve` (the default) opens the store and runs the WebSocket
//!    gateway until **Ctrl-C**, then releases every open session.
//! 3. `teleop simulate <robot_id>` drives one full control session against an
//!    in-process robot over the loopback transport.

mod config;
mod simulate;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use teleop_gateway::{Dispatcher, GatewayServer};
use teleop_middleware::{BusNotifier, EventBus, Notifier};
use teleop_runtime::{LoopExit, init_tracing};
use teleop_store::{Database, Stores, SystemClock};
use teleop_types::{Notice, NoticeLevel};

#[derive(Debug, Parser)]
#[command(name = "teleop", about = "Robot teleoperation core", version)]
struct Cli {
    // Defaults to `serve`.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Command {
    /// Run the WebSocket gateway until Ctrl-C.
    Serve,
    /// Run one control session against an in-process robot.
    Simulate {
        robot_id: String,
        /// How long to keep the session open.
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Tracing starts before the runtime is built. Keep the guard alive so
    // buffered spans are flushed on exit.
    let _tracing = init_tracing("teleop");

    let runtime = match build_runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}: failed to start runtime: {}", "error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(cli.command.unwrap_or(Command::Serve))) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

async fn run(command: Command) -> Result<(), String> {
    print_banner();
    let cfg = load_config();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        shutdown_tx.send_replace(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; sessions will not be released on Ctrl-C");
    }

    match command {
        Command::Simulate { robot_id, seconds } => {
            run_simulation(&cfg, &robot_id, Duration::from_secs(seconds), shutdown_rx).await
        }
        Command::Serve => serve(&cfg, shutdown_rx).await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// serve
// ─────────────────────────────────────────────────────────────────────────────

async fn serve(cfg: &config::Config, mut shutdown: watch::Receiver<bool>) -> Result<(), String> {
    let bus = Arc::new(EventBus::default());
    let db = if cfg.database_path.is_empty() {
        Database::open_in_memory()
    } else {
        if let Some(parent) = std::path::Path::new(&cfg.database_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create database directory: {}", e))?;
        }
        Database::open(&cfg.database_path)
    }
    .map_err(|e| e.to_string())?;
    let stores = Stores::with_parts(
        db,
        Arc::new(SystemClock),
        cfg.offline_timeout(),
        Some(Arc::clone(&bus)),
    );

    let dispatcher = Dispatcher::with_telemetry_rate(stores.clone(), cfg.telemetry_rate_per_sec);
    let server = GatewayServer::new(dispatcher, Arc::clone(&bus)).with_port(cfg.gateway_port);
    let listener = server.bind().await.map_err(|e| e.to_string())?;
    println!(
        "  Gateway listening on {}",
        format!("ws://0.0.0.0:{}", server.port()).bold()
    );

    tokio::select! {
        _ = server.serve(listener) => {}
        _ = shutdown.wait_for(|stop| *stop) => {}
    }

    release_sessions(&stores, &bus);
    Ok(())
}

/// Close every open session and tell connected clients the core is going
/// away.
fn release_sessions(stores: &Stores, bus: &Arc<EventBus>) {
    match stores.sessions.disconnect_all("server_shutdown", "system") {
        Ok(closed) => {
            info!(count = closed.len(), "sessions released on shutdown");
            println!("{}", format!("  ✓ Released {} session(s).", closed.len()).green());
        }
        Err(e) => warn!(error = %e, "failed to release sessions on shutdown"),
    }
    BusNotifier::new(Arc::clone(bus)).notify(Notice::new(
        NoticeLevel::Warning,
        None,
        "Teleoperation core shutting down",
    ));
    println!("{}", "  ✓ Exiting teleop.".green());
}

// ─────────────────────────────────────────────────────────────────────────────
// simulate
// ─────────────────────────────────────────────────────────────────────────────

async fn run_simulation(
    cfg: &config::Config,
    robot_id: &str,
    duration: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    println!(
        "  Simulating robot {} for {}s …",
        robot_id.bold(),
        duration.as_secs()
    );
    let report = simulate::run(cfg, robot_id, duration, shutdown).await?;

    let exit = match report.exit {
        LoopExit::Halted(status) => format!("halted ({status:?})"),
        other => format!("{other:?}"),
    };
    println!();
    println!("  {:<18} {}", "Robot".dimmed(), report.robot_id.bold());
    println!("  {:<18} {}", "Control loop".dimmed(), exit);
    println!("  {:<18} {}", "Frames sent".dimmed(), report.stats.sent);
    println!("  {:<18} {}", "Frames dropped".dimmed(), report.stats.dropped);
    println!("  {:<18} {}", "Frames received".dimmed(), report.frames_received);
    println!("  {:<18} {}", "Cameras".dimmed(), report.cameras);
    println!(
        "  {:<18} {}",
        "Liveness".dimmed(),
        if report.online { "online".green() } else { "offline".yellow() }
    );
    match report.final_status {
        Some(status) => println!("  {:<18} {:?}", "Final status".dimmed(), status),
        None => println!("  {:<18} {}", "Final status".dimmed(), "unknown".yellow()),
    }
    println!();
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

fn load_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"  __       __                "#.bold().cyan());
    println!("{}", r#" / /____  / /__ ___  ___     "#.bold().cyan());
    println!("{}", r#"/ __/ -_)/ / -_) _ \/ _ \    "#.bold().cyan());
    println!("{}", r#"\__/\__//_/\__/\___/ .__/    "#.bold().cyan());
    println!("{}", r#"                  /_/        "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "teleop".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Robot Teleoperation Core");
    println!();
}
