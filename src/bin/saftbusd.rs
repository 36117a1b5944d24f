//! saftbus daemon - object broker for the local IPC bus
//!
//! Hosts the object registry and path index, dispatches calls from clients
//! and fans signals out to their signal channels.
//!
//! # Usage
//!
//! ```bash
//! saftbusd start                              # foreground
//! saftbusd --config /etc/saftbus.toml start -d --demo
//! saftbusd stop
//! saftbusd status
//! ```
//!
//! The PID and log files live in the configured `state_dir`, so `stop` and
//! `status` must be given the same `--config` as `start`.

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use saftbusd::broker::spawn_broker;
use saftbusd::config::BrokerConfig;
use saftbusd::demo::register_demo;
use saftbusd::pidfile::{self, PidFile};
use saftbusd::server::BusServer;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// saftbus daemon - local IPC object broker
#[derive(Parser, Debug)]
#[command(name = "saftbusd", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the broker
    Start {
        /// Fork to the background, logging to the state directory
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Register the demo counter at /demo/counter
        #[arg(long)]
        demo: bool,
    },
    /// Stop the running broker
    Stop,
    /// Show broker status
    Status,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // fail before forking so the error reaches the terminal
    let config =
        BrokerConfig::load(args.config.as_deref()).context("Failed to load broker configuration")?;
    let pid_file = config.pid_file();

    match args.command.unwrap_or(Command::Start {
        daemon: false,
        demo: false,
    }) {
        Command::Start { daemon, demo } => start(config, &pid_file, daemon, demo),
        Command::Stop => stop(&pid_file),
        Command::Status => Ok(status(&config, &pid_file)),
    }
}

fn start(config: BrokerConfig, pid_file: &PidFile, daemon: bool, demo: bool) -> Result<ExitCode> {
    if let Some(pid) = pid_file.running() {
        eprintln!("Broker is already running (PID {pid})");
        eprintln!("Use 'saftbusd stop' to stop it first.");
        return Ok(ExitCode::FAILURE);
    }

    if daemon {
        detach(&config.log_path())?;
    }
    pid_file.write_current()?;

    // the runtime is built after forking; its threads would not survive it
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")
        .and_then(|runtime| runtime.block_on(serve(config, demo)));

    pid_file.remove();
    result.map(|()| ExitCode::SUCCESS)
}

fn stop(pid_file: &PidFile) -> Result<ExitCode> {
    let Some(pid) = pid_file.running() else {
        println!("Broker is not running.");
        return Ok(ExitCode::SUCCESS);
    };

    println!("Stopping broker (PID {pid})...");
    pidfile::terminate(pid)?;
    if pidfile::wait_for_exit(pid, STOP_TIMEOUT) {
        println!("Broker stopped.");
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("Broker did not stop within {} seconds.", STOP_TIMEOUT.as_secs());
        Ok(ExitCode::FAILURE)
    }
}

fn status(config: &BrokerConfig, pid_file: &PidFile) -> ExitCode {
    let Some(pid) = pid_file.running() else {
        println!("Broker is not running.");
        return ExitCode::FAILURE;
    };

    println!("Broker is running (PID {pid})");
    if config.socket_path.exists() {
        println!("Socket: {}", config.socket_path.display());
    } else {
        println!("Socket {} is missing", config.socket_path.display());
    }
    ExitCode::SUCCESS
}

fn detach(log_path: &std::path::Path) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let stdout = File::create(log_path)
        .with_context(|| format!("Failed to create log file {}", log_path.display()))?;
    let stderr = stdout.try_clone().context("Failed to duplicate log file")?;

    daemonize::Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;
    Ok(())
}

async fn serve(config: BrokerConfig, demo: bool) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("saftbusd=info".parse()?)
                .add_directive("saftbus_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        max_clients = config.max_clients,
        track_flight_time = config.track_flight_time,
        "saftbus broker starting"
    );

    let cancel_token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel_token.clone()));

    let broker = spawn_broker(config.broker_options());
    if demo {
        let id = register_demo(&broker)
            .await
            .context("Failed to register demo counter")?;
        info!(object_id = %id, "Demo counter registered");
    }

    let server = BusServer::from_config(&config, broker, cancel_token);
    info!(socket = %server.socket_path().display(), "Serving");
    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("saftbus broker stopped");
    Ok(())
}

/// Cancels `token` on SIGTERM or SIGINT.
async fn cancel_on_signal(token: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Cannot install signal handlers, stop with SIGKILL");
                return;
            }
        };

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = name, "Shutting down");
    token.cancel();
}
