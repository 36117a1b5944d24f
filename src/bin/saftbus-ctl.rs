//! saftbus-ctl - inspect and tune a running saftbus broker
//!
//! # Usage
//!
//! ```text
//! saftbus-ctl objects                     # object path -> interfaces
//! saftbus-ctl introspect PATH INTERFACE   # introspection document
//! saftbus-ctl dump [--json]               # registry, clients, subscriptions
//! saftbus-ctl logging on|off              # per-call logging in the broker
//! saftbus-ctl flight-time on|off          # signal flight time tracking
//! saftbus-ctl histogram                   # flight time histogram
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use saftbus_client::{ClientConfig, Connection, FlightTimeHistogram, StateDump};

// ============================================================================
// CLI Arguments
// ============================================================================

/// saftbus-ctl - diagnostics for the saftbus broker
#[derive(Parser, Debug)]
#[command(name = "saftbus-ctl", version, about)]
struct Args {
    /// Broker socket (defaults to $SAFTBUS_SOCKET_PATH or /tmp/saftbus.sock)
    #[arg(short, long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Give up on a request after this many milliseconds
    #[arg(long, global = true, default_value_t = 5000, value_name = "MS")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List object paths and the interfaces registered under them
    Objects,
    /// Print the introspection document of an object
    Introspect {
        path: String,
        interface: String,
    },
    /// Dump the broker's internal state
    Dump {
        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Switch per-call logging in the broker
    Logging {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Switch signal flight time tracking
    FlightTime {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Print the signal flight time histogram
    Histogram {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn enabled(self) -> bool {
        matches!(self, Self::On)
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("saftbus_client=warn".parse()?),
        )
        .init();

    let mut config = ClientConfig::from_env();
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    config.call_timeout = Some(Duration::from_millis(args.timeout_ms));

    let connection = Connection::connect(&config)
        .await
        .with_context(|| format!("Is saftbusd running at {}?", config.socket_path.display()))?;

    match args.command {
        Command::Objects => {
            let listing = connection.list_objects().await?;
            if listing.is_empty() {
                println!("No objects registered.");
            }
            for (path, interfaces) in listing {
                println!("{path}");
                for interface in interfaces {
                    println!("  {interface}");
                }
            }
        }
        Command::Introspect { path, interface } => {
            let document = connection
                .introspect(&path, &interface)
                .await
                .with_context(|| format!("Failed to introspect {interface} at {path}"))?;
            print!("{document}");
        }
        Command::Dump { json } => {
            let dump = connection.dump_state().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&dump)?);
            } else {
                print_dump(&dump);
            }
        }
        Command::Logging { state } => {
            connection.set_logging(state.enabled()).await?;
            println!("Call logging {}.", describe(state));
        }
        Command::FlightTime { state } => {
            connection.set_flight_time_tracking(state.enabled()).await?;
            println!("Flight time tracking {}.", describe(state));
        }
        Command::Histogram { json } => {
            let histogram = connection.flight_time_histogram().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&histogram)?);
            } else {
                print_histogram(&histogram);
            }
        }
    }

    Ok(())
}

fn describe(state: Toggle) -> &'static str {
    match state {
        Toggle::On => "enabled",
        Toggle::Off => "disabled",
    }
}

// ============================================================================
// Output
// ============================================================================

fn print_dump(dump: &StateDump) {
    println!(
        "logging: {}  flight time tracking: {}",
        dump.logging, dump.track_flight_time
    );

    println!("\nobjects ({}):", dump.objects.len());
    for object in &dump.objects {
        let marker = if object.reachable { "" } else { "  (replaced)" };
        println!(
            "  {:>4}  {} {}{marker}",
            object.id.to_string(),
            object.path,
            object.interface
        );
    }

    println!("\nclients ({}):", dump.clients.len());
    for client in &dump.clients {
        println!(
            "  {:>4}  {} signal channel(s), {} subscription(s)",
            client.id.to_string(),
            client.signal_channels.len(),
            client.subscriptions
        );
        for channel in &client.signal_channels {
            println!(
                "        proxy {} -> {} {}",
                channel.proxy_id, channel.path, channel.interface
            );
        }
    }

    println!("\nsubscriptions ({}):", dump.subscriptions.len());
    for sub in &dump.subscriptions {
        println!(
            "  {:>4}  client {} watched by object {} ({} {})",
            sub.id.to_string(),
            sub.owner,
            sub.object_id,
            sub.path,
            sub.interface
        );
    }
}

fn print_histogram(histogram: &FlightTimeHistogram) {
    let total = histogram.total();
    if total == 0 {
        println!("No flight time samples recorded.");
        return;
    }

    let widest = histogram.buckets.values().copied().max().unwrap_or(1).max(1);
    for (&bucket, &count) in &histogram.buckets {
        let upper = 1u128 << bucket;
        let bar_len = usize::try_from(count.saturating_mul(40) / widest).unwrap_or(40);
        println!("  < {upper:>10} us  {count:>8}  {}", "#".repeat(bar_len));
    }
    println!("  total: {total}");
}
