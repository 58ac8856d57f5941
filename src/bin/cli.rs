//! CLI for coordinator operations

use clap::{Args, Parser, Subcommand};
use helmsman::common::parse_duration;
use helmsman::coordinator::LivenessMonitor;
use helmsman::ops::{abdicate_and_wait, cleanup_volume, ControlClient};
use helmsman::{Config, RetryPolicy};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "helmsman")]
#[command(about = "helmsman coordinator CLI")]
#[command(version)]
struct Cli {
    /// Coordinator URL
    #[arg(long, default_value = "http://localhost:8080")]
    coordinator: String,

    /// Per-request timeout (e.g. "5s", "500ms")
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    request_timeout: Duration,

    /// Configuration file providing the default wait policies
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the configured retry policy of a waiting command
#[derive(Args, Clone)]
struct PolicyArgs {
    /// Maximum attempts
    #[arg(long)]
    attempts: Option<usize>,

    /// Delay between attempts (e.g. "1s")
    #[arg(long, value_parser = parse_duration)]
    interval: Option<Duration>,

    /// Back off exponentially up to this delay
    #[arg(long, value_parser = parse_duration)]
    max_interval: Option<Duration>,

    /// Overall deadline (e.g. "2m")
    #[arg(long, value_parser = parse_duration)]
    deadline: Option<Duration>,
}

impl PolicyArgs {
    fn policy(&self, configured: &RetryPolicy) -> RetryPolicy {
        configured.clone().overridden(
            self.attempts,
            self.interval,
            self.max_interval,
            self.deadline,
        )
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show the current leader
    Leader,

    /// Show election state and quorum
    Status,

    /// Make the leader step down and wait for a new one
    Abdicate {
        /// Only abdicate if this member is the leader
        #[arg(long)]
        expected: Option<String>,

        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// Wait until the service reports a leader
    WaitUp {
        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// External volumes
    Volumes {
        #[command(subcommand)]
        command: VolumeCommands,
    },

    /// Workloads
    Apps {
        #[command(subcommand)]
        command: AppCommands,
    },
}

#[derive(Subcommand)]
enum VolumeCommands {
    List,

    Detach { name: String },

    /// Destroy a detached volume, retrying while the device is released
    Destroy {
        name: String,

        #[command(flatten)]
        policy: PolicyArgs,
    },
}

#[derive(Subcommand)]
enum AppCommands {
    List,

    Scale { id: String, instances: usize },

    Tasks { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let timeout = cli.request_timeout;
    let client = ControlClient::new(&cli.coordinator, timeout)?;

    match cli.command {
        Commands::Leader => match client.leader().await? {
            Some(info) => println!("{}", info.leader),
            None => println!("There is no leader"),
        },

        Commands::Status => {
            let status = client.leader_status().await?;
            println!("{}", status);
        }

        Commands::Abdicate { expected, policy } => {
            let monitor = LivenessMonitor::http(&cli.coordinator, timeout)?;
            let policy = policy.policy(&config.liveness);
            let report = abdicate_and_wait(&client, &monitor, expected.as_deref(), &policy).await?;
            println!("Leader changed:");
            println!("  Previous: {}", report.previous.leader);
            println!("  Current: {}", report.current.leader);
            println!("  Elapsed: {} ms", report.elapsed_ms);
        }

        Commands::WaitUp { policy } => {
            let monitor = LivenessMonitor::http(&cli.coordinator, timeout)?;
            let info = monitor.wait_until_up(&policy.policy(&config.liveness)).await?;
            println!("{}", info.leader);
        }

        Commands::Volumes { command } => match command {
            VolumeCommands::List => {
                for volume in client.volumes().await? {
                    println!(
                        "{}\t{}\t{}\t{}",
                        volume.name,
                        volume.state,
                        volume.owner.as_deref().unwrap_or("-"),
                        volume.storage_id
                    );
                }
            }
            VolumeCommands::Detach { name } => {
                let volume = client.detach_volume(&name).await?;
                println!("{} {}", volume.name, volume.state);
            }
            VolumeCommands::Destroy { name, policy } => {
                let policy = policy.policy(&config.volumes.destroy_retry);
                cleanup_volume(&client, &name, &policy).await?;
                println!("{} removed", name);
            }
        },

        Commands::Apps { command } => match command {
            AppCommands::List => {
                for app in client.apps().await? {
                    println!(
                        "{}\t{} instances\t{}",
                        app.id,
                        app.instances,
                        app.volume.as_deref().unwrap_or("-")
                    );
                }
            }
            AppCommands::Scale { id, instances } => {
                let app = client.scale(&id, instances).await?;
                println!("{} scaled to {}", app.id, app.instances);
            }
            AppCommands::Tasks { id } => {
                for task in client.tasks(&id).await? {
                    println!("{}\t{}", task.id, task.host);
                }
            }
        },
    }

    Ok(())
}
