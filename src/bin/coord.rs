//! Coordinator binary

use clap::{Parser, Subcommand};
use helmsman::{common::MemberConfig, Config, Coordinator};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "helmsman-coord")]
#[command(about = "helmsman leader election and failover coordinator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordinator server
    Serve {
        /// Configuration file (TOML)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Node ID, overrides the configuration file
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP, overrides the configuration file
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Extra leader-eligible members as id=host:port (comma-separated)
        #[arg(long, value_delimiter = ',')]
        members: Vec<String>,
    },

    /// Print the effective configuration and exit
    Config {
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            id,
            bind,
            members,
        } => {
            // Load config from file, then override with CLI arguments
            let mut config = Config::load(config.as_deref())?;
            init_tracing(&config.log_level);

            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.coordinator.bind_addr = bind;
            }
            for member in members {
                config.members.push(parse_member(&member)?);
            }
            config.validate()?;

            Coordinator::new(config).serve().await?;
        }

        Commands::Config { config } => {
            let config = Config::load(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn parse_member(s: &str) -> anyhow::Result<MemberConfig> {
    let (id, address) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("invalid member '{}', expected id=host:port", s))?;
    Ok(MemberConfig {
        id: id.trim().to_string(),
        address: address.trim().to_string(),
        role: helmsman::common::MemberRole::LeaderEligible,
    })
}
