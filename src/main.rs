//! Burrow CLI - reverse TCP tunnels
//!
//! `burrow broker` runs the public side, `burrow agent` runs inside the
//! private network and exposes local services through a broker.

use anyhow::{Context, Result};
use burrow_agent::{Agent, AgentConfig, AgentError};
use burrow_connection::{Backoff, ReconnectError, ReconnectPolicy};
use burrow_control::{Broker, BrokerSettings};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Burrow - expose private TCP services through a public broker
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Burrow - expose private TCP services through a public broker")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(
    env!("GIT_TAG"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_TIME"), ")"
))]
struct Cli {
    /// Log filter, e.g. "info" or "burrow_control=debug" (RUST_LOG wins if set)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public broker
    #[command(long_about = r#"
Accept agent control connections and expose the public ports they register.

EXAMPLES:
  burrow broker --config broker.yaml
  BURROW_TOKEN=s3cret burrow broker --config broker.yaml --log-format json

ENVIRONMENT VARIABLES:
  BURROW_TOKEN   Shared secret, overrides the config file
  RUST_LOG       Log filter, overrides --log-level
    "#)]
    Broker {
        /// Broker configuration file (YAML)
        #[arg(long, short = 'c')]
        config: PathBuf,

        /// Shared secret agents must present
        #[arg(long, env = "BURROW_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Run an agent inside the private network
    #[command(long_about = r#"
Connect to a broker, register the configured tunnels and forward every public
connection to its private address.

EXAMPLES:
  burrow agent --config agent.yaml
  burrow agent --config agent.yaml --reconnect --max-attempts 10

ENVIRONMENT VARIABLES:
  BURROW_TOKEN   Shared secret, overrides the config file
  RUST_LOG       Log filter, overrides --log-level
    "#)]
    Agent {
        /// Agent configuration file (YAML)
        #[arg(long, short = 'c')]
        config: PathBuf,

        /// Shared secret presented to the broker
        #[arg(long, env = "BURROW_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Redial the broker with exponential backoff when the connection drops
        #[arg(long)]
        reconnect: bool,

        /// Give up after this many consecutive failed attempts (0 = never)
        #[arg(long, default_value = "0")]
        max_attempts: usize,
    },
}

/// Setup logging. RUST_LOG takes precedence over the configured level.
fn setup_logging(log_level: &str, format: LogFormat) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .init(),
    }

    Ok(())
}

/// Cancelled on the first Ctrl+C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        cancel.cancel();
    });
    token
}

async fn run_broker(settings: BrokerSettings, shutdown: CancellationToken) -> Result<()> {
    let mut broker = Broker::bind(settings)
        .await
        .context("Failed to start broker")?;
    broker.start();

    shutdown.cancelled().await;
    broker.stop().await;
    Ok(())
}

/// Run one agent, or keep replacing it while `reconnect` is set
async fn run_agent(
    config: AgentConfig,
    reconnect: bool,
    max_attempts: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut backoff = Backoff::new(ReconnectPolicy {
        max_attempts: (max_attempts > 0).then_some(max_attempts),
        ..ReconnectPolicy::default()
    });

    loop {
        let mut agent = Agent::new(config.clone()).context("Failed to create agent")?;

        let connected = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            connected = agent.connect() => connected,
        };

        let failure = match connected {
            Ok(()) => {
                backoff.reset();
                for tunnel in agent.registered_tunnels() {
                    info!(
                        "Tunnel '{}': public port {} -> {}",
                        tunnel.name, tunnel.public_port, tunnel.private_address
                    );
                }

                let result = tokio::select! {
                    _ = shutdown.cancelled() => Ok(()),
                    result = agent.run() => result,
                };
                agent.stop().await;

                match result {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                }
            }
            // Retrying with the same secret cannot succeed
            Err(e @ AgentError::AuthRejected(_)) => return Err(e.into()),
            Err(e) => e,
        };

        if !reconnect {
            return Err(failure.into());
        }
        error!("Agent error: {:#}", anyhow::Error::from(failure));

        match backoff.wait(&shutdown).await {
            Ok(()) => warn!("Reconnecting (attempt {})", backoff.attempt()),
            Err(ReconnectError::Cancelled) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Broker { config, token } => {
            let settings = BrokerSettings::load(&config, token)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            let log_level = cli.log_level.unwrap_or_else(|| settings.log_level.clone());
            setup_logging(&log_level, cli.log_format)?;

            info!("Burrow broker {} starting...", env!("GIT_TAG"));
            run_broker(settings, shutdown_on_ctrl_c()).await?;
            info!("Burrow broker stopped");
        }
        Commands::Agent {
            config,
            token,
            reconnect,
            max_attempts,
        } => {
            let agent_config = AgentConfig::load(&config, token)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            let log_level = cli
                .log_level
                .unwrap_or_else(|| agent_config.log_level.clone());
            setup_logging(&log_level, cli.log_format)?;

            info!(
                "Burrow agent {} starting (client id {}, broker {})",
                env!("GIT_TAG"),
                agent_config.client_id,
                agent_config.server_addr
            );
            let shutdown = shutdown_on_ctrl_c();
            if let Err(e) = run_agent(agent_config, reconnect, max_attempts, shutdown).await {
                error!("Agent stopped: {:#}", e);
                return Err(e);
            }
            info!("Burrow agent stopped");
        }
    }

    Ok(())
}
