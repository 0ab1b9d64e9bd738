#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    dead_code
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use clawbridge::bridge::{ExplainCoordinator, ExplainRequest, PollSettings};
use clawbridge::{channels, config, gateway};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

/// `ClawBridge` - request/response bridge over a shared OpenClaw chat session.
#[derive(Parser, Debug)]
#[command(name = "clawbridge")]
#[command(version)]
#[command(about = "Localhost explain bridge on top of an OpenClaw chat session.", long_about = None)]
struct Cli {
    /// Config directory (defaults to ~/.clawbridge)
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP bridge
    #[command(long_about = "\
Start the HTTP bridge.

Serves /health, /status, /oauth/start, /explain and /abort on localhost. \
Host and port default to the [gateway] section of config.toml.

Examples:
  clawbridge gateway
  clawbridge gateway --port 18800
  PORT=18800 clawbridge gateway")]
    Gateway {
        /// Port to listen on; defaults to config gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to config gateway.host
        #[arg(long)]
        host: Option<String>,
    },

    /// Run one explain call and print the items as JSON
    Explain {
        /// Text to explain
        text: String,

        /// Session key (defaults to bridge.default_session_key)
        #[arg(short, long)]
        session: Option<String>,

        /// Language for meanings and explanations
        #[arg(short, long)]
        language: Option<String>,

        /// Request id to correlate on (generated when omitted)
        #[arg(long)]
        request_id: Option<String>,
    },

    /// Print the resolved configuration
    Status,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Dump the full configuration JSON Schema to stdout
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_dir = match cli.config_dir.as_deref() {
        Some(dir) if dir.trim().is_empty() => bail!("--config-dir cannot be empty"),
        Some(dir) => Some(PathBuf::from(dir.trim())),
        None => None,
    };

    // Schema output must stay clean stdout and needs no config.
    if let Commands::Config {
        config_command: ConfigCommands::Schema,
    } = &cli.command
    {
        let schema = schemars::schema_for!(config::Config);
        println!(
            "{}",
            serde_json::to_string_pretty(&schema).context("failed to serialize JSON Schema")?
        );
        return Ok(());
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = config::Config::load_or_init(config_dir.as_deref()).await?;

    match cli.command {
        Commands::Gateway { port, host } => {
            let port = port.unwrap_or(config.gateway.port);
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            gateway::run_gateway(&host, port, config).await
        }

        Commands::Explain {
            text,
            session,
            language,
            request_id,
        } => {
            let coordinator = ExplainCoordinator::new(
                channels::create_channel(&config.bridge),
                PollSettings::from(&config.bridge),
            );
            let request = ExplainRequest {
                text,
                session_key: session,
                user_language: language,
                request_id,
                deadline: None,
            };

            let outcome = tokio::select! {
                outcome = coordinator.explain(request) => outcome?,
                _ = tokio::signal::ctrl_c() => {
                    bail!("interrupted");
                }
            };
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }

        Commands::Status => {
            println!("Config:        {}", config.config_path.display());
            println!(
                "Gateway:       http://{}:{}",
                config.gateway.host, config.gateway.port
            );
            println!("OpenClaw bin:  {}", config.bridge.openclaw_bin);
            println!("Session key:   {}", config.bridge.default_session_key);
            println!("Language:      {}", config.bridge.default_language);
            println!(
                "Polling:       {} x {}ms, history window {}",
                config.bridge.poll_attempts,
                config.bridge.poll_interval_ms,
                config.bridge.history_limit
            );
            println!("Deadline:      {}s", config.bridge.request_timeout_secs);
            Ok(())
        }

        Commands::Config { .. } => Ok(()),
    }
}
