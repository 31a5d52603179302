use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use patchpilot::config::Settings;
use patchpilot::sandbox::{DockerSandbox, SandboxDriver};
use patchpilot::server;

#[derive(Parser)]
#[command(name = "patchpilot")]
#[command(version, about = "Autonomous pull-request service")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to patchpilot.toml. Defaults to ./patchpilot.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP service
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind (overrides the config file)
        #[arg(long)]
        host: Option<String>,
    },
    /// Check that the container runtime is reachable
    Probe,
    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port, host } => {
            if let Some(port) = port {
                settings.server.port = port;
            }
            if let Some(host) = host {
                settings.server.host = host;
            }
            server::start_server(settings).await
        }
        Commands::Probe => {
            let sandbox = DockerSandbox::connect(settings.policy.clone())?;
            sandbox.ping().await?;
            println!("container runtime reachable");
            Ok(())
        }
        Commands::Config => {
            let mut redacted = settings;
            redacted.llm.api_key = redacted.llm.api_key.as_ref().map(|_| "***".to_string());
            redacted.github.token = redacted.github.token.as_ref().map(|_| "***".to_string());
            println!("{redacted:#?}");
            Ok(())
        }
    }
}
