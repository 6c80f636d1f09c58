mod agent;
mod config;
mod network;
mod store;
mod types;

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use agent::Agent;
use config::{AgentConfig, AgentRunArgs};

/// Layer-3 overlay network fabric for container workload orchestrators
#[derive(Debug, Parser)]
#[command(name = "weft", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Agent commands
    #[command(subcommand)]
    Agent(AgentCommands),

    /// Network configuration helpers
    #[command(subcommand)]
    Network(NetworkCommands),
}

#[derive(Debug, Subcommand)]
enum AgentCommands {
    /// Run a weft agent (client and/or server)
    Run(AgentRunArgs),
}

#[derive(Debug, Subcommand)]
enum NetworkCommands {
    /// Write an example network configuration file to the current directory
    Init,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Agent(AgentCommands::Run(args)) => run_agent(args).await,
        Commands::Network(NetworkCommands::Init) => network_init(),
    }
}

async fn run_agent(args: AgentRunArgs) -> ExitCode {
    let cfg = match AgentConfig::load(&args) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let errs = cfg.validate();
    if !errs.is_empty() {
        eprintln!("Configuration Validation Errors:");
        for err in errs {
            eprintln!("\t- {err}");
        }
        return ExitCode::FAILURE;
    }

    init_tracing(&cfg.log_level);

    let mut agent = match Agent::new(&cfg).await {
        Ok(agent) => agent,
        Err(err) => {
            tracing::error!(error = %err, "failed to create agent");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = agent.start().await {
        tracing::error!(error = %err, "failed to start agent");
        return ExitCode::FAILURE;
    }

    if let Err(err) = agent.wait_for_signal().await {
        tracing::error!(error = %err, "agent terminated abnormally");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Name of the file created by `network init`.
const NETWORK_INIT_FILENAME: &str = "weft-net.json";

/// A basic VXLAN network definition operators can adjust and push into the
/// variable store, e.g.:
/// `nomad var put weft/networks/v1/vxlan data=@weft-net.json`.
const NETWORK_INIT_CONTENT: &str = r#"{
  "name": "vxlan",
  "ipmasq": true,
  "ipv4": {
    "network": "10.10.0.0/16",
    "size": 24
  },
  "provider": {
    "name": "vxlan",
    "config": {
      "vni": 1,
      "port": 4789
    }
  }
}
"#;

fn network_init() -> ExitCode {
    // Refuse to clobber an existing file; overwriting operator edits would
    // be unexpected.
    let result = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(NETWORK_INIT_FILENAME)
        .and_then(|mut file| file.write_all(NETWORK_INIT_CONTENT.as_bytes()));

    match result {
        Ok(()) => {
            println!("successfully wrote file {NETWORK_INIT_FILENAME}");
            ExitCode::SUCCESS
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            eprintln!("{NETWORK_INIT_FILENAME} already exists");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("failed to write file: {err}");
            ExitCode::FAILURE
        }
    }
}
