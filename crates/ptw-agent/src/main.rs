//! Publish-to-web agent daemon
//!
//! Keeps a reverse SSH tunnel from the public proxy to a local service, and
//! keeps the directory informed about this installation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ptw_agent::identity::fingerprint;
use ptw_agent::{Agent, HttpTransport, PrepareMode, SshConnector};
use ptw_core::config::{self, AgentConfig};
use ptw_core::{Config, DirStore, Field};

/// How long Ctrl-C waits for the agent to wind down
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "ptw-agent")]
#[command(about = "Publish a local service to the web through a reverse SSH tunnel")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "PTW_CONFIG")]
    config: Option<PathBuf>,

    /// Root directory of the persistent store (overrides config)
    #[arg(long, global = true, env = "PTW_STORE")]
    store: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Local port of the published service (overrides config)
    #[arg(long, global = true)]
    forward_port: Option<u16>,

    /// Proxy host (overrides config)
    #[arg(long, global = true)]
    proxy_host: Option<String>,

    /// Directory base URL (overrides config)
    #[arg(long, global = true)]
    directory_host: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Keep the tunnel up until interrupted
    Run {
        /// Run even if publishing is not enabled in the store
        #[arg(long)]
        ignore_enabled: bool,
    },

    /// Synchronize with the directory once
    Prepare,

    /// Show the recorded status of this installation
    Status,

    /// Make sure the directory knows our key, and print it
    Identity,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    let store = Config::new(Arc::new(DirStore::new(config.store_path.clone())));
    tracing::debug!("Using store at {:?}", config.store_path);

    match args.command {
        Command::Run { ignore_enabled } => run(config, store, ignore_enabled).await,
        Command::Prepare => {
            let mut agent = build_agent(config, store)?;
            agent
                .prepare(PrepareMode::Strict)
                .await
                .context("Directory preparation failed")?;
            println!("{}", agent.store().status()?);
            Ok(())
        }
        Command::Status => status(&store),
        Command::Identity => {
            let mut agent = build_agent(config, store)?;
            let identity = agent.ensure_identity().await?;
            println!("{}", identity.public_key);
            println!("sha1: {}", fingerprint(&identity.public_key));
            Ok(())
        }
    }
}

/// Config file, then command-line overrides
fn load_config(args: &Args) -> Result<AgentConfig> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);

    let mut config = if config_path.exists() {
        config::load_agent_config(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        tracing::debug!("No config at {:?}, using defaults", config_path);
        AgentConfig::default()
    };

    if let Some(store) = &args.store {
        config.store_path = store.clone();
    }
    if let Some(port) = args.forward_port {
        config.forward_port = port;
    }
    if let Some(host) = &args.proxy_host {
        config.proxy_host = host.clone();
    }
    if let Some(host) = &args.directory_host {
        config.directory_host = host.clone();
    }

    config.validate()?;
    Ok(config)
}

fn build_agent(config: AgentConfig, store: Config) -> Result<Agent> {
    let transport = HttpTransport::new(config.directory_host.clone(), config.http_timeout)
        .context("Failed to create directory client")?;
    let connector = SshConnector::from_config(&config);

    Ok(Agent::new(config, store, Arc::new(transport), Arc::new(connector)))
}

async fn run(config: AgentConfig, store: Config, ignore_enabled: bool) -> Result<()> {
    if !ignore_enabled && !store.enabled()? {
        tracing::info!("Publishing is not enabled, exiting");
        return Ok(());
    }

    tracing::info!("Publish-to-web agent starting...");
    let handle = build_agent(config, store)?.spawn();

    let interrupted = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            true
        }
        _ = handle.finished() => false,
    };

    if interrupted {
        tracing::info!("Interrupted, shutting down");
        handle.stop(STOP_TIMEOUT).await?;
    } else {
        handle.join().await?;
    }

    Ok(())
}

fn status(store: &Config) -> Result<()> {
    println!("status:      {}", store.status()?);
    println!(
        "node name:   {}",
        store.get(Field::NodeName)?.as_deref().unwrap_or("-")
    );
    println!(
        "hardware id: {}",
        store.get(Field::HardwareId)?.as_deref().unwrap_or("-")
    );
    let license = if store.get(Field::LicenseKey)?.is_some() {
        "present"
    } else {
        "absent"
    };
    println!("license:     {}", license);
    println!("enabled:     {}", store.enabled()?);
    Ok(())
}
