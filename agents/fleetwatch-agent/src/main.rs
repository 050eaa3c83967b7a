//! Fleetwatch Agent CLI Entry Point
//!
//! This is the main entry point for the Fleetwatch Agent binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use fleetwatch_agent::agent::reconnect::reconnect_channel;
use fleetwatch_agent::cli::config::{Config, ConfigStore, LoggingConfig};
use fleetwatch_agent::connection::transport::TransportSlot;
use fleetwatch_agent::{
    Agent, Backend, BackendClient, IdentityHandle, MetricsSource, ShutdownCoordinator,
    SysinfoCollector,
};

#[derive(Parser)]
#[command(name = "fleetwatch-agent")]
#[command(author, version, about = "Fleetwatch Agent - host monitoring and remote operations agent")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "FLEETWATCH_CONFIG", default_value = "/etc/fleetwatch/agent.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the backend URL from the configuration file
    #[arg(long, env = "FLEETWATCH_SERVER_URL")]
    server_url: Option<String>,

    /// Registration token used when the agent has no identity yet
    #[arg(long, env = "FLEETWATCH_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent
    Start,
    /// Exchange the registration token for an identity and save it
    Register,
    /// Show agent status
    Status,
    /// Install the agent as a system service
    Install {
        /// Service name
        #[arg(short, long, default_value = "fleetwatch-agent")]
        name: String,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let store = load_store(&cli)?;
            init_logging(&store.snapshot().logging, cli.verbose)?;
            start_agent(store).await?;
        }
        Commands::Register => {
            let store = load_store(&cli)?;
            init_logging(&store.snapshot().logging, cli.verbose)?;
            register(&store).await?;
        }
        Commands::Status => {
            let store = load_store(&cli)?;
            show_status(&store).await?;
        }
        Commands::Install { name } => {
            install_service(&name, &cli.config);
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

/// Load the config file (defaults when it does not exist yet) and apply the
/// command line overrides
fn load_store(cli: &Cli) -> Result<Arc<ConfigStore>> {
    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };

    if let Some(url) = &cli.server_url {
        config.server_url = url.clone();
    }
    if let Some(token) = &cli.token {
        config.registration_token = Some(token.clone());
    }
    config.validate().context("Invalid configuration")?;

    Ok(Arc::new(ConfigStore::new(&cli.config, config)))
}

fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&config.level)
                .with_context(|| format!("Invalid log level: {}", config.level))?,
        }
    };

    let writer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path))?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(config.file.is_none())
        .with_target(true);

    let result = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        "pretty" => builder.pretty().try_init(),
        other => anyhow::bail!("Unknown log format: {} (expected pretty, compact or json)", other),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

async fn start_agent(store: Arc<ConfigStore>) -> Result<()> {
    info!(config = %store.path().display(), "Starting Fleetwatch Agent...");

    let agent = Agent::new(store).context("Failed to initialize agent")?;
    let shutdown = ShutdownCoordinator::new();
    agent.run(&shutdown).await?;

    if shutdown.restart_requested() {
        info!("Restarting into the upgraded binary");
        restart()?;
    }

    info!("Agent stopped");
    Ok(())
}

#[cfg(unix)]
fn restart() -> Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("Failed to locate current executable")?;
    let err = std::process::Command::new(&exe)
        .args(std::env::args_os().skip(1))
        .exec();
    Err(err).with_context(|| format!("Failed to exec {}", exe.display()))
}

#[cfg(not(unix))]
fn restart() -> Result<()> {
    let exe = std::env::current_exe().context("Failed to locate current executable")?;
    std::process::Command::new(&exe)
        .args(std::env::args_os().skip(1))
        .spawn()
        .with_context(|| format!("Failed to spawn {}", exe.display()))?;
    Ok(())
}

async fn register(store: &ConfigStore) -> Result<()> {
    let config = store.snapshot();
    let identity = config.identity();

    if identity.is_configured() {
        println!("Agent already registered as server {}", identity.server_id);
        return Ok(());
    }
    let token = identity
        .registration_token
        .clone()
        .context("No registration token: pass --token or set registration_token")?;

    let (reconnect, _requests) = reconnect_channel();
    let (inbound, _frames) = mpsc::channel(1);
    let handle = IdentityHandle::new(identity);
    let client = BackendClient::new(
        &config.server_url,
        handle.clone(),
        TransportSlot::new(),
        inbound,
        reconnect,
    )?;

    let (server_id, secret_key) = client
        .register_agent(&token)
        .await
        .context("Registration failed")?;
    let registered = handle.set_registered(server_id, secret_key);
    store
        .save_identity(&registered)
        .context("Failed to save identity")?;

    println!("Registered as server {}", server_id);
    println!("Identity saved to {}", store.path().display());
    Ok(())
}

async fn show_status(store: &ConfigStore) -> Result<()> {
    let config = store.snapshot();
    let identity = config.identity();

    println!("Agent Status:");
    println!("  Config: {}", store.path().display());
    println!("  Server URL: {}", config.server_url);
    if identity.is_configured() {
        println!("  Identity: server {}", identity.server_id);
    } else if identity.registration_token.is_some() {
        println!("  Identity: not registered (token present)");
    } else {
        println!("  Identity: not registered (no token)");
    }
    println!(
        "  Intervals: heartbeat {}s, metrics {}s, settings {}s",
        config.intervals.heartbeat_secs, config.intervals.metrics_secs, config.intervals.settings_secs
    );

    let collector = SysinfoCollector::new();
    match collector.get_monitor_data().await {
        Ok(data) => {
            println!("  CPU: {:.1}%", data.cpu_usage);
            println!(
                "  Memory: {} / {} MiB",
                data.memory_used / (1024 * 1024),
                data.memory_total / (1024 * 1024)
            );
            println!(
                "  Disk: {} / {} GiB",
                data.disk_used / (1024 * 1024 * 1024),
                data.disk_total / (1024 * 1024 * 1024)
            );
            println!(
                "  Load: {:.2} {:.2} {:.2}",
                data.load_avg_1, data.load_avg_5, data.load_avg_15
            );
        }
        Err(e) => warn!(error = %e, "Failed to collect local metrics"),
    }

    // The running agent keeps its connection state in memory only
    println!("  Backend: check the agent process logs");
    Ok(())
}

fn install_service(name: &str, config: &Path) {
    println!("Installing service: {}", name);

    let service_content = format!(
        r#"[Unit]
Description=Fleetwatch Agent
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
ExecStart=/usr/local/bin/fleetwatch-agent --config {} start
Restart=always
RestartSec=5
User=root
Environment=RUST_LOG=info

[Install]
WantedBy=multi-user.target
"#,
        config.display()
    );

    let service_path = format!("/etc/systemd/system/{}.service", name);
    println!("Service file would be created at: {}", service_path);
    println!("\nService content:");
    println!("{}", service_content);
    println!("\nTo install manually, run:");
    println!("  sudo cp fleetwatch-agent /usr/local/bin/");
    println!("  sudo nano {}", service_path);
    println!("  sudo systemctl daemon-reload");
    println!("  sudo systemctl enable {}", name);
    println!("  sudo systemctl start {}", name);
}

fn show_version() {
    println!("fleetwatch-agent {}", env!("CARGO_PKG_VERSION"));
    println!("Host monitoring and remote operations agent for Fleetwatch");
    println!();
    println!("Features:");
    println!("  - Heartbeat and metrics reporting");
    println!("  - WebSocket command channel");
    println!("  - Auto-reconnection with exponential backoff");
    println!("  - File, process, docker, nginx and terminal operations");
    println!("  - Self-upgrade with checksum verification");
}
