//! lockbridge - MQTT bridge for BLE smart locks

use clap::{Parser, Subcommand};
use lockbridge::config::{BridgeConfig, SessionBackend};
use lockbridge::device::{SessionFactory, SimulatedSessionFactory};
use lockbridge::error::sanitize_error_message;
use lockbridge::lifecycle::BridgeLifecycle;
use lockbridge::observability::{init_default_logging, init_logging, metrics, LogFormat};
use lockbridge::transport::mqtt::MqttClient;
use lockbridge::transport::Transport;
use std::path::PathBuf;
use std::process;
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info, Level};

/// Bridge Bluetooth LE smart locks to an MQTT broker
#[derive(Parser)]
#[command(name = "lockbridge")]
#[command(about = "MQTT bridge for BLE smart locks")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "LOCKBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace); overrides LOG_LEVEL
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until SIGINT/SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration with secrets redacted
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, log_format_from_env(), false),
        _ => init_logging(Level::TRACE, log_format_from_env(), true),
    }

    info!("Starting lockbridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", sanitize_error_message(&e.to_string()));
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", sanitize_error_message(&e.to_string()));
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn log_format_from_env() -> LogFormat {
    LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default())
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for path_str in ["lockbridge.toml", "config/lockbridge.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BridgeConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create lockbridge.toml".into())
}

/// Session backend selected by configuration
fn build_session_factory(config: &BridgeConfig) -> Box<dyn SessionFactory> {
    match config.session.backend {
        SessionBackend::Simulated => {
            Box::new(SimulatedSessionFactory::from_section(&config.session))
        }
    }
}

async fn run_bridge(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        devices = config.devices.len(),
        broker = %config.mqtt.broker_url,
        "Bridge starting"
    );

    let transport = MqttClient::from_config(&config)?;
    let sessions = build_session_factory(&config);
    let mut lifecycle = BridgeLifecycle::new(config, transport);

    lifecycle.start(sessions.as_ref()).await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Bridge is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = monitor_connection_health(&lifecycle) => {
            error!("MQTT connection permanently lost, shutting down bridge...");
        }
    }

    let report = lifecycle.shutdown().await?;
    if !report.is_clean() {
        error!(aborted = ?report.aborted, "Some bridges did not close in time");
    }

    let snapshot = metrics().get_metrics();
    match serde_json::to_string(&snapshot) {
        Ok(json) => info!(metrics = %json, "Final metrics"),
        Err(e) => error!("Failed to serialize metrics: {}", e),
    }
    Ok(())
}

fn handle_config_command(
    config: &BridgeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }

    info!(devices = config.devices.len(), "Configuration validation complete");
    Ok(())
}

/// Resolves once the broker link is given up for good
async fn monitor_connection_health<T>(lifecycle: &BridgeLifecycle<T>)
where
    T: Transport,
{
    loop {
        if lifecycle.transport().is_permanently_disconnected() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
}
