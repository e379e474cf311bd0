//! Certgate - Main entry point
//!
//! Runs the dynamic TLS listener against a file-backed configuration store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use certgate_config::validate::validate_listener_configuration;
use certgate_config::{CertgateConfig, EnvSettings, SettingsProvider};
use certgate_listener::reload::{SignalManager, SignalType};
use certgate_listener::{
    AppHandler, DynamicListener, FileConfigStore, ListenerOptions, TlsPolicy,
};

/// Certgate - dynamic TLS listener with on-demand certificates
#[derive(Parser, Debug)]
#[command(name = "certgate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Server configuration file (.kdl or .json)
    #[arg(short = 'c', long = "config", env = "CERTGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the server file and every stored configuration, then exit
    Test {
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
    /// Run the listener (default)
    Run {
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    match cli.command {
        Some(Commands::Test { config }) => test_config(config.or(cli.config).as_deref()),
        Some(Commands::Run { config }) => run_server(config.or(cli.config).as_deref()),
        None => run_server(cli.config.as_deref()),
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> Result<CertgateConfig> {
    match path {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            CertgateConfig::from_file(path)
                .with_context(|| format!("Failed to load configuration file {}", path.display()))
        }
        None => {
            info!("No configuration specified, using defaults");
            Ok(CertgateConfig::default())
        }
    }
}

/// Check the server file, the TLS settings and every stored configuration.
fn test_config(path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    let settings = config
        .static_settings()
        .context("Invalid settings block")?;
    TlsPolicy::from_settings(&settings).context("Invalid TLS settings")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create runtime")?;
    let store = FileConfigStore::new(config.server.store.clone());
    let configs = runtime
        .block_on(store.list())
        .with_context(|| format!("Failed to read store {}", store.path().display()))?;

    for listener_config in &configs {
        let warnings = validate_listener_configuration(listener_config)
            .into_result()
            .with_context(|| format!("Configuration {} is invalid", listener_config.config_ref()))?;
        for warning in warnings {
            warn!(config = %listener_config.config_ref(), "{}", warning);
        }
    }

    info!(
        http_port = config.server.http_port,
        https_port = config.server.https_port,
        stored_configs = configs.len(),
        "Configuration test successful"
    );
    println!(
        "certgate: configuration file {} test is successful",
        path.map(|p| p.display().to_string())
            .unwrap_or_else(|| "(defaults)".to_string())
    );
    Ok(())
}

fn run_server(path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to create runtime")?;
    runtime.block_on(serve(config))
}

async fn serve(config: CertgateConfig) -> Result<()> {
    let settings: Arc<dyn SettingsProvider> = Arc::new(EnvSettings::with_fallback(
        config.static_settings().context("Invalid settings block")?,
    ));
    let store = Arc::new(FileConfigStore::new(config.server.store.clone()));
    let listener = DynamicListener::new(
        Arc::clone(&settings),
        store.clone(),
        Arc::new(AppHandler::new(settings)),
        ListenerOptions::from_config(&config),
    );

    let mut signals = SignalManager::new().context("Failed to install signal handlers")?;
    let cancel = CancellationToken::new();
    let reconciler = listener.start_reconciler(cancel.clone());

    apply_stored(&listener, &store).await?;
    info!(store = %store.path().display(), "Certgate started");

    loop {
        match signals.recv().await {
            SignalType::Reload => {
                info!("Received SIGHUP, re-reading stored configurations");
                if let Err(e) = apply_stored(&listener, &store).await {
                    error!(error = %format!("{:#}", e), "Failed to re-read stored configurations");
                }
            }
            SignalType::Shutdown => {
                info!("Received shutdown signal, closing listeners");
                break;
            }
        }
    }

    cancel.cancel();
    listener.shutdown().await;
    if let Err(e) = reconciler.await {
        warn!(error = %e, "Reconciler task ended abnormally");
    }
    info!("Certgate stopped");
    Ok(())
}

/// Offer every enabled stored configuration to the listener and withdraw
/// the disabled ones.
async fn apply_stored(listener: &DynamicListener, store: &FileConfigStore) -> Result<()> {
    let configs = store
        .list()
        .await
        .with_context(|| format!("Failed to read store {}", store.path().display()))?;
    if configs.is_empty() {
        warn!(store = %store.path().display(), "No stored configurations");
    }

    for config in &configs {
        if !config.enabled {
            listener.disable(config).await;
            continue;
        }
        match listener.enable(config).await {
            Ok(true) => {}
            Ok(false) => info!(config = %config.config_ref(), "Configuration not selected"),
            Err(e) => error!(config = %config.config_ref(), error = %e, "Failed to enable configuration"),
        }
    }
    Ok(())
}
