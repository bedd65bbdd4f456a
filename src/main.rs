//! Delegation Forge - headless operator CLI
//!
//! Runs the forgery pipeline over saved tokens and HAR captures.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::json;
use tokio::sync::broadcast;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use delegation_forge::app::Config;
use delegation_forge::crypto::{probe, select_provider};
use delegation_forge::delegation::{self, der, DelegationChain};
use delegation_forge::export::{self, render_import_script};
use delegation_forge::extension::{Extension, SESSION_CURVE};
use delegation_forge::forgery::{ForgeryEngine, ForgeryResult};
use delegation_forge::host::SimulatedHost;
use delegation_forge::keystore::{Fingerprint, KeyMaterialStore};
use delegation_forge::replay;
use delegation_forge::{ForgeError, ResultExt};

/// Delegation-chain session forgery
#[derive(Parser, Debug)]
#[command(name = "delegation-forge")]
#[command(author, version, about = "Delegation-chain session forgery", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "DELEGATION_FORGE_CONFIG")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "DELEGATION_FORGE_LOG_LEVEL")]
    log_level: String,

    /// Log file path (enables file logging)
    #[arg(long, global = true, env = "DELEGATION_FORGE_LOG_FILE")]
    log_file: Option<String>,

    /// Enable JSON structured logging
    #[arg(long, global = true, env = "DELEGATION_FORGE_LOG_JSON")]
    log_json: bool,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Forge a session for a saved delegation token
    Forge {
        /// File holding the delegation chain JSON
        token: PathBuf,

        /// Host the token was captured from (keys the forged identity)
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Print the browser import script instead of the artifact JSON
        #[arg(long)]
        script: bool,
    },

    /// Replay a HAR capture through the interceptor
    Replay {
        /// HAR file
        capture: PathBuf,

        /// Exchanges dispatched concurrently
        #[arg(long, default_value_t = replay::DEFAULT_CONCURRENCY)]
        concurrency: usize,
    },

    /// Decode a delegation token and print its structure
    Inspect {
        /// File holding the delegation chain JSON
        token: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.generate_config {
        return generate_default_config();
    }

    init_logging(&cli)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting delegation-forge");

    let config = load_config(&cli)?;

    if cli.validate_config {
        println!("Configuration is valid");
        return Ok(());
    }

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(handle_signals(shutdown_tx));

    let result = run(command, config, shutdown_rx).await;
    if let Err(err) = &result {
        if let Some(forge_err) = err.downcast_ref::<ForgeError>() {
            eprintln!("{}", forge_err.user_message());
        }
    }
    result
}

/// Initialize the logging system
fn init_logging(cli: &Cli) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if let Some(log_path) = &cli.log_file {
        let path = Path::new(log_path);
        let file_appender = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => {
                let filename = path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or("delegation-forge.log");
                RollingFileAppender::new(Rotation::DAILY, dir, filename)
            }
            None => {
                let log_dir = Config::log_dir().unwrap_or_else(|_| PathBuf::from("."));
                std::fs::create_dir_all(&log_dir).ok();
                RollingFileAppender::new(Rotation::DAILY, log_dir, log_path)
            }
        };

        let file_layer = fmt::layer().with_writer(file_appender).with_ansi(false);
        if cli.log_json {
            subscriber.with(file_layer.json()).init();
        } else {
            subscriber.with(file_layer).init();
        }
    } else if cli.log_json {
        subscriber.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        // stdout carries artifacts and scripts
        subscriber.with(fmt::layer().with_writer(std::io::stderr)).init();
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let config = Config::load(cli.config.as_deref())?;
    config.validate().map_err(ForgeError::from)?;
    Ok(config)
}

/// Generate default configuration file
fn generate_default_config() -> Result<()> {
    let config = Config::default();
    let toml = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;

    println!("{}", toml);
    Ok(())
}

/// Handle shutdown signals
async fn handle_signals(shutdown_tx: broadcast::Sender<()>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => tracing::info!("Received SIGINT, initiating shutdown"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating shutdown"),
                }
            }
            _ => {
                tracing::warn!("Failed to register signal handlers, falling back to Ctrl+C");
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::warn!("Failed to register Ctrl+C handler");
            return;
        }
        tracing::info!("Received Ctrl+C, initiating shutdown");
    }

    let _ = shutdown_tx.send(());
}

async fn run(command: Command, config: Config, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    match command {
        Command::Forge { token, host, script } => forge(&config, &token, &host, script),
        Command::Inspect { token } => inspect(&token),
        Command::Replay { capture, concurrency } => {
            tokio::select! {
                result = run_replay(&config, &capture, concurrency) => result,
                _ = shutdown_rx.recv() => {
                    tracing::info!("Shutdown signal received, abandoning replay");
                    Ok(())
                }
            }
        }
    }
}

fn read_token(path: &Path) -> Result<DelegationChain> {
    let raw = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    delegation::parse(&raw)
        .forge_context(format!("Could not decode {}", path.display()))
        .map_err(Into::into)
}

fn forge(config: &Config, token: &Path, host: &str, script: bool) -> Result<()> {
    let chain = read_token(token)?;
    chain.validate_integrity().map_err(ForgeError::from)?;

    let provider = select_provider(config.crypto.backend, SESSION_CURVE);
    probe(provider.as_ref(), SESSION_CURVE)
        .forge_context(format!("Crypto backend '{}' is unusable", provider.name()))?;

    let store = KeyMaterialStore::new(provider.clone(), SESSION_CURVE, config.cache.store_config());
    let engine = ForgeryEngine::new(provider, config.forgery.engine_config());

    let fingerprint = Fingerprint::derive(host, &chain.session_id());
    let key = store.get_or_create(&fingerprint).map_err(ForgeError::from)?;
    let forged = engine.forge(&chain, &key).map_err(ForgeError::from)?;

    let artifact = export::export(&ForgeryResult { forged, key: &key }).map_err(ForgeError::from)?;
    artifact.validate().map_err(ForgeError::from)?;

    if script {
        println!("{}", render_import_script(&artifact));
    } else {
        println!("{}", artifact.to_json_pretty());
    }
    store.drain();
    Ok(())
}

fn inspect(token: &Path) -> Result<()> {
    let chain = read_token(token)?;

    let algorithm = |der_bytes: &[u8]| {
        der::parse_spki(der_bytes)
            .map(|info| info.algorithm.name().to_string())
            .unwrap_or_else(|e| format!("unrecognised ({})", e))
    };

    let hops: Vec<_> = chain
        .delegations
        .iter()
        .map(|signed| {
            let expiration = i64::try_from(signed.delegation.expiration)
                .map(DateTime::<Utc>::from_timestamp_nanos)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            json!({
                "pubkey": hex::encode(&signed.delegation.pubkey),
                "algorithm": algorithm(&signed.delegation.pubkey),
                "expiration": signed.delegation.expiration,
                "expires_at": expiration,
                "targets": signed.delegation.targets.iter().map(|t| t.to_text()).collect::<Vec<_>>(),
                "signer": signed.signer.as_ref().map(hex::encode),
            })
        })
        .collect();

    let integrity = match chain.validate_integrity() {
        Ok(()) => "ok".to_string(),
        Err(e) => e.to_string(),
    };

    let summary = json!({
        "format": chain.format,
        "session_id": chain.session_id(),
        "root": {
            "public_key": hex::encode(&chain.public_key),
            "algorithm": algorithm(&chain.public_key),
        },
        "delegations": hops,
        "integrity": integrity,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_replay(config: &Config, capture: &Path, concurrency: usize) -> Result<()> {
    let content = tokio::fs::read_to_string(capture)
        .await
        .with_context(|| format!("Failed to read {:?}", capture))?;
    let exchanges = replay::load_har(&content)?;

    let host = Arc::new(SimulatedHost::new(config.diagnostics.max_records));
    let extension = Extension::activate(config, host.clone())?;

    let summary = replay::replay(host.clone(), exchanges, concurrency).await?;

    let output = json!({
        "summary": summary,
        "interceptor": {
            "candidates": extension.interceptor_stats().candidates,
            "forged": extension.interceptor_stats().forged,
            "passed_through_on_error": extension.interceptor_stats().passed_through_on_error,
        },
        "diagnostics": host.diagnostics().get_all(),
        "artifacts": extension.artifacts().get_all(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    extension.deactivate();
    Ok(())
}
