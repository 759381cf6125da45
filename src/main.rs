use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lora_join_server::cleanup::{signal_shutdown, Cleaner};
use lora_join_server::config::Config;
use lora_join_server::crypto::CryptoService;
use lora_join_server::identity::IdentityServer;
use lora_join_server::joinserver::{Components, JoinServer};
use lora_join_server::registry::{
    EndDevice, MemAppActivationRegistry, MemDeviceRegistry, MemKeyRegistry, Snapshot,
};

#[derive(Parser)]
#[command(name = "lora-join-server")]
#[command(about = "LoRaWAN Join Server: OTAA activation and session key management")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// JSON array of end devices to provision at startup
    #[arg(long)]
    devices: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A missing file means development defaults; an invalid one is fatal.
    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        eprintln!("Warning: config file {:?} not found", cli.config);
        eprintln!("Using default configuration");
        Config::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lora-join-server v{}", env!("CARGO_PKG_VERSION"));

    let devices = Arc::new(MemDeviceRegistry::new());
    let keys = Arc::new(MemKeyRegistry::new(config.join_server.session_key_limit));
    let app_activation = Arc::new(MemAppActivationRegistry::new());

    if let Some(path) = config.storage.snapshot_path.as_deref() {
        if path.exists() {
            Snapshot::load(path)?.apply(&devices, &keys, &app_activation)?;
            info!(path = %path.display(), devices = devices.len(), "Registries restored");
        }
    }

    let mut js = JoinServer::new(
        config.join_server_config(),
        Components {
            devices: devices.clone(),
            keys: keys.clone(),
            app_activation: app_activation.clone(),
            key_vault: Arc::new(config.key_vault()),
        },
    )?;
    if let Some(service) = remote_crypto(config.crypto.network.as_ref())? {
        info!("External network crypto service enabled");
        js = js.with_network_crypto(service);
    }
    if let Some(service) = remote_crypto(config.crypto.application.as_ref())? {
        info!("External application crypto service enabled");
        js = js.with_application_crypto(service);
    }
    let js = Arc::new(js);

    if config.join_server.join_eui_prefixes.is_empty() {
        warn!("No JoinEUI prefixes configured; every join-request will be rejected");
    }

    if let Some(path) = &cli.devices {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read devices file {:?}", path))?;
        let batch: Vec<EndDevice> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse devices file {:?}", path))?;
        let created = js.provision(batch).await?;
        info!(created, "Devices provisioned from {:?}", path);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let cleanup = match identity_server(&config)? {
        Some(identity) if config.cleanup.interval_secs > 0 => {
            let cleaner = Cleaner::new(identity, devices.clone(), keys.clone(), app_activation.clone());
            let interval = Duration::from_secs(config.cleanup.interval_secs);
            Some(tokio::spawn(cleaner.run(interval, shutdown_rx)))
        }
        _ => {
            info!("Registry cleanup disabled");
            None
        }
    };

    info!(
        prefixes = config.join_server.join_eui_prefixes.len(),
        "Join Server running. Press Ctrl+C to stop."
    );
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    signal_shutdown(&shutdown_tx);
    if let Some(task) = cleanup {
        if let Err(e) = task.await {
            error!("Cleanup task failed: {}", e);
        }
    }

    if let Some(path) = config.storage.snapshot_path.as_deref() {
        Snapshot::capture(&devices, &keys, &app_activation).save(path)?;
        info!(path = %path.display(), "Registries saved");
    }

    Ok(())
}

#[cfg(feature = "remote")]
fn remote_crypto(
    config: Option<&lora_join_server::config::CryptoServiceConfig>,
) -> anyhow::Result<Option<Arc<dyn CryptoService>>> {
    use lora_join_server::crypto::remote::RemoteCryptoService;

    match config {
        Some(c) if c.enabled => {
            let service = RemoteCryptoService::new(&c.address, c.tls)?;
            Ok(Some(Arc::new(service)))
        }
        _ => Ok(None),
    }
}

#[cfg(not(feature = "remote"))]
fn remote_crypto(
    config: Option<&lora_join_server::config::CryptoServiceConfig>,
) -> anyhow::Result<Option<Arc<dyn CryptoService>>> {
    if config.map_or(false, |c| c.enabled) {
        anyhow::bail!("external crypto services need the `remote` feature");
    }
    Ok(None)
}

#[cfg(feature = "remote")]
fn identity_server(config: &Config) -> anyhow::Result<Option<Arc<dyn IdentityServer>>> {
    use lora_join_server::identity::HttpIdentityServer;

    match &config.identity_server {
        Some(c) => {
            let client = HttpIdentityServer::new(&c.url, c.api_key.clone())?;
            Ok(Some(Arc::new(client)))
        }
        None => Ok(None),
    }
}

#[cfg(not(feature = "remote"))]
fn identity_server(config: &Config) -> anyhow::Result<Option<Arc<dyn IdentityServer>>> {
    if config.identity_server.is_some() {
        warn!("Identity server configured but the `remote` feature is disabled");
    }
    Ok(None)
}
