use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::joinserver::{JoinServerConfig, DEFAULT_DEV_NONCE_LIMIT};
use crate::keyvault::MemKeyVault;
use crate::lorawan::keys::AesKey;
use crate::lorawan::{Eui64, JoinEuiPrefix};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub join_server: JoinServerSection,
    pub cluster: ClusterConfig,
    pub key_vault: KeyVaultConfig,
    pub crypto: CryptoConfig,
    pub identity_server: Option<IdentityServerConfig>,
    pub cleanup: CleanupConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct JoinServerSection {
    /// `"<EUI64 hex>/<bits>"`
    pub join_eui_prefixes: Vec<JoinEuiPrefix>,
    pub default_join_eui: Option<Eui64>,
    pub dev_nonce_limit: usize,
    /// KEK that root keys and application KEKs are stored under.
    pub device_kek_label: String,
    /// Session key records kept per device; unbounded when unset.
    pub session_key_limit: Option<usize>,
    pub request_timeout_secs: Option<u64>,
}

impl Default for JoinServerSection {
    fn default() -> Self {
        Self {
            join_eui_prefixes: Vec::new(),
            default_join_eui: None,
            dev_nonce_limit: DEFAULT_DEV_NONCE_LIMIT,
            device_kek_label: String::new(),
            session_key_limit: None,
            request_timeout_secs: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Credentials accepted from Network and Application Servers in the
    /// same cluster.
    pub keys: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct KeyVaultConfig {
    /// KEK label -> 32 hex characters.
    pub keys: BTreeMap<String, AesKey>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub network: Option<CryptoServiceConfig>,
    pub application: Option<CryptoServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CryptoServiceConfig {
    #[serde(default)]
    pub enabled: bool,
    pub address: String,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityServerConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// 0 disables cleanup.
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {:?}", path))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.join_server_config().validate()?;

        let label = &self.join_server.device_kek_label;
        if !label.is_empty() && !self.key_vault.keys.contains_key(label) {
            anyhow::bail!("device KEK `{}` is not in the key vault", label);
        }
        for (name, service) in [
            ("network", &self.crypto.network),
            ("application", &self.crypto.application),
        ] {
            if let Some(service) = service {
                if service.enabled && service.address.is_empty() {
                    anyhow::bail!("crypto.{} is enabled without an address", name);
                }
            }
        }
        if self.join_server.session_key_limit == Some(0) {
            anyhow::bail!("join_server.session_key_limit must be at least 1");
        }
        Ok(())
    }

    pub fn join_server_config(&self) -> JoinServerConfig {
        let js = &self.join_server;
        JoinServerConfig {
            join_eui_prefixes: js.join_eui_prefixes.clone(),
            default_join_eui: js.default_join_eui,
            dev_nonce_limit: js.dev_nonce_limit,
            device_kek_label: js.device_kek_label.clone(),
            request_timeout: js.request_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn key_vault(&self) -> MemKeyVault {
        self.key_vault
            .keys
            .iter()
            .fold(MemKeyVault::default(), |vault, (label, kek)| {
                vault.with_kek(label.clone(), kek.clone())
            })
    }
}
