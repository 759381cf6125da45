//! The Join Server
//!
//! [`JoinServer`] ties the registries, the key vault and the crypto services
//! together and exposes the operations Network Servers, Application Servers,
//! interop peers and users call:
//!
//! - `handle_join` (join.rs): the OTAA join procedure;
//! - `get_nwk_s_keys`, `get_app_s_key`, `get_home_network` (lookup.rs);
//! - device CRUD and bulk provisioning (devices.rs);
//! - application activation settings CRUD (activation.rs).
//!
//! Every operation takes the caller's [`Context`] and the [`Authorizer`] the
//! transport edge selected for it.

pub mod activation;
pub mod devices;
pub mod join;
pub mod lookup;
pub mod session_key_id;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::auth::{Authorizer, Context, Right};
use crate::crypto::local::LocalCryptoService;
use crate::crypto::{CryptoDevice, CryptoService};
use crate::error::{Error, Result};
use crate::keyvault::KeyVault;
use crate::lorawan::{Eui64, JoinEuiPrefix};
use crate::provisioning::Provisioners;
use crate::registry::{AppActivationRegistry, DeviceRegistry, EndDevice, KeyRegistry};

pub use join::{JoinRequest, JoinResponse};
pub use lookup::{AppSKeyResponse, HomeNetwork, NwkSKeysResponse, SessionKeyRequest};
pub use session_key_id::SessionKeyIdGenerator;

pub const DEFAULT_DEV_NONCE_LIMIT: usize = 32;

/// Join Server settings.
#[derive(Debug, Clone)]
pub struct JoinServerConfig {
    /// JoinEUIs this Join Server is authoritative for.
    pub join_eui_prefixes: Vec<JoinEuiPrefix>,
    pub default_join_eui: Option<Eui64>,
    /// Number of used DevNonces remembered per pre-1.1 device.
    pub dev_nonce_limit: usize,
    /// KEK label root keys and application KEKs are wrapped with at rest.
    pub device_kek_label: String,
    /// Deadline applied when the caller sets none.
    pub request_timeout: Option<Duration>,
}

impl Default for JoinServerConfig {
    fn default() -> Self {
        Self {
            join_eui_prefixes: Vec::new(),
            default_join_eui: None,
            dev_nonce_limit: DEFAULT_DEV_NONCE_LIMIT,
            device_kek_label: String::new(),
            request_timeout: None,
        }
    }
}

impl JoinServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dev_nonce_limit == 0 {
            return Err(Error::DevNonceLimitInvalid(self.dev_nonce_limit));
        }
        Ok(())
    }

    pub fn serves_join_eui(&self, join_eui: Eui64) -> bool {
        self.join_eui_prefixes.iter().any(|p| p.matches(join_eui))
    }
}

/// Registries and services a Join Server is built from.
pub struct Components {
    pub devices: Arc<dyn DeviceRegistry>,
    pub keys: Arc<dyn KeyRegistry>,
    pub app_activation: Arc<dyn AppActivationRegistry>,
    pub key_vault: Arc<dyn KeyVault>,
}

pub struct JoinServer {
    config: JoinServerConfig,
    devices: Arc<dyn DeviceRegistry>,
    keys: Arc<dyn KeyRegistry>,
    app_activation: Arc<dyn AppActivationRegistry>,
    key_vault: Arc<dyn KeyVault>,
    local_crypto: Arc<dyn CryptoService>,
    network_crypto: Option<Arc<dyn CryptoService>>,
    application_crypto: Option<Arc<dyn CryptoService>>,
    provisioners: Provisioners,
    session_key_ids: SessionKeyIdGenerator,
}

impl JoinServer {
    pub fn new(config: JoinServerConfig, components: Components) -> Result<Self> {
        config.validate()?;
        let local_crypto = Arc::new(LocalCryptoService::new(components.key_vault.clone()));
        Ok(Self {
            config,
            devices: components.devices,
            keys: components.keys,
            app_activation: components.app_activation,
            key_vault: components.key_vault,
            local_crypto,
            network_crypto: None,
            application_crypto: None,
            provisioners: Provisioners::default(),
            session_key_ids: SessionKeyIdGenerator::default(),
        })
    }

    /// External crypto service for devices with `external_network_crypto`.
    pub fn with_network_crypto(mut self, service: Arc<dyn CryptoService>) -> Self {
        self.network_crypto = Some(service);
        self
    }

    /// External crypto service for devices with `external_application_crypto`.
    pub fn with_application_crypto(mut self, service: Arc<dyn CryptoService>) -> Self {
        self.application_crypto = Some(service);
        self
    }

    pub fn with_provisioners(mut self, provisioners: Provisioners) -> Self {
        self.provisioners = provisioners;
        self
    }

    pub fn config(&self) -> &JoinServerConfig {
        &self.config
    }

    fn network_crypto_for(&self, dev: &EndDevice) -> Result<&Arc<dyn CryptoService>> {
        if dev.external_network_crypto {
            self.network_crypto.as_ref().ok_or_else(|| {
                Error::CryptoService("no external network crypto service configured".to_string())
            })
        } else {
            Ok(&self.local_crypto)
        }
    }

    fn application_crypto_for(&self, dev: &EndDevice) -> Result<&Arc<dyn CryptoService>> {
        if dev.external_application_crypto {
            self.application_crypto.as_ref().ok_or_else(|| {
                Error::CryptoService(
                    "no external application crypto service configured".to_string(),
                )
            })
        } else {
            Ok(&self.local_crypto)
        }
    }

    /// Effective deadline of a request.
    fn deadline(&self, ctx: &Context) -> Option<Instant> {
        ctx.deadline
            .or_else(|| self.config.request_timeout.map(|t| Instant::now() + t))
    }

    /// Run `fut`, failing with `DEADLINE_EXCEEDED` once `deadline` passes.
    async fn until<T>(
        deadline: Option<Instant>,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| Error::DeadlineExceeded)?,
            None => fut.await,
        }
    }

    /// Gate for application-scoped operations: cluster callers pass on
    /// their credentials, users need `rights` on the application, interop
    /// peers are refused.
    async fn require_rights(
        &self,
        ctx: &Context,
        authorizer: &Authorizer,
        application_id: &str,
        rights: &[Right],
    ) -> Result<()> {
        authorizer.require_authorized(ctx).await?;
        match authorizer {
            Authorizer::Cluster { .. } => Ok(()),
            Authorizer::ApplicationRights { .. } => {
                authorizer
                    .require_application(ctx, application_id, rights)
                    .await
            }
            Authorizer::Interop => Err(Error::PermissionDenied(
                "interop peers cannot manage applications".to_string(),
            )),
        }
    }
}

fn crypto_device(dev: &EndDevice) -> CryptoDevice {
    CryptoDevice {
        join_eui: dev.ids.join_eui,
        dev_eui: dev.ids.dev_eui,
        provisioner_id: dev.provisioner_id.clone(),
        provisioning_data: dev.provisioning_data.clone(),
        root_keys: dev.root_keys.clone(),
    }
}
