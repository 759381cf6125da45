//! Persistent registries: end devices, session keys, application activation
//! settings
//!
//! Every registry is a compare-and-swap store. Mutations go through a
//! `set_by_*` call that hands the stored record (or `None`) to a mutator
//! closure; the closure returns the new record (or `None` to delete) plus the
//! field paths to persist, and the registry commits the result atomically or
//! not at all. Anything a closure checks against the stored record therefore
//! holds at commit time.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::lorawan::keys::{KeyEnvelope, RootKeys, SessionKeyId, SessionKeys, StoredSessionKeys};
use crate::lorawan::{DevAddr, Eui64, MacVersion, NetId};

pub use memory::{MemAppActivationRegistry, MemDeviceRegistry, MemKeyRegistry, Snapshot};

/// Registry mutator: receives the stored record, returns the record to store
/// (`None` deletes) and the fields to persist.
pub type Mutator<'a, T, F> =
    Box<dyn FnOnce(Option<&T>) -> Result<(Option<T>, Vec<F>)> + Send + 'a>;

/// Both identifier pairs of an end device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndDeviceIdentifiers {
    pub application_id: String,
    pub device_id: String,
    #[serde(default)]
    pub join_eui: Eui64,
    #[serde(default)]
    pub dev_eui: Eui64,
}

impl EndDeviceIdentifiers {
    /// Primary key of the device record.
    pub fn uid(&self) -> String {
        format!("{}:{}", self.application_id, self.device_id)
    }
}

impl fmt::Display for EndDeviceIdentifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} ({}/{})",
            self.application_id, self.device_id, self.join_eui, self.dev_eui
        )
    }
}

/// An active or pending session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub dev_addr: DevAddr,
    pub keys: SessionKeys,
    pub started_at: DateTime<Utc>,
}

/// End device record as stored by the Join Server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndDevice {
    pub ids: EndDeviceIdentifiers,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_data: Option<serde_json::Value>,
    /// Derived from `provisioning_data` by the provisioner; unique per
    /// provisioner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner_unique_id: Option<String>,

    #[serde(default)]
    pub lorawan_version: MacVersion,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_server_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_server_kek_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_id: Option<NetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_server_ns_id: Option<Eui64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_tenant_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_server_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_server_kek_label: Option<String>,

    /// Network-side crypto runs on the external crypto service.
    #[serde(default)]
    pub external_network_crypto: bool,
    /// Application-side crypto runs on the external crypto service.
    #[serde(default)]
    pub external_application_crypto: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_keys: Option<RootKeys>,

    #[serde(default)]
    pub last_dev_nonce: u32,
    #[serde(default)]
    pub last_join_nonce: u32,
    /// Sorted ascending, without duplicates.
    #[serde(default)]
    pub used_dev_nonces: Vec<u16>,
    #[serde(default)]
    pub resets_join_nonces: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_session: Option<Session>,
}

impl EndDevice {
    pub fn new(ids: EndDeviceIdentifiers) -> Self {
        let now = Utc::now();
        Self {
            ids,
            created_at: now,
            updated_at: now,
            provisioner_id: None,
            provisioning_data: None,
            provisioner_unique_id: None,
            lorawan_version: MacVersion::default(),
            network_server_address: None,
            network_server_kek_label: None,
            net_id: None,
            network_server_ns_id: None,
            home_tenant_id: None,
            application_server_address: None,
            application_server_id: None,
            application_server_kek_label: None,
            external_network_crypto: false,
            external_application_crypto: false,
            root_keys: None,
            last_dev_nonce: 0,
            last_join_nonce: 0,
            used_dev_nonces: Vec::new(),
            resets_join_nonces: false,
            session: None,
            pending_session: None,
        }
    }

    /// Copy `fields` from `src` onto `self`.
    pub fn apply_fields(&mut self, src: &EndDevice, fields: &[DeviceField]) {
        use DeviceField as F;
        for field in fields {
            match field {
                F::ApplicationId => self.ids.application_id = src.ids.application_id.clone(),
                F::DeviceId => self.ids.device_id = src.ids.device_id.clone(),
                F::JoinEui => self.ids.join_eui = src.ids.join_eui,
                F::DevEui => self.ids.dev_eui = src.ids.dev_eui,
                F::ProvisionerId => self.provisioner_id = src.provisioner_id.clone(),
                F::ProvisioningData => self.provisioning_data = src.provisioning_data.clone(),
                F::LorawanVersion => self.lorawan_version = src.lorawan_version,
                F::NetworkServerAddress => {
                    self.network_server_address = src.network_server_address.clone()
                }
                F::NetworkServerKekLabel => {
                    self.network_server_kek_label = src.network_server_kek_label.clone()
                }
                F::NetId => self.net_id = src.net_id,
                F::NetworkServerNsId => self.network_server_ns_id = src.network_server_ns_id,
                F::HomeTenantId => self.home_tenant_id = src.home_tenant_id.clone(),
                F::ApplicationServerAddress => {
                    self.application_server_address = src.application_server_address.clone()
                }
                F::ApplicationServerId => {
                    self.application_server_id = src.application_server_id.clone()
                }
                F::ApplicationServerKekLabel => {
                    self.application_server_kek_label = src.application_server_kek_label.clone()
                }
                F::ExternalNetworkCrypto => self.external_network_crypto = src.external_network_crypto,
                F::ExternalApplicationCrypto => {
                    self.external_application_crypto = src.external_application_crypto
                }
                F::RootKeys => self.root_keys = src.root_keys.clone(),
                F::LastDevNonce => self.last_dev_nonce = src.last_dev_nonce,
                F::LastJoinNonce => self.last_join_nonce = src.last_join_nonce,
                F::UsedDevNonces => self.used_dev_nonces = src.used_dev_nonces.clone(),
                F::ResetsJoinNonces => self.resets_join_nonces = src.resets_join_nonces,
                F::Session => self.session = src.session.clone(),
                F::PendingSession => self.pending_session = src.pending_session.clone(),
            }
        }
    }

    /// Whether `field` differs between `self` and `other`.
    pub fn field_differs(&self, other: &EndDevice, field: DeviceField) -> bool {
        let mut candidate = self.clone();
        candidate.apply_fields(other, &[field]);
        candidate != *self
    }

    /// Record with only `fields` populated (identifiers and timestamps are
    /// always kept).
    pub fn masked(&self, fields: &[DeviceField]) -> EndDevice {
        let mut out = EndDevice::new(self.ids.clone());
        out.created_at = self.created_at;
        out.updated_at = self.updated_at;
        out.apply_fields(self, fields);
        out
    }
}

/// Field paths of an [`EndDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceField {
    ApplicationId,
    DeviceId,
    JoinEui,
    DevEui,
    ProvisionerId,
    ProvisioningData,
    LorawanVersion,
    NetworkServerAddress,
    NetworkServerKekLabel,
    NetId,
    NetworkServerNsId,
    HomeTenantId,
    ApplicationServerAddress,
    ApplicationServerId,
    ApplicationServerKekLabel,
    ExternalNetworkCrypto,
    ExternalApplicationCrypto,
    RootKeys,
    LastDevNonce,
    LastJoinNonce,
    UsedDevNonces,
    ResetsJoinNonces,
    Session,
    PendingSession,
}

const DEVICE_FIELD_PATHS: &[(DeviceField, &str)] = &[
    (DeviceField::ApplicationId, "ids.application_ids"),
    (DeviceField::DeviceId, "ids.device_id"),
    (DeviceField::JoinEui, "ids.join_eui"),
    (DeviceField::DevEui, "ids.dev_eui"),
    (DeviceField::ProvisionerId, "provisioner_id"),
    (DeviceField::ProvisioningData, "provisioning_data"),
    (DeviceField::LorawanVersion, "lorawan_version"),
    (DeviceField::NetworkServerAddress, "network_server_address"),
    (DeviceField::NetworkServerKekLabel, "network_server_kek_label"),
    (DeviceField::NetId, "net_id"),
    (DeviceField::NetworkServerNsId, "network_server_ns_id"),
    (DeviceField::HomeTenantId, "home_tenant_id"),
    (DeviceField::ApplicationServerAddress, "application_server_address"),
    (DeviceField::ApplicationServerId, "application_server_id"),
    (DeviceField::ApplicationServerKekLabel, "application_server_kek_label"),
    (DeviceField::ExternalNetworkCrypto, "external_network_crypto"),
    (DeviceField::ExternalApplicationCrypto, "external_application_crypto"),
    (DeviceField::RootKeys, "root_keys"),
    (DeviceField::LastDevNonce, "last_dev_nonce"),
    (DeviceField::LastJoinNonce, "last_join_nonce"),
    (DeviceField::UsedDevNonces, "used_dev_nonces"),
    (DeviceField::ResetsJoinNonces, "resets_join_nonces"),
    (DeviceField::Session, "session"),
    (DeviceField::PendingSession, "pending_session"),
];

impl DeviceField {
    pub const ALL: [DeviceField; 24] = [
        DeviceField::ApplicationId,
        DeviceField::DeviceId,
        DeviceField::JoinEui,
        DeviceField::DevEui,
        DeviceField::ProvisionerId,
        DeviceField::ProvisioningData,
        DeviceField::LorawanVersion,
        DeviceField::NetworkServerAddress,
        DeviceField::NetworkServerKekLabel,
        DeviceField::NetId,
        DeviceField::NetworkServerNsId,
        DeviceField::HomeTenantId,
        DeviceField::ApplicationServerAddress,
        DeviceField::ApplicationServerId,
        DeviceField::ApplicationServerKekLabel,
        DeviceField::ExternalNetworkCrypto,
        DeviceField::ExternalApplicationCrypto,
        DeviceField::RootKeys,
        DeviceField::LastDevNonce,
        DeviceField::LastJoinNonce,
        DeviceField::UsedDevNonces,
        DeviceField::ResetsJoinNonces,
        DeviceField::Session,
        DeviceField::PendingSession,
    ];

    /// Fields that cannot change once the device exists.
    pub const IMMUTABLE: [DeviceField; 6] = [
        DeviceField::ApplicationId,
        DeviceField::DeviceId,
        DeviceField::JoinEui,
        DeviceField::DevEui,
        DeviceField::ProvisionerId,
        DeviceField::ProvisioningData,
    ];

    pub fn path(self) -> &'static str {
        DEVICE_FIELD_PATHS
            .iter()
            .find(|(f, _)| *f == self)
            .map(|(_, p)| *p)
            .unwrap_or("unknown")
    }

    pub fn is_immutable(self) -> bool {
        Self::IMMUTABLE.contains(&self)
    }
}

impl fmt::Display for DeviceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl FromStr for DeviceField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DEVICE_FIELD_PATHS
            .iter()
            .find(|(_, p)| *p == s)
            .map(|(f, _)| *f)
            .ok_or_else(|| Error::InvalidField("field_mask".to_string(), s.to_string()))
    }
}

/// Per-application activation settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplicationActivationSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_net_id: Option<NetId>,
    /// Label the application KEK wraps AppSKeys under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kek_label: Option<String>,
    /// Application KEK. Wrapped at rest, plaintext when returned to an
    /// authorized caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kek: Option<KeyEnvelope>,
}

/// Field paths of [`ApplicationActivationSettings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsField {
    ApplicationServerId,
    HomeNetId,
    KekLabel,
    Kek,
}

impl SettingsField {
    pub const ALL: [SettingsField; 4] = [
        SettingsField::ApplicationServerId,
        SettingsField::HomeNetId,
        SettingsField::KekLabel,
        SettingsField::Kek,
    ];
}

impl FromStr for SettingsField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "application_server_id" => Ok(SettingsField::ApplicationServerId),
            "home_net_id" => Ok(SettingsField::HomeNetId),
            "kek_label" => Ok(SettingsField::KekLabel),
            "kek" => Ok(SettingsField::Kek),
            other => Err(Error::InvalidField("field_mask".to_string(), other.to_string())),
        }
    }
}

impl ApplicationActivationSettings {
    pub fn apply_fields(&mut self, src: &ApplicationActivationSettings, fields: &[SettingsField]) {
        for field in fields {
            match field {
                SettingsField::ApplicationServerId => {
                    self.application_server_id = src.application_server_id.clone()
                }
                SettingsField::HomeNetId => self.home_net_id = src.home_net_id,
                SettingsField::KekLabel => self.kek_label = src.kek_label.clone(),
                SettingsField::Kek => self.kek = src.kek.clone(),
            }
        }
    }
}

pub type DeviceMutator<'a> = Mutator<'a, EndDevice, DeviceField>;
pub type SettingsMutator<'a> = Mutator<'a, ApplicationActivationSettings, SettingsField>;
/// Session key records are written whole.
pub type KeysMutator<'a> =
    Box<dyn FnOnce(Option<&StoredSessionKeys>) -> Result<Option<StoredSessionKeys>> + Send + 'a>;

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn get_by_eui(&self, join_eui: Eui64, dev_eui: Eui64) -> Result<EndDevice>;

    async fn get_by_id(&self, application_id: &str, device_id: &str) -> Result<EndDevice>;

    /// Mutate an existing device. Creation is only possible by ID.
    async fn set_by_eui(
        &self,
        join_eui: Eui64,
        dev_eui: Eui64,
        f: DeviceMutator<'_>,
    ) -> Result<Option<EndDevice>>;

    /// Create, update or delete a device.
    async fn set_by_id(
        &self,
        application_id: &str,
        device_id: &str,
        f: DeviceMutator<'_>,
    ) -> Result<Option<EndDevice>>;

    /// Identifiers of all devices, ordered by application and device ID.
    async fn range_by_id(&self) -> Result<Vec<EndDeviceIdentifiers>>;

    /// Delete the given devices; returns the ones that existed.
    async fn batch_delete(&self, ids: &[EndDeviceIdentifiers]) -> Result<Vec<EndDeviceIdentifiers>>;
}

#[async_trait]
pub trait KeyRegistry: Send + Sync {
    async fn get_by_id(&self, dev_eui: Eui64, id: SessionKeyId) -> Result<StoredSessionKeys>;

    async fn set_by_id(
        &self,
        dev_eui: Eui64,
        id: SessionKeyId,
        f: KeysMutator<'_>,
    ) -> Result<Option<StoredSessionKeys>>;

    /// Evict the oldest records of a device beyond the history limit and
    /// return their IDs. Inserting through `set_by_id` never evicts.
    async fn prune(&self, dev_eui: Eui64) -> Result<Vec<SessionKeyId>>;

    /// Session key IDs of a device, oldest first.
    async fn range_by_dev_eui(&self, dev_eui: Eui64) -> Result<Vec<SessionKeyId>>;

    /// Delete every session key record of a device.
    async fn delete_by_dev_eui(&self, dev_eui: Eui64) -> Result<()>;
}

#[async_trait]
pub trait AppActivationRegistry: Send + Sync {
    async fn get_by_id(&self, application_id: &str) -> Result<ApplicationActivationSettings>;

    async fn set_by_id(
        &self,
        application_id: &str,
        f: SettingsMutator<'_>,
    ) -> Result<Option<ApplicationActivationSettings>>;

    async fn range_by_id(&self) -> Result<Vec<String>>;

    async fn batch_delete(&self, application_ids: &[String]) -> Result<()>;
}
