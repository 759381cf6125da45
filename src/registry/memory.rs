//! In-memory registries
//!
//! Each registry keeps its records behind one `parking_lot` lock; a
//! `set_by_*` call runs its mutator and commits under the write lock, which
//! makes every transaction serializable. Mutators are synchronous, so no lock
//! is ever held across an `.await`.
//!
//! The whole state can be exported to a [`Snapshot`] and restored from one,
//! which is how the server binary persists registries across restarts.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use tracing::debug;

use super::{
    AppActivationRegistry, ApplicationActivationSettings, DeviceField, DeviceMutator,
    DeviceRegistry, EndDevice, EndDeviceIdentifiers, KeyRegistry, KeysMutator, SettingsMutator,
};
use crate::error::{Error, Result};
use crate::lorawan::keys::{SessionKeyId, StoredSessionKeys};
use crate::lorawan::Eui64;

#[derive(Default)]
struct DeviceState {
    /// uid -> device
    devices: BTreeMap<String, EndDevice>,
    /// (JoinEUI, DevEUI) -> uid
    by_eui: HashMap<(Eui64, Eui64), String>,
    /// (provisioner ID, unique ID) -> uid
    by_provisioner: HashMap<(String, String), String>,
}

impl DeviceState {
    /// Neither identifier pair nor the provisioner unique ID may be taken.
    fn check_unique(&self, dev: &EndDevice) -> Result<()> {
        if self.devices.contains_key(&dev.ids.uid())
            || self
                .by_eui
                .contains_key(&(dev.ids.join_eui, dev.ids.dev_eui))
        {
            return Err(Error::DuplicateIdentifiers);
        }
        if let Some(key) = provisioner_key(dev) {
            if self.by_provisioner.contains_key(&key) {
                return Err(Error::DuplicateIdentifiers);
            }
        }
        Ok(())
    }

    fn index(&mut self, dev: &EndDevice) {
        let uid = dev.ids.uid();
        self.by_eui
            .insert((dev.ids.join_eui, dev.ids.dev_eui), uid.clone());
        if let Some(key) = provisioner_key(dev) {
            self.by_provisioner.insert(key, uid);
        }
    }

    fn unindex(&mut self, dev: &EndDevice) {
        self.by_eui.remove(&(dev.ids.join_eui, dev.ids.dev_eui));
        if let Some(key) = provisioner_key(dev) {
            self.by_provisioner.remove(&key);
        }
    }

    /// Run `f` against the device stored under `uid` (if any) and commit.
    fn commit(
        &mut self,
        uid: Option<String>,
        f: DeviceMutator<'_>,
    ) -> Result<Option<EndDevice>> {
        let stored = uid.as_ref().and_then(|uid| self.devices.get(uid));
        let (updated, fields) = f(stored)?;

        match (stored.cloned(), updated) {
            (None, None) => Ok(None),
            (None, Some(dev)) => self.create(dev).map(Some),
            (Some(stored), None) => {
                self.unindex(&stored);
                self.devices.remove(&stored.ids.uid());
                Ok(None)
            }
            (Some(stored), Some(dev)) => self.update(stored, dev, &fields).map(Some),
        }
    }

    fn create(&mut self, mut dev: EndDevice) -> Result<EndDevice> {
        if dev.ids.join_eui.is_zero() {
            return Err(Error::NoJoinEui);
        }
        if dev.ids.dev_eui.is_zero() {
            return Err(Error::NoDevEui);
        }
        self.check_unique(&dev)?;
        let uid = dev.ids.uid();
        let now = Utc::now();
        dev.created_at = now;
        dev.updated_at = now;
        self.index(&dev);
        self.devices.insert(uid, dev.clone());
        Ok(dev)
    }

    fn update(
        &mut self,
        stored: EndDevice,
        dev: EndDevice,
        fields: &[DeviceField],
    ) -> Result<EndDevice> {
        if let Some(field) = fields
            .iter()
            .find(|f| f.is_immutable() && stored.field_differs(&dev, **f))
        {
            return Err(Error::ImmutableField(field.path().to_string()));
        }
        let mut next = stored.clone();
        next.apply_fields(&dev, fields);
        next.updated_at = Utc::now();
        self.devices.insert(next.ids.uid(), next.clone());
        Ok(next)
    }
}

fn provisioner_key(dev: &EndDevice) -> Option<(String, String)> {
    match (&dev.provisioner_id, &dev.provisioner_unique_id) {
        (Some(p), Some(u)) => Some((p.clone(), u.clone())),
        _ => None,
    }
}

/// In-memory [`DeviceRegistry`].
#[derive(Default)]
pub struct MemDeviceRegistry {
    state: RwLock<DeviceState>,
}

impl MemDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn export(&self) -> Vec<EndDevice> {
        self.state.read().devices.values().cloned().collect()
    }

    /// Replace the registry contents. Fails on duplicate identifiers.
    pub fn restore(&self, devices: Vec<EndDevice>) -> Result<()> {
        let mut state = DeviceState::default();
        for dev in devices {
            state.check_unique(&dev)?;
            state.index(&dev);
            state.devices.insert(dev.ids.uid(), dev);
        }
        *self.state.write() = state;
        Ok(())
    }
}

#[async_trait]
impl DeviceRegistry for MemDeviceRegistry {
    async fn get_by_eui(&self, join_eui: Eui64, dev_eui: Eui64) -> Result<EndDevice> {
        let state = self.state.read();
        state
            .by_eui
            .get(&(join_eui, dev_eui))
            .and_then(|uid| state.devices.get(uid))
            .cloned()
            .ok_or(Error::DeviceNotFound)
    }

    async fn get_by_id(&self, application_id: &str, device_id: &str) -> Result<EndDevice> {
        let uid = format!("{}:{}", application_id, device_id);
        self.state
            .read()
            .devices
            .get(&uid)
            .cloned()
            .ok_or(Error::DeviceNotFound)
    }

    async fn set_by_eui(
        &self,
        join_eui: Eui64,
        dev_eui: Eui64,
        f: DeviceMutator<'_>,
    ) -> Result<Option<EndDevice>> {
        let mut state = self.state.write();
        let uid = state.by_eui.get(&(join_eui, dev_eui)).cloned();
        let exists = uid.is_some();
        let wrapped: DeviceMutator<'_> = Box::new(move |stored| {
            let (updated, fields) = f(stored)?;
            if !exists && updated.is_some() {
                return Err(Error::RegistryOperation(
                    "devices can only be created by ID".to_string(),
                ));
            }
            Ok((updated, fields))
        });
        state.commit(uid, wrapped)
    }

    async fn set_by_id(
        &self,
        application_id: &str,
        device_id: &str,
        f: DeviceMutator<'_>,
    ) -> Result<Option<EndDevice>> {
        let uid = format!("{}:{}", application_id, device_id);
        let mut state = self.state.write();
        let uid = state.devices.contains_key(&uid).then_some(uid);
        let application_id = application_id.to_string();
        let device_id = device_id.to_string();
        let wrapped: DeviceMutator<'_> = Box::new(move |stored| {
            let (updated, fields) = f(stored)?;
            if let (None, Some(dev)) = (stored, &updated) {
                if dev.ids.application_id != application_id || dev.ids.device_id != device_id {
                    return Err(Error::InvalidField(
                        "ids".to_string(),
                        "identifiers do not match the request".to_string(),
                    ));
                }
            }
            Ok((updated, fields))
        });
        state.commit(uid, wrapped)
    }

    async fn range_by_id(&self) -> Result<Vec<EndDeviceIdentifiers>> {
        Ok(self
            .state
            .read()
            .devices
            .values()
            .map(|d| d.ids.clone())
            .collect())
    }

    async fn batch_delete(
        &self,
        ids: &[EndDeviceIdentifiers],
    ) -> Result<Vec<EndDeviceIdentifiers>> {
        let mut state = self.state.write();
        let mut deleted = Vec::new();
        for id in ids {
            if let Some(dev) = state.devices.remove(&id.uid()) {
                state.unindex(&dev);
                deleted.push(dev.ids);
            }
        }
        debug!(count = deleted.len(), "Deleted devices");
        Ok(deleted)
    }
}

#[derive(Default)]
struct KeyState {
    records: HashMap<(Eui64, SessionKeyId), StoredSessionKeys>,
    /// Session key IDs per DevEUI, oldest first.
    by_dev_eui: HashMap<Eui64, VecDeque<SessionKeyId>>,
}

/// In-memory [`KeyRegistry`] with an optional per-device history bound.
#[derive(Default)]
pub struct MemKeyRegistry {
    state: RwLock<KeyState>,
    limit: Option<usize>,
}

impl MemKeyRegistry {
    /// `limit` bounds the number of session key records kept per device.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            state: RwLock::new(KeyState::default()),
            limit: limit.filter(|l| *l > 0),
        }
    }

    pub fn export(&self) -> Vec<StoredSessionKeys> {
        let state = self.state.read();
        state
            .by_dev_eui
            .iter()
            .flat_map(|(dev_eui, ids)| ids.iter().map(move |id| (*dev_eui, *id)))
            .filter_map(|key| state.records.get(&key).cloned())
            .collect()
    }

    pub fn restore(&self, mut records: Vec<StoredSessionKeys>) {
        records.sort_by_key(|r| (r.created_at, r.keys.session_key_id));
        let mut state = KeyState::default();
        for r in records {
            let key = (r.dev_eui, r.keys.session_key_id);
            state.by_dev_eui.entry(r.dev_eui).or_default().push_back(key.1);
            state.records.insert(key, r);
        }
        *self.state.write() = state;
    }
}

#[async_trait]
impl KeyRegistry for MemKeyRegistry {
    async fn get_by_id(&self, dev_eui: Eui64, id: SessionKeyId) -> Result<StoredSessionKeys> {
        self.state
            .read()
            .records
            .get(&(dev_eui, id))
            .cloned()
            .ok_or(Error::SessionKeysNotFound)
    }

    async fn set_by_id(
        &self,
        dev_eui: Eui64,
        id: SessionKeyId,
        f: KeysMutator<'_>,
    ) -> Result<Option<StoredSessionKeys>> {
        let mut state = self.state.write();
        let key = (dev_eui, id);
        let stored = state.records.get(&key);
        let existed = stored.is_some();

        match f(stored)? {
            Some(record) => {
                if record.dev_eui != dev_eui || record.keys.session_key_id != id {
                    return Err(Error::InvalidField(
                        "session_keys".to_string(),
                        "identifiers do not match the request".to_string(),
                    ));
                }
                state.records.insert(key, record.clone());
                if !existed {
                    state.by_dev_eui.entry(dev_eui).or_default().push_back(id);
                }
                Ok(Some(record))
            }
            None => {
                if existed {
                    state.records.remove(&key);
                    if let Some(ids) = state.by_dev_eui.get_mut(&dev_eui) {
                        ids.retain(|i| *i != id);
                    }
                }
                Ok(None)
            }
        }
    }

    async fn prune(&self, dev_eui: Eui64) -> Result<Vec<SessionKeyId>> {
        let limit = match self.limit {
            Some(limit) => limit,
            None => return Ok(Vec::new()),
        };
        let mut state = self.state.write();
        let evicted: Vec<SessionKeyId> = match state.by_dev_eui.get_mut(&dev_eui) {
            Some(ids) if ids.len() > limit => {
                let excess = ids.len() - limit;
                ids.drain(..excess).collect()
            }
            _ => return Ok(Vec::new()),
        };
        for old in &evicted {
            debug!(dev_eui = %dev_eui, session_key_id = %old, "Evicted session keys");
            state.records.remove(&(dev_eui, *old));
        }
        Ok(evicted)
    }

    async fn range_by_dev_eui(&self, dev_eui: Eui64) -> Result<Vec<SessionKeyId>> {
        Ok(self
            .state
            .read()
            .by_dev_eui
            .get(&dev_eui)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn delete_by_dev_eui(&self, dev_eui: Eui64) -> Result<()> {
        let mut state = self.state.write();
        if let Some(ids) = state.by_dev_eui.remove(&dev_eui) {
            for id in ids {
                state.records.remove(&(dev_eui, id));
            }
        }
        Ok(())
    }
}

/// In-memory [`AppActivationRegistry`].
#[derive(Default)]
pub struct MemAppActivationRegistry {
    settings: RwLock<BTreeMap<String, ApplicationActivationSettings>>,
}

impl MemAppActivationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export(&self) -> BTreeMap<String, ApplicationActivationSettings> {
        self.settings.read().clone()
    }

    pub fn restore(&self, settings: BTreeMap<String, ApplicationActivationSettings>) {
        *self.settings.write() = settings;
    }
}

#[async_trait]
impl AppActivationRegistry for MemAppActivationRegistry {
    async fn get_by_id(&self, application_id: &str) -> Result<ApplicationActivationSettings> {
        self.settings
            .read()
            .get(application_id)
            .cloned()
            .ok_or(Error::ApplicationActivationSettingsNotFound)
    }

    async fn set_by_id(
        &self,
        application_id: &str,
        f: SettingsMutator<'_>,
    ) -> Result<Option<ApplicationActivationSettings>> {
        let mut settings = self.settings.write();
        let stored = settings.get(application_id);
        let (updated, fields) = f(stored)?;
        match updated {
            Some(new) => {
                let mut next = stored.cloned().unwrap_or_default();
                next.apply_fields(&new, &fields);
                settings.insert(application_id.to_string(), next.clone());
                Ok(Some(next))
            }
            None => {
                settings.remove(application_id);
                Ok(None)
            }
        }
    }

    async fn range_by_id(&self) -> Result<Vec<String>> {
        Ok(self.settings.read().keys().cloned().collect())
    }

    async fn batch_delete(&self, application_ids: &[String]) -> Result<()> {
        let mut settings = self.settings.write();
        for id in application_ids {
            settings.remove(id);
        }
        Ok(())
    }
}

/// Serialized state of the in-memory registries.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub devices: Vec<EndDevice>,
    #[serde(default)]
    pub session_keys: Vec<StoredSessionKeys>,
    #[serde(default)]
    pub application_activation_settings: BTreeMap<String, ApplicationActivationSettings>,
}

impl Snapshot {
    pub fn capture(
        devices: &MemDeviceRegistry,
        keys: &MemKeyRegistry,
        settings: &MemAppActivationRegistry,
    ) -> Self {
        Self {
            devices: devices.export(),
            session_keys: keys.export(),
            application_activation_settings: settings.export(),
        }
    }

    pub fn apply(
        self,
        devices: &MemDeviceRegistry,
        keys: &MemKeyRegistry,
        settings: &MemAppActivationRegistry,
    ) -> Result<()> {
        devices.restore(self.devices)?;
        keys.restore(self.session_keys);
        settings.restore(self.application_activation_settings);
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::RegistryOperation(format!("failed to read snapshot {:?}: {}", path, e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| Error::RegistryOperation(format!("failed to parse snapshot: {}", e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::RegistryOperation(format!("failed to encode snapshot: {}", e)))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content).map_err(|e| {
            Error::RegistryOperation(format!("failed to write snapshot {:?}: {}", tmp, e))
        })?;
        std::fs::rename(&tmp, path).map_err(|e| {
            Error::RegistryOperation(format!("failed to move snapshot to {:?}: {}", path, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::keys::SessionKeys;
    use crate::registry::SettingsField;

    fn ids(app: &str, dev: &str, dev_eui: u64) -> EndDeviceIdentifiers {
        EndDeviceIdentifiers {
            application_id: app.to_string(),
            device_id: dev.to_string(),
            join_eui: Eui64::from(0x42FF_FFFF_FFFF_FFFF),
            dev_eui: Eui64::from(dev_eui),
        }
    }

    fn create(dev: EndDevice) -> DeviceMutator<'static> {
        Box::new(move |stored| {
            assert!(stored.is_none());
            Ok((Some(dev), DeviceField::ALL.to_vec()))
        })
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let reg = MemDeviceRegistry::new();
        let id = ids("app-1", "dev-1", 0x4242_FFFF_FFFF_FFFF);
        reg.set_by_id("app-1", "dev-1", create(EndDevice::new(id.clone())))
            .await
            .unwrap();

        let by_id = reg.get_by_id("app-1", "dev-1").await.unwrap();
        let by_eui = reg.get_by_eui(id.join_eui, id.dev_eui).await.unwrap();
        assert_eq!(by_id, by_eui);
        assert_eq!(reg.range_by_id().await.unwrap(), vec![id]);
        assert_eq!(
            reg.get_by_id("app-1", "dev-2").await.unwrap_err(),
            Error::DeviceNotFound
        );
    }

    #[tokio::test]
    async fn test_duplicate_identifiers() {
        let reg = MemDeviceRegistry::new();
        reg.set_by_id("app-1", "dev-1", create(EndDevice::new(ids("app-1", "dev-1", 1))))
            .await
            .unwrap();

        // Same EUIs under another device ID.
        let err = reg
            .set_by_id("app-1", "dev-2", create(EndDevice::new(ids("app-1", "dev-2", 1))))
            .await
            .unwrap_err();
        assert_eq!(err, Error::DuplicateIdentifiers);

        // Same provisioner unique ID.
        let mut a = EndDevice::new(ids("app-1", "dev-3", 3));
        a.provisioner_id = Some("unique-id".to_string());
        a.provisioner_unique_id = Some("abc".to_string());
        let mut b = EndDevice::new(ids("app-1", "dev-4", 4));
        b.provisioner_id = Some("unique-id".to_string());
        b.provisioner_unique_id = Some("abc".to_string());
        reg.set_by_id("app-1", "dev-3", create(a)).await.unwrap();
        let err = reg.set_by_id("app-1", "dev-4", create(b)).await.unwrap_err();
        assert_eq!(err, Error::DuplicateIdentifiers);
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test]
    async fn test_create_requires_euis() {
        let reg = MemDeviceRegistry::new();
        let mut id = ids("app-1", "dev-1", 1);
        id.join_eui = Eui64::ZERO;
        let err = reg
            .set_by_id("app-1", "dev-1", create(EndDevice::new(id)))
            .await
            .unwrap_err();
        assert_eq!(err, Error::NoJoinEui);
    }

    #[tokio::test]
    async fn test_set_by_eui_cannot_create() {
        let reg = MemDeviceRegistry::new();
        let id = ids("app-1", "dev-1", 1);
        let dev = EndDevice::new(id.clone());
        let err = reg
            .set_by_eui(
                id.join_eui,
                id.dev_eui,
                Box::new(move |_| Ok((Some(dev), vec![]))),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REGISTRY_OPERATION");
    }

    #[tokio::test]
    async fn test_update_fields_and_immutability() {
        let reg = MemDeviceRegistry::new();
        let id = ids("app-1", "dev-1", 1);
        reg.set_by_id("app-1", "dev-1", create(EndDevice::new(id.clone())))
            .await
            .unwrap();

        let updated = reg
            .set_by_eui(
                id.join_eui,
                id.dev_eui,
                Box::new(|stored| {
                    let mut dev = stored.cloned().ok_or(Error::DeviceNotFound)?;
                    dev.last_dev_nonce = 42;
                    dev.last_join_nonce = 9;
                    Ok((Some(dev), vec![DeviceField::LastDevNonce]))
                }),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.last_dev_nonce, 42);
        // Not in the field list.
        assert_eq!(updated.last_join_nonce, 0);

        for field in DeviceField::IMMUTABLE {
            let err = reg
                .set_by_id(
                    "app-1",
                    "dev-1",
                    Box::new(move |stored| {
                        let mut dev = stored.cloned().ok_or(Error::DeviceNotFound)?;
                        match field {
                            DeviceField::ApplicationId => dev.ids.application_id = "other".into(),
                            DeviceField::DeviceId => dev.ids.device_id = "other".into(),
                            DeviceField::JoinEui => dev.ids.join_eui = Eui64::from(7),
                            DeviceField::DevEui => dev.ids.dev_eui = Eui64::from(7),
                            DeviceField::ProvisionerId => dev.provisioner_id = Some("p".into()),
                            _ => dev.provisioning_data = Some(serde_json::json!({"a": 1})),
                        }
                        Ok((Some(dev), vec![field]))
                    }),
                )
                .await
                .unwrap_err();
            assert_eq!(err, Error::ImmutableField(field.path().to_string()));
        }
        assert_eq!(
            reg.get_by_id("app-1", "dev-1").await.unwrap().last_dev_nonce,
            42
        );
    }

    #[tokio::test]
    async fn test_delete_and_batch_delete() {
        let reg = MemDeviceRegistry::new();
        let a = ids("app-1", "dev-1", 1);
        let b = ids("app-1", "dev-2", 2);
        reg.set_by_id("app-1", "dev-1", create(EndDevice::new(a.clone())))
            .await
            .unwrap();
        reg.set_by_id("app-1", "dev-2", create(EndDevice::new(b.clone())))
            .await
            .unwrap();

        let res = reg
            .set_by_id("app-1", "dev-1", Box::new(|_| Ok((None, vec![]))))
            .await
            .unwrap();
        assert!(res.is_none());
        assert!(reg.get_by_eui(a.join_eui, a.dev_eui).await.is_err());

        let deleted = reg.batch_delete(&[a, b.clone()]).await.unwrap();
        assert_eq!(deleted, vec![b]);
        assert!(reg.is_empty());
    }

    fn keys(dev_eui: Eui64, n: u128) -> StoredSessionKeys {
        StoredSessionKeys {
            join_eui: Eui64::from(0x42FF_FFFF_FFFF_FFFF),
            dev_eui,
            keys: SessionKeys {
                session_key_id: SessionKeyId::from(ulid::Ulid::from(n)),
                f_nwk_s_int_key: None,
                s_nwk_s_int_key: None,
                nwk_s_enc_key: None,
                app_s_key: None,
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_key_registry_limit() {
        let reg = MemKeyRegistry::new(Some(2));
        let dev_eui = Eui64::from(1);
        for n in 1..=3u128 {
            let record = keys(dev_eui, n);
            let id = record.keys.session_key_id;
            reg.set_by_id(dev_eui, id, Box::new(move |_| Ok(Some(record))))
                .await
                .unwrap();
        }

        // Inserts keep everything until the history is pruned.
        assert_eq!(reg.range_by_dev_eui(dev_eui).await.unwrap().len(), 3);
        let oldest = SessionKeyId::from(ulid::Ulid::from(1u128));
        assert_eq!(reg.prune(dev_eui).await.unwrap(), vec![oldest]);
        assert!(reg.prune(dev_eui).await.unwrap().is_empty());

        let ids = reg.range_by_dev_eui(dev_eui).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&oldest));
        assert_eq!(
            reg.get_by_id(dev_eui, oldest).await.unwrap_err(),
            Error::SessionKeysNotFound
        );
        assert!(reg.get_by_id(dev_eui, ids[1]).await.is_ok());

        reg.delete_by_dev_eui(dev_eui).await.unwrap();
        assert!(reg.range_by_dev_eui(dev_eui).await.unwrap().is_empty());
        assert!(reg.export().is_empty());
    }

    #[tokio::test]
    async fn test_app_activation_registry() {
        let reg = MemAppActivationRegistry::new();
        assert_eq!(
            reg.get_by_id("app-1").await.unwrap_err(),
            Error::ApplicationActivationSettingsNotFound
        );

        let settings = ApplicationActivationSettings {
            application_server_id: Some("as.example".to_string()),
            home_net_id: Some("42FFFF".parse().unwrap()),
            kek_label: None,
            kek: None,
        };
        reg.set_by_id(
            "app-1",
            Box::new(move |_| {
                Ok((
                    Some(settings),
                    vec![SettingsField::ApplicationServerId],
                ))
            }),
        )
        .await
        .unwrap();

        let stored = reg.get_by_id("app-1").await.unwrap();
        assert_eq!(stored.application_server_id.as_deref(), Some("as.example"));
        // Not in the field list.
        assert_eq!(stored.home_net_id, None);

        reg.batch_delete(&["app-1".to_string()]).await.unwrap();
        assert!(reg.range_by_id().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let devices = MemDeviceRegistry::new();
        let keys_reg = MemKeyRegistry::new(None);
        let settings = MemAppActivationRegistry::new();
        devices
            .set_by_id("app-1", "dev-1", create(EndDevice::new(ids("app-1", "dev-1", 1))))
            .await
            .unwrap();
        let record = keys(Eui64::from(1), 5);
        let id = record.keys.session_key_id;
        keys_reg
            .set_by_id(Eui64::from(1), id, Box::new(move |_| Ok(Some(record))))
            .await
            .unwrap();

        let json = serde_json::to_string(&Snapshot::capture(&devices, &keys_reg, &settings)).unwrap();
        let snapshot: Snapshot = serde_json::from_str(&json).unwrap();

        let devices2 = MemDeviceRegistry::new();
        let keys2 = MemKeyRegistry::new(None);
        let settings2 = MemAppActivationRegistry::new();
        snapshot.apply(&devices2, &keys2, &settings2).unwrap();
        assert_eq!(devices2.export(), devices.export());
        assert!(keys2.get_by_id(Eui64::from(1), id).await.is_ok());
    }

    #[tokio::test]
    async fn test_restore_rejects_duplicate_provisioner_ids() {
        let reg = MemDeviceRegistry::new();
        reg.set_by_id("app-1", "dev-1", create(EndDevice::new(ids("app-1", "dev-1", 1))))
            .await
            .unwrap();

        let provisioned = |dev: &str, dev_eui| {
            let mut d = EndDevice::new(ids("app-1", dev, dev_eui));
            d.provisioner_id = Some("unique-id".to_string());
            d.provisioner_unique_id = Some("abc".to_string());
            d
        };
        let err = reg
            .restore(vec![provisioned("dev-2", 2), provisioned("dev-3", 3)])
            .unwrap_err();
        assert_eq!(err, Error::DuplicateIdentifiers);
        // A rejected snapshot leaves the registry as it was.
        assert_eq!(reg.len(), 1);
        assert!(reg.get_by_id("app-1", "dev-1").await.is_ok());

        reg.restore(vec![provisioned("dev-2", 2)]).unwrap();
        assert_eq!(reg.len(), 1);
    }
}
