//! End device CRUD and bulk provisioning

use tracing::{debug, info};

use super::JoinServer;
use crate::auth::{Authorizer, Context, Right};
use crate::error::{Error, Result};
use crate::lorawan::keys::{KeyEnvelope, RootKeys};
use crate::registry::{DeviceField, EndDevice};

/// LoRaWAN 1.1 devices derive network keys from the NwkKey.
fn check_root_keys(dev: &EndDevice) -> Result<()> {
    match &dev.root_keys {
        Some(keys) if dev.lorawan_version.is_1_1() && keys.nwk_key.is_none() => {
            Err(Error::NoNwkKey)
        }
        _ => Ok(()),
    }
}

impl JoinServer {
    /// Read a device. Only `fields` are populated; root keys are returned in
    /// plaintext.
    pub async fn get_device(
        &self,
        ctx: &Context,
        authorizer: &Authorizer,
        application_id: &str,
        device_id: &str,
        fields: &[DeviceField],
    ) -> Result<EndDevice> {
        let mut rights = vec![Right::ApplicationDevicesRead];
        if fields.contains(&DeviceField::RootKeys) {
            rights.push(Right::ApplicationDevicesReadKeys);
        }
        self.require_rights(ctx, authorizer, application_id, &rights)
            .await?;

        let mut dev = self
            .devices
            .get_by_id(application_id, device_id)
            .await?
            .masked(fields);
        if let Some(keys) = dev.root_keys.take() {
            dev.root_keys = Some(RootKeys {
                root_key_id: keys.root_key_id,
                app_key: self.unwrap_at_rest(keys.app_key).await?,
                nwk_key: self.unwrap_at_rest(keys.nwk_key).await?,
            });
        }
        Ok(dev)
    }

    /// Create or update a device. On update only `fields` are written.
    pub async fn set_device(
        &self,
        ctx: &Context,
        authorizer: &Authorizer,
        device: EndDevice,
        fields: &[DeviceField],
    ) -> Result<EndDevice> {
        let mut rights = vec![Right::ApplicationDevicesWrite];
        if fields.contains(&DeviceField::RootKeys) {
            rights.push(Right::ApplicationDevicesWriteKeys);
        }
        self.require_rights(ctx, authorizer, &device.ids.application_id, &rights)
            .await?;

        let ids = device.ids.clone();
        let dev = self.store_device(device, fields).await?;
        info!(device = %ids, "Device stored");
        Ok(dev.masked(fields))
    }

    /// Delete a device and every session key issued to it.
    pub async fn delete_device(
        &self,
        ctx: &Context,
        authorizer: &Authorizer,
        application_id: &str,
        device_id: &str,
    ) -> Result<()> {
        self.require_rights(
            ctx,
            authorizer,
            application_id,
            &[Right::ApplicationDevicesWrite],
        )
        .await?;

        // EUIs are immutable, so the DevEUI read here is the one deleted below.
        let dev = self.devices.get_by_id(application_id, device_id).await?;
        self.devices
            .set_by_id(
                application_id,
                device_id,
                Box::new(|stored| match stored {
                    Some(_) => Ok((None, Vec::new())),
                    None => Err(Error::DeviceNotFound),
                }),
            )
            .await?;
        self.keys.delete_by_dev_eui(dev.ids.dev_eui).await?;
        info!(device = %dev.ids, "Device deleted");
        Ok(())
    }

    /// Import devices that do not exist yet. Existing devices are left
    /// untouched. Returns the number of devices created.
    pub async fn provision(&self, devices: Vec<EndDevice>) -> Result<usize> {
        let mut created = 0;
        for dev in devices {
            match self
                .devices
                .get_by_id(&dev.ids.application_id, &dev.ids.device_id)
                .await
            {
                Ok(_) => {
                    debug!(device = %dev.ids, "Device already provisioned");
                    continue;
                }
                Err(Error::DeviceNotFound) => {}
                Err(err) => return Err(err),
            }
            self.store_device(dev, &DeviceField::ALL).await?;
            created += 1;
        }
        info!(count = created, "Provisioned devices");
        Ok(created)
    }

    async fn store_device(&self, mut device: EndDevice, fields: &[DeviceField]) -> Result<EndDevice> {
        if fields.contains(&DeviceField::RootKeys) {
            if let Some(mut keys) = device.root_keys.take() {
                keys.app_key = self.wrap_at_rest(keys.app_key).await?;
                keys.nwk_key = self.wrap_at_rest(keys.nwk_key).await?;
                device.root_keys = Some(keys);
            }
        }

        let provisioners = &self.provisioners;
        let ids = device.ids.clone();
        let fields = fields.to_vec();
        self.devices
            .set_by_id(
                &ids.application_id,
                &ids.device_id,
                Box::new(move |stored| {
                    let merged = match stored {
                        Some(stored) => {
                            let mut merged = stored.clone();
                            merged.apply_fields(&device, &fields);
                            merged
                        }
                        None => {
                            let mut created = EndDevice::new(device.ids.clone());
                            created.apply_fields(&device, &fields);
                            if let Some(provisioner_id) = &created.provisioner_id {
                                created.provisioner_unique_id = provisioners
                                    .unique_id(provisioner_id, created.provisioning_data.as_ref())?;
                            }
                            created
                        }
                    };
                    check_root_keys(&merged)?;
                    Ok((Some(merged), fields))
                }),
            )
            .await?
            .ok_or(Error::DeviceNotFound)
    }

    /// Wrap a plaintext key with the device KEK for storage.
    pub(super) async fn wrap_at_rest(&self, key: Option<KeyEnvelope>) -> Result<Option<KeyEnvelope>> {
        match key {
            Some(KeyEnvelope::Plain { key }) => self
                .key_vault
                .wrap(&key, &self.config.device_kek_label)
                .await
                .map(Some),
            other => Ok(other),
        }
    }

    pub(super) async fn unwrap_at_rest(
        &self,
        key: Option<KeyEnvelope>,
    ) -> Result<Option<KeyEnvelope>> {
        match key {
            Some(envelope) => Ok(Some(KeyEnvelope::plain(
                self.key_vault.unwrap(&envelope).await?,
            ))),
            None => Ok(None),
        }
    }
}
