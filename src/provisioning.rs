//! Device provisioners
//!
//! A provisioner interprets the opaque `provisioning_data` a manufacturer
//! attaches to a device and extracts an identifier that is unique among the
//! devices it provisioned (a secure element serial, for instance).

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};

pub trait Provisioner: Send + Sync {
    /// Unique ID of the device described by `data`.
    fn unique_id(&self, data: &serde_json::Value) -> Result<String>;
}

/// Reads the `unique_id` string field.
pub struct UniqueIdProvisioner;

pub const UNIQUE_ID_PROVISIONER: &str = "unique-id";

impl Provisioner for UniqueIdProvisioner {
    fn unique_id(&self, data: &serde_json::Value) -> Result<String> {
        match data.get("unique_id") {
            Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id.clone()),
            Some(_) => Err(Error::InvalidField(
                "provisioning_data.unique_id".to_string(),
                "must be a non-empty string".to_string(),
            )),
            None => Err(Error::InvalidField(
                "provisioning_data.unique_id".to_string(),
                "missing".to_string(),
            )),
        }
    }
}

/// Provisioners by ID.
#[derive(Clone)]
pub struct Provisioners {
    by_id: HashMap<String, Arc<dyn Provisioner>>,
}

impl Default for Provisioners {
    fn default() -> Self {
        let mut p = Self::empty();
        p.register(UNIQUE_ID_PROVISIONER, Arc::new(UniqueIdProvisioner));
        p
    }
}

impl Provisioners {
    pub fn empty() -> Self {
        Self {
            by_id: HashMap::new(),
        }
    }

    pub fn register(&mut self, id: &str, provisioner: Arc<dyn Provisioner>) {
        self.by_id.insert(id.to_string(), provisioner);
    }

    pub fn get(&self, id: &str) -> Result<&Arc<dyn Provisioner>> {
        self.by_id
            .get(id)
            .ok_or_else(|| Error::ProvisionerNotFound(id.to_string()))
    }

    /// Unique ID for a device provisioned by `id`. Devices without
    /// provisioning data have none.
    pub fn unique_id(&self, id: &str, data: Option<&serde_json::Value>) -> Result<Option<String>> {
        let provisioner = self.get(id)?;
        data.map(|d| provisioner.unique_id(d)).transpose()
    }
}
