//! Key vault: wraps and unwraps AES-128 keys under named KEKs
//!
//! The Join Server only sees the vault through the [`KeyVault`] trait. The
//! in-memory implementation holds KEKs loaded from configuration; production
//! deployments plug in an HSM or cloud KMS behind the same trait.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

use crate::crypto::keywrap;
use crate::error::{Error, Result};
use crate::lorawan::keys::{AesKey, KeyEnvelope};

#[async_trait]
pub trait KeyVault: Send + Sync {
    /// Wrap `key` under the KEK named `kek_label`. An empty label returns a
    /// plaintext envelope.
    async fn wrap(&self, key: &AesKey, kek_label: &str) -> Result<KeyEnvelope>;

    /// Recover the plaintext key of an envelope.
    async fn unwrap(&self, envelope: &KeyEnvelope) -> Result<AesKey>;

    /// Whether a KEK named `kek_label` is available.
    fn has_kek(&self, kek_label: &str) -> bool;
}

/// Wrap `key` under `kek_label` when the vault has that KEK, otherwise
/// return it in plaintext. Peers without a provisioned KEK receive plaintext
/// keys over their authenticated channel.
pub async fn wrap_if_kek_exists(
    vault: &dyn KeyVault,
    key: &AesKey,
    kek_label: &str,
) -> Result<KeyEnvelope> {
    if kek_label.is_empty() || !vault.has_kek(kek_label) {
        return Ok(KeyEnvelope::plain(key.clone()));
    }
    vault.wrap(key, kek_label).await
}

/// In-memory KEK store.
#[derive(Default)]
pub struct MemKeyVault {
    keks: HashMap<String, AesKey>,
}

impl MemKeyVault {
    pub fn new(keks: HashMap<String, AesKey>) -> Self {
        Self { keks }
    }

    pub fn with_kek(mut self, label: impl Into<String>, kek: AesKey) -> Self {
        self.keks.insert(label.into(), kek);
        self
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.keks.keys().map(String::as_str)
    }
}

#[async_trait]
impl KeyVault for MemKeyVault {
    async fn wrap(&self, key: &AesKey, kek_label: &str) -> Result<KeyEnvelope> {
        if kek_label.is_empty() {
            return Ok(KeyEnvelope::plain(key.clone()));
        }
        let kek = self
            .keks
            .get(kek_label)
            .ok_or_else(|| Error::WrapKey(format!("KEK `{}` not found", kek_label)))?;
        let encrypted_key = keywrap::wrap_key(kek, key)?;
        debug!(kek_label, "Wrapped key");
        Ok(KeyEnvelope::Wrapped {
            kek_label: kek_label.to_string(),
            encrypted_key,
        })
    }

    async fn unwrap(&self, envelope: &KeyEnvelope) -> Result<AesKey> {
        match envelope {
            KeyEnvelope::Plain { key } => Ok(key.clone()),
            KeyEnvelope::Wrapped {
                kek_label,
                encrypted_key,
            } => {
                let kek = self
                    .keks
                    .get(kek_label)
                    .ok_or_else(|| Error::UnwrapKey(format!("KEK `{}` not found", kek_label)))?;
                keywrap::unwrap_key(kek, encrypted_key)
            }
        }
    }

    fn has_kek(&self, kek_label: &str) -> bool {
        self.keks.contains_key(kek_label)
    }
}

/// Wrap `key` directly with a plaintext KEK (used for per-application KEKs
/// that live in the activation settings rather than in the vault).
pub fn wrap_with_kek(key: &AesKey, kek_label: &str, kek: &AesKey) -> Result<KeyEnvelope> {
    Ok(KeyEnvelope::Wrapped {
        kek_label: kek_label.to_string(),
        encrypted_key: keywrap::wrap_key(kek, key)?,
    })
}
