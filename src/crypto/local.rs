//! In-process crypto service holding root keys through the key vault.

use async_trait::async_trait;
use std::sync::Arc;

use super::service::{CryptoDevice, CryptoService, NwkSKeys};
use crate::error::{Error, Result};
use crate::keyvault::KeyVault;
use crate::lorawan::keys::{AesKey, KeyEnvelope};
use crate::lorawan::{MacVersion, NetId};

pub struct LocalCryptoService {
    key_vault: Arc<dyn KeyVault>,
}

impl LocalCryptoService {
    pub fn new(key_vault: Arc<dyn KeyVault>) -> Self {
        Self { key_vault }
    }

    async fn nwk_key(&self, dev: &CryptoDevice) -> Result<AesKey> {
        let env = dev
            .root_keys
            .as_ref()
            .and_then(|k| k.nwk_key.as_ref())
            .ok_or(Error::NoNwkKey)?;
        self.key_vault.unwrap(env).await
    }

    async fn app_key(&self, dev: &CryptoDevice) -> Result<AesKey> {
        let env = dev
            .root_keys
            .as_ref()
            .and_then(|k| k.app_key.as_ref())
            .ok_or(Error::NoAppKey)?;
        self.key_vault.unwrap(env).await
    }
}

fn check_version(version: MacVersion) -> Result<()> {
    if version.is_supported() {
        Ok(())
    } else {
        Err(Error::UnsupportedMacVersion(version.to_string()))
    }
}

#[async_trait]
impl CryptoService for LocalCryptoService {
    async fn join_request_mic(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        payload: &[u8],
    ) -> Result<[u8; 4]> {
        check_version(version)?;
        let key = if version.is_1_1() {
            self.nwk_key(dev).await?
        } else {
            self.app_key(dev).await?
        };
        super::compute_join_request_mic(&key, payload)
    }

    async fn join_accept_mic(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        join_req_type: u8,
        dev_nonce: u16,
        payload: &[u8],
    ) -> Result<[u8; 4]> {
        check_version(version)?;
        if version.is_1_1() {
            let nwk_key = self.nwk_key(dev).await?;
            let js_int_key = super::derive_js_int_key(&nwk_key, dev.dev_eui);
            Ok(super::compute_join_accept_mic(
                &js_int_key,
                join_req_type,
                dev.join_eui,
                dev_nonce,
                payload,
            ))
        } else {
            let app_key = self.app_key(dev).await?;
            Ok(super::compute_legacy_join_accept_mic(&app_key, payload))
        }
    }

    async fn encrypt_join_accept(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        check_version(version)?;
        let key = if version.is_1_1() {
            self.nwk_key(dev).await?
        } else {
            self.app_key(dev).await?
        };
        super::encrypt_join_accept(&key, payload)
    }

    async fn encrypt_rejoin_accept(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        if !version.is_1_1() {
            return Err(Error::UnsupportedMacVersion(version.to_string()));
        }
        let nwk_key = self.nwk_key(dev).await?;
        let js_enc_key = super::derive_js_enc_key(&nwk_key, dev.dev_eui);
        super::encrypt_join_accept(&js_enc_key, payload)
    }

    async fn derive_nwk_s_keys(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        join_nonce: u32,
        dev_nonce: u16,
        net_id: NetId,
    ) -> Result<NwkSKeys> {
        check_version(version)?;
        if version.is_1_1() {
            let nwk_key = self.nwk_key(dev).await?;
            Ok(NwkSKeys {
                f_nwk_s_int_key: KeyEnvelope::plain(super::derive_f_nwk_s_int_key(
                    &nwk_key,
                    join_nonce,
                    dev.join_eui,
                    dev_nonce,
                )),
                s_nwk_s_int_key: KeyEnvelope::plain(super::derive_s_nwk_s_int_key(
                    &nwk_key,
                    join_nonce,
                    dev.join_eui,
                    dev_nonce,
                )),
                nwk_s_enc_key: KeyEnvelope::plain(super::derive_nwk_s_enc_key(
                    &nwk_key,
                    join_nonce,
                    dev.join_eui,
                    dev_nonce,
                )),
            })
        } else {
            let app_key = self.app_key(dev).await?;
            let nwk_s_key = KeyEnvelope::plain(super::derive_legacy_nwk_s_key(
                &app_key, join_nonce, net_id, dev_nonce,
            ));
            Ok(NwkSKeys {
                f_nwk_s_int_key: nwk_s_key.clone(),
                s_nwk_s_int_key: nwk_s_key.clone(),
                nwk_s_enc_key: nwk_s_key,
            })
        }
    }

    async fn derive_app_s_key(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        join_nonce: u32,
        dev_nonce: u16,
        net_id: NetId,
    ) -> Result<KeyEnvelope> {
        check_version(version)?;
        let app_key = self.app_key(dev).await?;
        let key = if version.is_1_1() {
            super::derive_app_s_key(&app_key, join_nonce, dev.join_eui, dev_nonce)
        } else {
            super::derive_legacy_app_s_key(&app_key, join_nonce, net_id, dev_nonce)
        };
        Ok(KeyEnvelope::plain(key))
    }
}
