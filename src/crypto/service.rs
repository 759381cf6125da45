//! Crypto service seam
//!
//! The join engine never touches root keys directly: it asks a
//! [`CryptoService`] for MICs, join-accept encryption and session keys. The
//! in-process implementation ([`super::local::LocalCryptoService`]) unwraps
//! root keys through the key vault; the remote one forwards every operation
//! to an external crypto server. Derived session keys come back as
//! envelopes, wrapped or not, and the caller unwraps them with its own vault.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::lorawan::keys::{KeyEnvelope, RootKeys};
use crate::lorawan::{Eui64, MacVersion, NetId};

/// The subset of a device record a crypto service needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryptoDevice {
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_data: Option<serde_json::Value>,
    /// Absent when the crypto server holds the root keys itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_keys: Option<RootKeys>,
}

/// Network session keys derived by a join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NwkSKeys {
    pub f_nwk_s_int_key: KeyEnvelope,
    pub s_nwk_s_int_key: KeyEnvelope,
    pub nwk_s_enc_key: KeyEnvelope,
}

#[async_trait]
pub trait CryptoService: Send + Sync {
    /// MIC over the first 19 bytes of a join-request.
    async fn join_request_mic(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        payload: &[u8],
    ) -> Result<[u8; 4]>;

    /// MIC of a join-accept. `payload` is MHDR..CFList; `join_req_type` and
    /// `dev_nonce` only enter the 1.1 computation.
    async fn join_accept_mic(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        join_req_type: u8,
        dev_nonce: u16,
        payload: &[u8],
    ) -> Result<[u8; 4]>;

    /// Encrypt a join-accept body (after MHDR, MIC included).
    async fn encrypt_join_accept(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        payload: &[u8],
    ) -> Result<Vec<u8>>;

    /// Encrypt a rejoin-accept body with JSEncKey.
    async fn encrypt_rejoin_accept(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        payload: &[u8],
    ) -> Result<Vec<u8>>;

    async fn derive_nwk_s_keys(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        join_nonce: u32,
        dev_nonce: u16,
        net_id: NetId,
    ) -> Result<NwkSKeys>;

    async fn derive_app_s_key(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        join_nonce: u32,
        dev_nonce: u16,
        net_id: NetId,
    ) -> Result<KeyEnvelope>;
}
