//! LoRaWAN cryptographic primitives
//!
//! Bit-exact implementations of the join procedure's MIC computation,
//! join-accept encryption and session key derivation (LoRaWAN 1.0.x and
//! 1.1), built on AES-128 and AES-CMAC.
//!
//! Key derivation encrypts a single block `type || context || 0-padding`
//! with the root key. Multi-byte context fields are little-endian, as on
//! the air.

pub mod keywrap;
pub mod local;
#[cfg(feature = "remote")]
pub mod remote;
pub mod service;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::error::Error;
use crate::lorawan::keys::AesKey;
use crate::lorawan::{Eui64, NetId};

pub use service::{CryptoDevice, CryptoService, NwkSKeys};

/// AES block size in bytes.
pub const BLOCK_LEN: usize = 16;

/// Key derivation type bytes.
mod key_type {
    pub const F_NWK_S_INT_KEY: u8 = 0x01;
    pub const APP_S_KEY: u8 = 0x02;
    pub const S_NWK_S_INT_KEY: u8 = 0x03;
    pub const NWK_S_ENC_KEY: u8 = 0x04;
    pub const JS_ENC_KEY: u8 = 0x05;
    pub const JS_INT_KEY: u8 = 0x06;

    pub const LEGACY_NWK_S_KEY: u8 = 0x01;
    pub const LEGACY_APP_S_KEY: u8 = 0x02;
}

fn cipher(key: &AesKey) -> Aes128 {
    Aes128::new(GenericArray::from_slice(key.as_bytes()))
}

fn cmac(key: &AesKey, parts: &[&[u8]]) -> [u8; BLOCK_LEN] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key.as_bytes()));
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

fn truncate_mic(full: [u8; BLOCK_LEN]) -> [u8; 4] {
    [full[0], full[1], full[2], full[3]]
}

/// Encrypt one derivation block with `key`.
fn derive_key(key: &AesKey, key_type: u8, context: &[&[u8]]) -> AesKey {
    let mut block = [0u8; BLOCK_LEN];
    block[0] = key_type;
    let mut offset = 1;
    for part in context {
        block[offset..offset + part.len()].copy_from_slice(part);
        offset += part.len();
    }
    cipher(key).encrypt_block(GenericArray::from_mut_slice(&mut block));
    AesKey(block)
}

fn join_nonce_le(join_nonce: u32) -> [u8; 3] {
    let b = join_nonce.to_le_bytes();
    [b[0], b[1], b[2]]
}

/// MIC of a join-request: AES-CMAC over MHDR..DevNonce (the first 19 bytes).
pub fn compute_join_request_mic(key: &AesKey, payload: &[u8]) -> Result<[u8; 4], Error> {
    if payload.len() < 19 {
        return Err(Error::ComputeMic(format!(
            "join-request too short: {} bytes",
            payload.len()
        )));
    }
    Ok(truncate_mic(cmac(key, &[&payload[..19]])))
}

/// MIC of a LoRaWAN 1.0.x join-accept: AES-CMAC(AppKey, MHDR..CFList).
pub fn compute_legacy_join_accept_mic(app_key: &AesKey, payload: &[u8]) -> [u8; 4] {
    truncate_mic(cmac(app_key, &[payload]))
}

/// MIC of a LoRaWAN 1.1 join-accept:
/// AES-CMAC(JSIntKey, JoinReqType | JoinEUI | DevNonce | MHDR..CFList).
pub fn compute_join_accept_mic(
    js_int_key: &AesKey,
    join_req_type: u8,
    join_eui: Eui64,
    dev_nonce: u16,
    payload: &[u8],
) -> [u8; 4] {
    truncate_mic(cmac(
        js_int_key,
        &[
            &[join_req_type],
            &join_eui.to_le_bytes(),
            &dev_nonce.to_le_bytes(),
            payload,
        ],
    ))
}

/// Encrypt a join-accept body (everything after the MHDR, MIC included).
///
/// The network side runs AES *decrypt* so that the device only needs the
/// AES encrypt primitive to recover the plaintext.
pub fn encrypt_join_accept(key: &AesKey, payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.is_empty() || payload.len() % BLOCK_LEN != 0 {
        return Err(Error::EncryptPayload(format!(
            "join-accept body must be a multiple of {} bytes, got {}",
            BLOCK_LEN,
            payload.len()
        )));
    }
    let cipher = cipher(key);
    let mut out = payload.to_vec();
    for block in out.chunks_exact_mut(BLOCK_LEN) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(out)
}

/// Inverse of [`encrypt_join_accept`], as performed by the device.
pub fn decrypt_join_accept(key: &AesKey, payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.is_empty() || payload.len() % BLOCK_LEN != 0 {
        return Err(Error::DecodePayload(format!(
            "encrypted join-accept body must be a multiple of {} bytes, got {}",
            BLOCK_LEN,
            payload.len()
        )));
    }
    let cipher = cipher(key);
    let mut out = payload.to_vec();
    for block in out.chunks_exact_mut(BLOCK_LEN) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(out)
}

pub fn derive_js_int_key(nwk_key: &AesKey, dev_eui: Eui64) -> AesKey {
    derive_key(nwk_key, key_type::JS_INT_KEY, &[&dev_eui.to_le_bytes()])
}

pub fn derive_js_enc_key(nwk_key: &AesKey, dev_eui: Eui64) -> AesKey {
    derive_key(nwk_key, key_type::JS_ENC_KEY, &[&dev_eui.to_le_bytes()])
}

fn derive_session_key(
    key: &AesKey,
    key_type: u8,
    join_nonce: u32,
    join_eui: Eui64,
    dev_nonce: u16,
) -> AesKey {
    derive_key(
        key,
        key_type,
        &[
            &join_nonce_le(join_nonce),
            &join_eui.to_le_bytes(),
            &dev_nonce.to_le_bytes(),
        ],
    )
}

pub fn derive_f_nwk_s_int_key(nwk_key: &AesKey, join_nonce: u32, join_eui: Eui64, dev_nonce: u16) -> AesKey {
    derive_session_key(nwk_key, key_type::F_NWK_S_INT_KEY, join_nonce, join_eui, dev_nonce)
}

pub fn derive_s_nwk_s_int_key(nwk_key: &AesKey, join_nonce: u32, join_eui: Eui64, dev_nonce: u16) -> AesKey {
    derive_session_key(nwk_key, key_type::S_NWK_S_INT_KEY, join_nonce, join_eui, dev_nonce)
}

pub fn derive_nwk_s_enc_key(nwk_key: &AesKey, join_nonce: u32, join_eui: Eui64, dev_nonce: u16) -> AesKey {
    derive_session_key(nwk_key, key_type::NWK_S_ENC_KEY, join_nonce, join_eui, dev_nonce)
}

pub fn derive_app_s_key(app_key: &AesKey, join_nonce: u32, join_eui: Eui64, dev_nonce: u16) -> AesKey {
    derive_session_key(app_key, key_type::APP_S_KEY, join_nonce, join_eui, dev_nonce)
}

fn derive_legacy_session_key(
    app_key: &AesKey,
    key_type: u8,
    join_nonce: u32,
    net_id: NetId,
    dev_nonce: u16,
) -> AesKey {
    derive_key(
        app_key,
        key_type,
        &[
            &join_nonce_le(join_nonce),
            &net_id.to_le_bytes(),
            &dev_nonce.to_le_bytes(),
        ],
    )
}

pub fn derive_legacy_nwk_s_key(app_key: &AesKey, join_nonce: u32, net_id: NetId, dev_nonce: u16) -> AesKey {
    derive_legacy_session_key(app_key, key_type::LEGACY_NWK_S_KEY, join_nonce, net_id, dev_nonce)
}

pub fn derive_legacy_app_s_key(app_key: &AesKey, join_nonce: u32, net_id: NetId, dev_nonce: u16) -> AesKey {
    derive_legacy_session_key(app_key, key_type::LEGACY_APP_S_KEY, join_nonce, net_id, dev_nonce)
}
