//! LoRaWAN key material: AES-128 keys, key envelopes, root and session keys
//!
//! Keys travel through the Join Server inside [`KeyEnvelope`]s. An envelope is
//! either wrapped under a named KEK or carries the plaintext key; the latter
//! is only used in process or towards authenticated peers without a KEK.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::Eui64;
use crate::error::Error;

pub const AES_KEY_LEN: usize = 16;

/// AES-128 key. Zeroed on drop; `Debug` never prints the key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(try_from = "String", into = "String")]
pub struct AesKey(pub [u8; AES_KEY_LEN]);

impl AesKey {
    pub fn as_bytes(&self) -> &[u8; AES_KEY_LEN] {
        &self.0
    }

    /// Upper-case hex of the key. Only for serialization towards callers
    /// that are entitled to the plaintext.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(<redacted>)")
    }
}

impl From<[u8; AES_KEY_LEN]> for AesKey {
    fn from(v: [u8; AES_KEY_LEN]) -> Self {
        AesKey(v)
    }
}

impl FromStr for AesKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = Zeroizing::new(
            hex::decode(s.trim()).map_err(|e| Error::InvalidField("key".to_string(), e.to_string()))?,
        );
        let key: [u8; AES_KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            Error::InvalidField("key".to_string(), format!("expected 16 bytes, got {}", bytes.len()))
        })?;
        Ok(AesKey(key))
    }
}

impl TryFrom<String> for AesKey {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AesKey> for String {
    fn from(v: AesKey) -> Self {
        v.to_hex()
    }
}

/// A key as it is stored and exchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyEnvelope {
    /// Key wrapped (RFC 3394) under the KEK named by `kek_label`.
    Wrapped {
        kek_label: String,
        #[serde(with = "hex_bytes")]
        encrypted_key: Vec<u8>,
    },
    /// Plaintext key.
    Plain { key: AesKey },
}

impl KeyEnvelope {
    pub fn plain(key: AesKey) -> Self {
        KeyEnvelope::Plain { key }
    }

    pub fn is_wrapped(&self) -> bool {
        matches!(self, KeyEnvelope::Wrapped { .. })
    }

    pub fn kek_label(&self) -> Option<&str> {
        match self {
            KeyEnvelope::Wrapped { kek_label, .. } => Some(kek_label),
            KeyEnvelope::Plain { .. } => None,
        }
    }
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode_upper(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Device root keys, stored wrapped.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RootKeys {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_key: Option<KeyEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nwk_key: Option<KeyEnvelope>,
}

/// Session key identifier: a 128-bit ULID, displayed in its canonical
/// 26-character form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionKeyId(pub [u8; 16]);

impl SessionKeyId {
    pub fn as_ulid(&self) -> ulid::Ulid {
        ulid::Ulid::from(u128::from_be_bytes(self.0))
    }
}

impl From<ulid::Ulid> for SessionKeyId {
    fn from(id: ulid::Ulid) -> Self {
        SessionKeyId(u128::from(id).to_be_bytes())
    }
}

impl fmt::Display for SessionKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ulid())
    }
}

impl fmt::Debug for SessionKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKeyId({})", self.as_ulid())
    }
}

impl FromStr for SessionKeyId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(id) = ulid::Ulid::from_string(s) {
            return Ok(id.into());
        }
        // Backend-Interfaces peers send the raw 16 bytes as hex.
        let bytes = hex::decode(s)
            .map_err(|e| Error::InvalidField("session_key_id".to_string(), e.to_string()))?;
        let id: [u8; 16] = bytes.as_slice().try_into().map_err(|_| {
            Error::InvalidField(
                "session_key_id".to_string(),
                format!("expected 16 bytes, got {}", bytes.len()),
            )
        })?;
        Ok(SessionKeyId(id))
    }
}

impl TryFrom<String> for SessionKeyId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SessionKeyId> for String {
    fn from(v: SessionKeyId) -> Self {
        v.to_string()
    }
}

/// Session keys issued by a join.
///
/// Pre-1.1 sessions have a single NwkSKey, which is stored in all three
/// network key slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeys {
    pub session_key_id: SessionKeyId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f_nwk_s_int_key: Option<KeyEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s_nwk_s_int_key: Option<KeyEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nwk_s_enc_key: Option<KeyEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_s_key: Option<KeyEnvelope>,
}

/// Session key record as persisted in the key registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSessionKeys {
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
    pub keys: SessionKeys,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
