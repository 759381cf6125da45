//! Remote crypto service client
//!
//! Forwards every [`CryptoService`] operation to an external crypto server
//! as a JSON POST to `<base>/crypto/<operation>`. PHY payloads travel as
//! base64; session keys come back as key envelopes, normally wrapped under a
//! KEK the Join Server's own vault knows.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::service::{CryptoDevice, CryptoService, NwkSKeys};
use crate::error::{Error, Result};
use crate::lorawan::keys::KeyEnvelope;
use crate::lorawan::{MacVersion, NetId};

#[derive(Debug, Serialize)]
struct PayloadRequest<'a> {
    device: &'a CryptoDevice,
    mac_version: MacVersion,
    #[serde(skip_serializing_if = "Option::is_none")]
    join_req_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dev_nonce: Option<u16>,
    payload: String,
}

#[derive(Debug, Serialize)]
struct DeriveRequest<'a> {
    device: &'a CryptoDevice,
    mac_version: MacVersion,
    join_nonce: u32,
    dev_nonce: u16,
    net_id: NetId,
}

#[derive(Debug, Deserialize)]
struct MicResponse {
    mic: String,
}

#[derive(Debug, Deserialize)]
struct PayloadResponse {
    payload: String,
}

#[derive(Debug, Deserialize)]
struct AppSKeyResponse {
    app_s_key: KeyEnvelope,
}

/// HTTP client for an external crypto server.
pub struct RemoteCryptoService {
    http: Client,
    base_url: String,
}

impl RemoteCryptoService {
    /// `address` is `host[:port]` or a full URL; `tls` selects the scheme
    /// when none is given.
    pub fn new(address: &str, tls: bool) -> Result<Self> {
        let http = Client::builder()
            .build()
            .map_err(|e| Error::CryptoService(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url(address, tls),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call<Req, Resp>(&self, op: &str, req: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/crypto/{}", self.base_url, op);
        debug!(url = %url, "Calling remote crypto service");

        let resp = self
            .http
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| Error::CryptoService(format!("{} request failed: {}", op, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::CryptoService(format!(
                "{} failed with status {}: {}",
                op, status, body
            )));
        }

        resp.json::<Resp>()
            .await
            .map_err(|e| Error::CryptoService(format!("invalid {} response: {}", op, e)))
    }
}

pub(crate) fn base_url(address: &str, tls: bool) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else if tls {
        format!("https://{}", address)
    } else {
        format!("http://{}", address)
    }
}

fn decode_mic(mic: &str) -> Result<[u8; 4]> {
    let bytes = BASE64
        .decode(mic)
        .map_err(|e| Error::ComputeMic(format!("invalid MIC encoding: {}", e)))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::ComputeMic(format!("MIC has {} bytes", bytes.len())))
}

fn decode_payload(payload: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(payload)
        .map_err(|e| Error::EncryptPayload(format!("invalid payload encoding: {}", e)))
}

#[async_trait]
impl CryptoService for RemoteCryptoService {
    async fn join_request_mic(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        payload: &[u8],
    ) -> Result<[u8; 4]> {
        let req = PayloadRequest {
            device: dev,
            mac_version: version,
            join_req_type: None,
            dev_nonce: None,
            payload: BASE64.encode(payload),
        };
        let resp: MicResponse = self.call("join-request-mic", &req).await?;
        decode_mic(&resp.mic)
    }

    async fn join_accept_mic(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        join_req_type: u8,
        dev_nonce: u16,
        payload: &[u8],
    ) -> Result<[u8; 4]> {
        let req = PayloadRequest {
            device: dev,
            mac_version: version,
            join_req_type: Some(join_req_type),
            dev_nonce: Some(dev_nonce),
            payload: BASE64.encode(payload),
        };
        let resp: MicResponse = self.call("join-accept-mic", &req).await?;
        decode_mic(&resp.mic)
    }

    async fn encrypt_join_accept(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let req = PayloadRequest {
            device: dev,
            mac_version: version,
            join_req_type: None,
            dev_nonce: None,
            payload: BASE64.encode(payload),
        };
        let resp: PayloadResponse = self.call("encrypt-join-accept", &req).await?;
        decode_payload(&resp.payload)
    }

    async fn encrypt_rejoin_accept(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let req = PayloadRequest {
            device: dev,
            mac_version: version,
            join_req_type: None,
            dev_nonce: None,
            payload: BASE64.encode(payload),
        };
        let resp: PayloadResponse = self.call("encrypt-rejoin-accept", &req).await?;
        decode_payload(&resp.payload)
    }

    async fn derive_nwk_s_keys(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        join_nonce: u32,
        dev_nonce: u16,
        net_id: NetId,
    ) -> Result<NwkSKeys> {
        let req = DeriveRequest {
            device: dev,
            mac_version: version,
            join_nonce,
            dev_nonce,
            net_id,
        };
        self.call("derive-nwk-s-keys", &req).await
    }

    async fn derive_app_s_key(
        &self,
        dev: &CryptoDevice,
        version: MacVersion,
        join_nonce: u32,
        dev_nonce: u16,
        net_id: NetId,
    ) -> Result<KeyEnvelope> {
        let req = DeriveRequest {
            device: dev,
            mac_version: version,
            join_nonce,
            dev_nonce,
            net_id,
        };
        let resp: AppSKeyResponse = self.call("derive-app-s-key", &req).await?;
        Ok(resp.app_s_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::{dev_eui, join_eui};

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("crypto.example:8080", false), "http://crypto.example:8080");
        assert_eq!(base_url("crypto.example", true), "https://crypto.example");
        assert_eq!(base_url("https://crypto.example/", false), "https://crypto.example");
    }

    #[test]
    fn test_request_shape() {
        let dev = CryptoDevice {
            join_eui: join_eui(),
            dev_eui: dev_eui(),
            provisioner_id: Some("unique-id".to_string()),
            provisioning_data: None,
            root_keys: None,
        };
        let req = PayloadRequest {
            device: &dev,
            mac_version: MacVersion::V1_1,
            join_req_type: Some(0xFF),
            dev_nonce: Some(0x2442),
            payload: BASE64.encode([0x20, 0x01]),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["device"]["dev_eui"], "4242FFFFFFFFFFFF");
        assert_eq!(json["mac_version"], "1.1");
        assert_eq!(json["join_req_type"], 255);
        assert_eq!(json["dev_nonce"], 0x2442);
        assert_eq!(json["payload"], "IAE=");
        assert!(json["device"].get("root_keys").is_none());
    }

    #[test]
    fn test_decode_responses() {
        assert_eq!(decode_mic("rn8Fyw==").unwrap(), [0xae, 0x7f, 0x05, 0xcb]);
        assert!(decode_mic("rn8F").is_err());
        assert_eq!(decode_payload("IAE=").unwrap(), vec![0x20, 0x01]);

        let resp: NwkSKeys = serde_json::from_str(
            r#"{
                "f_nwk_s_int_key": {"kek_label": "ns:nsa.example", "encrypted_key": "00112233445566778899AABBCCDDEEFF0011223344556677"},
                "s_nwk_s_int_key": {"key": "01010101010101010101010101010101"},
                "nwk_s_enc_key": {"key": "01010101010101010101010101010101"}
            }"#,
        )
        .unwrap();
        assert!(resp.f_nwk_s_int_key.is_wrapped());
        assert!(!resp.nwk_s_enc_key.is_wrapped());
    }
}
