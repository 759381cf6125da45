//! OTAA join handling
//!
//! A join runs in two phases. The compute phase reads the device, checks
//! the nonces, verifies the join-request MIC, builds and encrypts the
//! join-accept and derives the session keys; it is bounded by the request
//! deadline and changes nothing. The persist phase inserts the session key
//! record and commits the device's nonce and session fields in a single
//! compare-and-swap; the key history is pruned only after that commit. When
//! the device changed in between, the join is computed again once before
//! the conflict is reported.

use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{crypto_device, JoinServer};
use crate::auth::{address_host, Authorizer, Context};
use crate::error::{Error, Result};
use crate::keyvault::{wrap_if_kek_exists, wrap_with_kek};
use crate::lorawan::encoder::{JoinAcceptPayload, CF_LIST_LEN, MAX_JOIN_NONCE};
use crate::lorawan::keys::{KeyEnvelope, SessionKeyId, SessionKeys, StoredSessionKeys};
use crate::lorawan::{
    decode_join_request, DevAddr, DlSettings, Eui64, JoinRequestMessage, JoinRequestPayload, MType,
    MacVersion, Major, NetId, JOIN_REQUEST_TYPE,
};
use crate::registry::{ApplicationActivationSettings, DeviceField, EndDevice, Session};

/// Join-request as forwarded by a Network Server.
#[derive(Debug, Clone, Default)]
pub struct JoinRequest {
    /// The 23-byte PHY payload. When absent, `payload` is serialized.
    pub raw_payload: Option<Vec<u8>>,
    pub payload: Option<JoinRequestMessage>,
    pub selected_mac_version: MacVersion,
    pub net_id: NetId,
    pub dev_addr: DevAddr,
    pub dl_settings: DlSettings,
    pub rx_delay: u8,
    pub cf_list: Option<[u8; CF_LIST_LEN]>,
}

impl JoinRequest {
    pub fn new(
        raw_payload: Vec<u8>,
        selected_mac_version: MacVersion,
        net_id: NetId,
        dev_addr: DevAddr,
    ) -> Self {
        Self {
            raw_payload: Some(raw_payload),
            selected_mac_version,
            net_id,
            dev_addr,
            ..Default::default()
        }
    }

    fn decode(&self) -> Result<(Vec<u8>, JoinRequestMessage)> {
        let (raw, msg) = match (&self.raw_payload, &self.payload) {
            (Some(raw), _) => (raw.clone(), decode_join_request(raw)?),
            (None, Some(msg)) => (msg.encode()?, msg.clone()),
            (None, None) => return Err(Error::NoJoinRequest),
        };
        if let Major::Unknown(major) = msg.mhdr.major {
            return Err(Error::UnsupportedLorawanMajor(major));
        }
        if msg.mhdr.mtype != MType::JoinRequest {
            return Err(Error::WrongPayloadType(msg.mhdr.mtype.to_string()));
        }
        Ok((raw, msg))
    }
}

/// Encrypted join-accept and the keys of the new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinResponse {
    /// MHDR followed by the encrypted join-accept body.
    pub raw_payload: Vec<u8>,
    pub session_keys: SessionKeys,
    pub lifetime: Duration,
}

/// Anti-replay fields of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NonceState {
    pub last_dev_nonce: u32,
    pub last_join_nonce: u32,
    pub used_dev_nonces: Vec<u16>,
}

impl NonceState {
    fn of(dev: &EndDevice) -> Self {
        Self {
            last_dev_nonce: dev.last_dev_nonce,
            last_join_nonce: dev.last_join_nonce,
            used_dev_nonces: dev.used_dev_nonces.clone(),
        }
    }

    fn apply(self, dev: &mut EndDevice) {
        dev.last_dev_nonce = self.last_dev_nonce;
        dev.last_join_nonce = self.last_join_nonce;
        dev.used_dev_nonces = self.used_dev_nonces;
    }
}

/// Check `dev_nonce` against the device's history and return the updated
/// DevNonce fields. LoRaWAN 1.1 devices count up; earlier devices must never
/// repeat a value among the last `limit` ones.
pub(crate) fn check_dev_nonce(
    dev: &EndDevice,
    version: MacVersion,
    dev_nonce: u16,
    limit: usize,
) -> Result<NonceState> {
    let mut next = NonceState::of(dev);
    if version.is_1_1() {
        let dn = dev_nonce as u32;
        let fresh = dn == 0 && dev.last_dev_nonce == 0 && dev.last_join_nonce == 0;
        if !fresh && !dev.resets_join_nonces && dn <= dev.last_dev_nonce {
            return Err(Error::DevNonceTooSmall {
                dev_nonce: dn,
                last: dev.last_dev_nonce,
            });
        }
        next.last_dev_nonce = dn;
        return Ok(next);
    }

    match next.used_dev_nonces.binary_search(&dev_nonce) {
        Ok(_) if !dev.resets_join_nonces => return Err(Error::ReuseDevNonce(dev_nonce)),
        Ok(_) => {}
        Err(i) => next.used_dev_nonces.insert(i, dev_nonce),
    }
    if next.used_dev_nonces.len() > limit {
        let excess = next.used_dev_nonces.len() - limit;
        next.used_dev_nonces.drain(..excess);
    }
    Ok(next)
}

fn next_join_nonce(last: u32) -> Result<u32> {
    if last >= MAX_JOIN_NONCE {
        return Err(Error::JoinNonceTooHigh);
    }
    Ok(last + 1)
}

/// `ns:<host>` / `as:<host>` label derived from a server address.
fn address_kek_label(prefix: &str, address: Option<&str>) -> String {
    address
        .map(|a| format!("{}:{}", prefix, address_host(a)))
        .unwrap_or_default()
}

/// Outcome of the compute phase.
struct Prepared {
    read: NonceState,
    next: NonceState,
    session: Session,
    response: JoinResponse,
}

impl JoinServer {
    /// Handle a join-request on behalf of a Network Server.
    pub async fn handle_join(
        &self,
        ctx: &Context,
        authorizer: &Authorizer,
        req: JoinRequest,
    ) -> Result<JoinResponse> {
        let res = self.join(ctx, authorizer, &req).await;
        if let Err(err) = &res {
            warn!(code = err.code(), error = %err, "Join rejected");
        }
        res
    }

    async fn join(
        &self,
        ctx: &Context,
        authorizer: &Authorizer,
        req: &JoinRequest,
    ) -> Result<JoinResponse> {
        if let Authorizer::ApplicationRights { .. } = authorizer {
            return Err(Error::PermissionDenied(
                "join-requests are only accepted from Network Servers".to_string(),
            ));
        }
        authorizer.require_authorized(ctx).await?;

        let version = req.selected_mac_version;
        if !version.is_supported() {
            return Err(Error::UnsupportedMacVersion(version.to_string()));
        }
        if req.dev_addr.is_zero() {
            return Err(Error::NoDevAddr);
        }

        let (raw, msg) = req.decode()?;
        let jr = msg.payload.clone().ok_or(Error::NoJoinRequest)?;
        if jr.join_eui.is_zero() {
            return Err(Error::NoJoinEui);
        }
        if jr.dev_eui.is_zero() {
            return Err(Error::NoDevEui);
        }
        if !self.config.serves_join_eui(jr.join_eui) {
            return Err(if version.is_1_1() {
                Error::ForwardJoinRequest(jr.join_eui.to_string())
            } else {
                Error::UnknownAppEui(jr.join_eui.to_string())
            });
        }

        let deadline = self.deadline(ctx);
        match self
            .attempt(ctx, authorizer, req, &raw, &msg, &jr, deadline)
            .await
        {
            Err(Error::TransactionConflict(what)) => {
                debug!(dev_eui = %jr.dev_eui, conflict = %what, "Retrying join");
                self.attempt(ctx, authorizer, req, &raw, &msg, &jr, deadline)
                    .await
            }
            res => res,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        ctx: &Context,
        authorizer: &Authorizer,
        req: &JoinRequest,
        raw: &[u8],
        msg: &JoinRequestMessage,
        jr: &JoinRequestPayload,
        deadline: Option<Instant>,
    ) -> Result<JoinResponse> {
        let prepared = Self::until(
            deadline,
            self.prepare(ctx, authorizer, req, raw, msg, jr),
        )
        .await?;
        if deadline.map_or(false, |d| Instant::now() >= d) {
            return Err(Error::DeadlineExceeded);
        }
        self.persist(jr, prepared).await
    }

    async fn prepare(
        &self,
        ctx: &Context,
        authorizer: &Authorizer,
        req: &JoinRequest,
        raw: &[u8],
        msg: &JoinRequestMessage,
        jr: &JoinRequestPayload,
    ) -> Result<Prepared> {
        let version = req.selected_mac_version;
        let dev = self.devices.get_by_eui(jr.join_eui, jr.dev_eui).await?;

        if authorizer.is_interop() {
            let address = dev.network_server_address.as_deref().ok_or_else(|| {
                Error::PermissionDenied("device has no Network Server address".to_string())
            })?;
            authorizer.require_address(ctx, address)?;
        }
        if let Some(net_id) = dev.net_id {
            if net_id != req.net_id {
                return Err(Error::NetIdMismatch {
                    request: req.net_id.to_string(),
                    device: net_id.to_string(),
                });
            }
        }
        if authorizer.is_interop() {
            authorizer.require_net_id(ctx, req.net_id)?;
        }

        let read = NonceState::of(&dev);
        let mut next = check_dev_nonce(&dev, version, jr.dev_nonce, self.config.dev_nonce_limit)?;
        let join_nonce = next_join_nonce(dev.last_join_nonce)?;
        next.last_join_nonce = join_nonce;

        let cdev = crypto_device(&dev);
        let network_crypto = self.network_crypto_for(&dev)?;
        let application_crypto = self.application_crypto_for(&dev)?;
        // The join-request and join-accept are protected by NwkKey from 1.1
        // on and by AppKey before.
        let frame_crypto = if version.is_1_1() {
            network_crypto
        } else {
            application_crypto
        };

        let mic = frame_crypto.join_request_mic(&cdev, version, raw).await?;
        if mic != msg.mic {
            return Err(Error::MicMismatch);
        }

        let accept = JoinAcceptPayload {
            join_nonce,
            net_id: req.net_id,
            dev_addr: req.dev_addr,
            dl_settings: req.dl_settings,
            rx_delay: req.rx_delay,
            cf_list: req.cf_list,
        }
        .build()?;
        let mic = frame_crypto
            .join_accept_mic(&cdev, version, JOIN_REQUEST_TYPE, jr.dev_nonce, &accept)
            .await?;
        let mut body = accept[1..].to_vec();
        body.extend_from_slice(&mic);
        let encrypted = frame_crypto.encrypt_join_accept(&cdev, version, &body).await?;
        let mut raw_payload = Vec::with_capacity(1 + encrypted.len());
        raw_payload.push(accept[0]);
        raw_payload.extend_from_slice(&encrypted);

        let nwk_s_keys = network_crypto
            .derive_nwk_s_keys(&cdev, version, join_nonce, jr.dev_nonce, req.net_id)
            .await?;
        let app_s_key = application_crypto
            .derive_app_s_key(&cdev, version, join_nonce, jr.dev_nonce, req.net_id)
            .await?;

        let ns_kek_label = dev.network_server_kek_label.clone().unwrap_or_else(|| {
            address_kek_label("ns", dev.network_server_address.as_deref())
        });
        let session_keys = SessionKeys {
            session_key_id: self.session_key_ids.generate()?,
            f_nwk_s_int_key: Some(
                self.rewrap(&nwk_s_keys.f_nwk_s_int_key, &ns_kek_label)
                    .await?,
            ),
            s_nwk_s_int_key: Some(
                self.rewrap(&nwk_s_keys.s_nwk_s_int_key, &ns_kek_label)
                    .await?,
            ),
            nwk_s_enc_key: Some(self.rewrap(&nwk_s_keys.nwk_s_enc_key, &ns_kek_label).await?),
            app_s_key: Some(self.wrap_app_s_key(&dev, &app_s_key).await?),
        };

        let session = Session {
            dev_addr: req.dev_addr,
            keys: session_keys.clone(),
            started_at: Utc::now(),
        };
        Ok(Prepared {
            read,
            next,
            session,
            response: JoinResponse {
                raw_payload,
                session_keys,
                lifetime: Duration::ZERO,
            },
        })
    }

    /// Unwrap a derived key and wrap it for its recipient.
    async fn rewrap(&self, key: &KeyEnvelope, kek_label: &str) -> Result<KeyEnvelope> {
        let key = self.key_vault.unwrap(key).await?;
        wrap_if_kek_exists(self.key_vault.as_ref(), &key, kek_label).await
    }

    /// The application KEK from the activation settings takes precedence
    /// over the Application Server's vault KEK. A settings KEK without a
    /// label is unusable for the recipient and is skipped.
    async fn wrap_app_s_key(&self, dev: &EndDevice, app_s_key: &KeyEnvelope) -> Result<KeyEnvelope> {
        let settings = self.activation_settings(&dev.ids.application_id).await?;
        let key = self.key_vault.unwrap(app_s_key).await?;
        if let Some(ApplicationActivationSettings {
            kek: Some(kek),
            kek_label: Some(kek_label),
            ..
        }) = settings
        {
            if !kek_label.is_empty() {
                let kek = self.key_vault.unwrap(&kek).await?;
                return wrap_with_kek(&key, &kek_label, &kek);
            }
        }
        let kek_label = dev.application_server_kek_label.clone().unwrap_or_else(|| {
            address_kek_label("as", dev.application_server_address.as_deref())
        });
        wrap_if_kek_exists(self.key_vault.as_ref(), &key, &kek_label).await
    }

    async fn persist(&self, jr: &JoinRequestPayload, prepared: Prepared) -> Result<JoinResponse> {
        let Prepared {
            read,
            next,
            session,
            response,
        } = prepared;
        let (join_eui, dev_eui) = (jr.join_eui, jr.dev_eui);
        let session_key_id = response.session_keys.session_key_id;

        let record = StoredSessionKeys {
            join_eui,
            dev_eui,
            keys: response.session_keys.clone(),
            created_at: Utc::now(),
        };
        self.keys
            .set_by_id(
                dev_eui,
                session_key_id,
                Box::new(move |stored| {
                    if stored.is_some() {
                        return Err(Error::RegistryOperation(
                            "session key ID already in use".to_string(),
                        ));
                    }
                    Ok(Some(record))
                }),
            )
            .await?;

        let committed = self
            .devices
            .set_by_eui(
                join_eui,
                dev_eui,
                Box::new(move |stored| {
                    let stored = stored.ok_or(Error::DeviceNotFound)?;
                    if NonceState::of(stored) != read {
                        return Err(Error::TransactionConflict(stored.ids.uid()));
                    }
                    let mut dev = stored.clone();
                    next.apply(&mut dev);
                    dev.session = Some(session);
                    Ok((
                        Some(dev),
                        vec![
                            DeviceField::LastDevNonce,
                            DeviceField::LastJoinNonce,
                            DeviceField::UsedDevNonces,
                            DeviceField::Session,
                        ],
                    ))
                }),
            )
            .await;

        let dev = match committed {
            Ok(Some(dev)) => dev,
            Ok(None) => {
                return Err(self
                    .discard_keys(dev_eui, session_key_id, Error::DeviceNotFound)
                    .await)
            }
            Err(err) => return Err(self.discard_keys(dev_eui, session_key_id, err).await),
        };

        // Older keys go only once the device points at the new ones.
        if let Err(err) = self.keys.prune(dev_eui).await {
            warn!(dev_eui = %dev_eui, error = %err, "Failed to prune session key history");
        }

        info!(
            join_eui = %join_eui,
            dev_eui = %dev_eui,
            dev_nonce = jr.dev_nonce,
            join_nonce = dev.last_join_nonce,
            session_key_id = %session_key_id,
            "Join accepted"
        );
        Ok(response)
    }

    /// Remove the key record of a join that failed to commit and return the
    /// commit error.
    async fn discard_keys(
        &self,
        dev_eui: Eui64,
        session_key_id: SessionKeyId,
        err: Error,
    ) -> Error {
        if let Err(cleanup) = self
            .keys
            .set_by_id(dev_eui, session_key_id, Box::new(|_| Ok(None)))
            .await
        {
            warn!(
                dev_eui = %dev_eui,
                session_key_id = %session_key_id,
                error = %cleanup,
                "Failed to discard session keys"
            );
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{PeerIdentity, Right};
    use crate::error::ErrorKind;
    use crate::identity::StaticIdentityServer;
    use crate::crypto::local::LocalCryptoService;
    use crate::crypto::tests::key;
    use crate::crypto::{self as primitives, CryptoDevice, CryptoService, NwkSKeys};
    use crate::joinserver::testutil::*;
    use crate::joinserver::{Components, JoinServerConfig};
    use crate::keyvault::{KeyVault, MemKeyVault};
    use crate::lorawan::encoder::JoinAcceptMessage;
    use crate::lorawan::keys::AesKey;
    use crate::registry::{
        AppActivationRegistry, ApplicationActivationSettings, DeviceMutator, DeviceRegistry, EndDeviceIdentifiers,
        KeyRegistry, MemAppActivationRegistry, MemDeviceRegistry, MemKeyRegistry, SettingsField,
    };
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const S1_JOIN_REQUEST: &str = "00ffffffffffffff42ffffffffffff42420100436e0fba";
    const S2_JOIN_REQUEST: &str = "00ffffffffffffff42ffffffffffff424200009cf48fe3";

    fn request(raw: &str, version: MacVersion) -> JoinRequest {
        JoinRequest {
            raw_payload: Some(hex::decode(raw).unwrap()),
            selected_mac_version: version,
            net_id: "42FFFF".parse().unwrap(),
            dev_addr: "42FFFFFF".parse().unwrap(),
            dl_settings: DlSettings(0xEF),
            rx_delay: 0x42,
            ..Default::default()
        }
    }

    /// Join-request signed with `key`, as a device would send it.
    fn signed_request(key: &AesKey, dev_nonce: u16) -> Vec<u8> {
        let ids = ids();
        let mut raw = JoinRequestMessage::new(
            JoinRequestPayload {
                join_eui: ids.join_eui,
                dev_eui: ids.dev_eui,
                dev_nonce,
            },
            [0; 4],
        )
        .encode()
        .unwrap();
        let mic = primitives::compute_join_request_mic(key, &raw).unwrap();
        raw[19..].copy_from_slice(&mic);
        raw
    }

    async fn stored(h: &Harness) -> EndDevice {
        let ids = ids();
        h.devices.get_by_eui(ids.join_eui, ids.dev_eui).await.unwrap()
    }

    async fn unwrap_key(env: &Option<KeyEnvelope>) -> AesKey {
        vault().unwrap(env.as_ref().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn test_join_1_0() {
        let h = harness();
        store(&h, device(MacVersion::V1_0_3, 0x02, None)).await;

        let res = h
            .js
            .handle_join(&cluster_ctx(), &cluster(), request(S1_JOIN_REQUEST, MacVersion::V1_0_3))
            .await
            .unwrap();
        assert_eq!(
            res.raw_payload,
            hex::decode("2018fffa7f840531a333f1db3182405006").unwrap()
        );
        assert_eq!(res.lifetime, Duration::ZERO);

        let keys = &res.session_keys;
        assert_eq!(
            keys.f_nwk_s_int_key.as_ref().unwrap().kek_label(),
            Some("ns:nsa.example")
        );
        assert_eq!(
            keys.app_s_key.as_ref().unwrap().kek_label(),
            Some("as:asa.example")
        );
        let nwk_s_key = key("574d1be83aef13c0245f2c1f5aca85f8");
        assert_eq!(unwrap_key(&keys.f_nwk_s_int_key).await, nwk_s_key);
        assert_eq!(unwrap_key(&keys.s_nwk_s_int_key).await, nwk_s_key);
        assert_eq!(unwrap_key(&keys.nwk_s_enc_key).await, nwk_s_key);
        assert_eq!(
            unwrap_key(&keys.app_s_key).await,
            key("99b152b425d330e0781d57e040cab689")
        );

        let dev = stored(&h).await;
        assert_eq!(dev.last_join_nonce, 1);
        assert_eq!(dev.used_dev_nonces, vec![1]);
        let session = dev.session.unwrap();
        assert_eq!(session.keys, res.session_keys);
        assert_eq!(session.dev_addr, "42FFFFFF".parse().unwrap());

        let record = h
            .keys
            .get_by_id(ids().dev_eui, keys.session_key_id)
            .await
            .unwrap();
        assert_eq!(record.keys, res.session_keys);
        assert_eq!(record.join_eui, ids().join_eui);
    }

    #[tokio::test]
    async fn test_join_1_0_with_cf_list() {
        let h = harness();
        store(&h, device(MacVersion::V1_0_3, 0x02, None)).await;

        let mut req = request(S1_JOIN_REQUEST, MacVersion::V1_0_3);
        let mut cf_list = [0u8; CF_LIST_LEN];
        cf_list.iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
        req.cf_list = Some(cf_list);

        let res = h.js.handle_join(&cluster_ctx(), &cluster(), req).await.unwrap();
        assert_eq!(
            res.raw_payload,
            hex::decode("20c462a12867263434d4b44ae24a99547b0bc10c6a2bab0584d404c060b631f952")
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_join_1_1() {
        let h = harness();
        store(&h, device(MacVersion::V1_1, 0x01, Some(0x01))).await;

        let res = h
            .js
            .handle_join(&cluster_ctx(), &cluster(), request(S2_JOIN_REQUEST, MacVersion::V1_1))
            .await
            .unwrap();
        assert_eq!(
            res.raw_payload,
            hex::decode("201e35e83aeb73f48f740d03f9143a88c8").unwrap()
        );

        let keys = &res.session_keys;
        assert_eq!(
            unwrap_key(&keys.f_nwk_s_int_key).await,
            key("e260a287220ca5db352f8c8949d5f112")
        );
        assert_eq!(
            unwrap_key(&keys.s_nwk_s_int_key).await,
            key("c9ae84ce6ad11f5aac837714eb71e4e7")
        );
        assert_eq!(
            unwrap_key(&keys.nwk_s_enc_key).await,
            key("3eecdd3a712b79a90527a08d54b53c6b")
        );
        assert_eq!(
            unwrap_key(&keys.app_s_key).await,
            key("c3ee4fa8e086ceaa29c3456e515a0465")
        );

        let dev = stored(&h).await;
        assert_eq!(dev.last_dev_nonce, 0);
        assert_eq!(dev.last_join_nonce, 1);
        assert!(dev.used_dev_nonces.is_empty());
    }

    #[tokio::test]
    async fn test_decoded_payload_is_reserialized() {
        let h = harness();
        store(&h, device(MacVersion::V1_1, 0x01, Some(0x01))).await;

        let raw = hex::decode(S2_JOIN_REQUEST).unwrap();
        let mut req = request(S2_JOIN_REQUEST, MacVersion::V1_1);
        req.raw_payload = None;
        req.payload = Some(decode_join_request(&raw).unwrap());

        let res = h.js.handle_join(&cluster_ctx(), &cluster(), req).await.unwrap();
        assert_eq!(
            res.raw_payload,
            hex::decode("201e35e83aeb73f48f740d03f9143a88c8").unwrap()
        );
    }

    #[tokio::test]
    async fn test_dev_nonce_replay_1_1() {
        let h = harness();
        let mut dev = device(MacVersion::V1_1, 0x01, Some(0x01));
        dev.last_dev_nonce = 0x2442;
        dev.last_join_nonce = 0x42fffe;
        store(&h, dev).await;

        let err = h
            .js
            .handle_join(
                &cluster_ctx(),
                &cluster(),
                request("00ffffffffffffff42ffffffffffff42424224758a2814", MacVersion::V1_1),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::DevNonceTooSmall {
                dev_nonce: 0x2442,
                last: 0x2442
            }
        );

        let dev = stored(&h).await;
        assert_eq!(dev.last_dev_nonce, 0x2442);
        assert_eq!(dev.last_join_nonce, 0x42fffe);
        assert!(dev.session.is_none());
    }

    #[tokio::test]
    async fn test_dev_nonce_increase_1_1() {
        let h = harness();
        let mut dev = device(MacVersion::V1_1, 0x01, Some(0x01));
        dev.last_dev_nonce = 0x2442;
        dev.last_join_nonce = 0x42fffe;
        store(&h, dev).await;

        h.js.handle_join(
            &cluster_ctx(),
            &cluster(),
            request("00ffffffffffffff42ffffffffffff4242432402b071dd", MacVersion::V1_1),
        )
        .await
        .unwrap();

        let dev = stored(&h).await;
        assert_eq!(dev.last_dev_nonce, 0x2443);
        assert_eq!(dev.last_join_nonce, 0x42ffff);
    }

    #[tokio::test]
    async fn test_net_id_mismatch_for_interop_peer() {
        let h = harness();
        let mut dev = device(MacVersion::V1_1, 0x01, Some(0x01));
        dev.net_id = Some("42FFFF".parse().unwrap());
        store(&h, dev).await;

        let ctx = Context::peer(PeerIdentity {
            net_id: Some("424242".parse().unwrap()),
            addresses: vec!["nsa.example".to_string()],
            ..Default::default()
        });
        let mut req = request(S2_JOIN_REQUEST, MacVersion::V1_1);
        req.net_id = "424242".parse().unwrap();

        let err = h
            .js
            .handle_join(&ctx, &Authorizer::Interop, req)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NET_ID_MISMATCH");
        assert_eq!(stored(&h).await.last_join_nonce, 0);
    }

    #[tokio::test]
    async fn test_interop_peer_must_match_device_network_server() {
        let h = harness();
        store(&h, device(MacVersion::V1_1, 0x01, Some(0x01))).await;

        let peer = |address: &str| {
            Context::peer(PeerIdentity {
                net_id: Some("42FFFF".parse().unwrap()),
                addresses: vec![address.to_string()],
                ..Default::default()
            })
        };

        let err = h
            .js
            .handle_join(
                &peer("nsb.example"),
                &Authorizer::Interop,
                request(S2_JOIN_REQUEST, MacVersion::V1_1),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");

        h.js.handle_join(
            &peer("nsa.example"),
            &Authorizer::Interop,
            request(S2_JOIN_REQUEST, MacVersion::V1_1),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unauthorized_caller() {
        let h = harness();
        store(&h, device(MacVersion::V1_1, 0x01, Some(0x01))).await;

        let err = h
            .js
            .handle_join(
                &Context::cluster("wrong"),
                &cluster(),
                request(S2_JOIN_REQUEST, MacVersion::V1_1),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");

        let err = h
            .js
            .handle_join(
                &Context::default(),
                &Authorizer::Interop,
                request(S2_JOIN_REQUEST, MacVersion::V1_1),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");
    }

    #[tokio::test]
    async fn test_application_rights_caller_cannot_join() {
        let h = harness();
        store(&h, device(MacVersion::V1_0_3, 0x02, None)).await;
        let is = Arc::new(StaticIdentityServer::new());
        is.grant(
            "token",
            "test-app",
            &[Right::ApplicationDevicesRead, Right::ApplicationDevicesReadKeys],
        );
        let auth = Authorizer::application_rights(is);

        for token in ["made-up-token", "token"] {
            let err = h
                .js
                .handle_join(
                    &Context::bearer(token),
                    &auth,
                    request(S1_JOIN_REQUEST, MacVersion::V1_0_3),
                )
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        }

        let dev = stored(&h).await;
        assert_eq!(dev.last_join_nonce, 0);
        assert!(dev.session.is_none());
        assert!(h.keys.range_by_dev_eui(ids().dev_eui).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_nwk_key_1_1() {
        let h = harness();
        store(&h, device(MacVersion::V1_1, 0x01, None)).await;

        let err = h
            .js
            .handle_join(&cluster_ctx(), &cluster(), request(S2_JOIN_REQUEST, MacVersion::V1_1))
            .await
            .unwrap_err();
        assert_eq!(err, Error::NoNwkKey);

        let dev = stored(&h).await;
        assert_eq!(dev.last_join_nonce, 0);
        assert!(dev.session.is_none());
        assert!(h.keys.range_by_dev_eui(ids().dev_eui).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resets_join_nonces() {
        let h = harness();
        let mut dev = device(MacVersion::V1_1, 0x01, Some(0x01));
        dev.last_dev_nonce = 0x2441;
        dev.last_join_nonce = 5;
        dev.resets_join_nonces = true;
        store(&h, dev).await;

        h.js.handle_join(&cluster_ctx(), &cluster(), request(S2_JOIN_REQUEST, MacVersion::V1_1))
            .await
            .unwrap();

        let dev = stored(&h).await;
        assert_eq!(dev.last_dev_nonce, 0);
        assert_eq!(dev.last_join_nonce, 6);
    }

    #[tokio::test]
    async fn test_reuse_dev_nonce_1_0() {
        let h = harness();
        let mut dev = device(MacVersion::V1_0_3, 0x02, None);
        dev.used_dev_nonces = vec![1];
        dev.last_join_nonce = 3;
        store(&h, dev).await;

        let err = h
            .js
            .handle_join(&cluster_ctx(), &cluster(), request(S1_JOIN_REQUEST, MacVersion::V1_0_3))
            .await
            .unwrap_err();
        assert_eq!(err, Error::ReuseDevNonce(1));
        assert_eq!(stored(&h).await.last_join_nonce, 3);
    }

    #[tokio::test]
    async fn test_reuse_dev_nonce_1_0_with_reset() {
        let h = harness();
        let mut dev = device(MacVersion::V1_0_3, 0x02, None);
        dev.used_dev_nonces = vec![1];
        dev.resets_join_nonces = true;
        store(&h, dev).await;

        h.js.handle_join(&cluster_ctx(), &cluster(), request(S1_JOIN_REQUEST, MacVersion::V1_0_3))
            .await
            .unwrap();
        let dev = stored(&h).await;
        assert_eq!(dev.used_dev_nonces, vec![1]);
        assert_eq!(dev.last_join_nonce, 1);
    }

    #[tokio::test]
    async fn test_dev_nonce_limit_drops_smallest() {
        let h = harness_with(JoinServerConfig {
            join_eui_prefixes: vec!["42FFFFFFFFFFFFFF/64".parse().unwrap()],
            dev_nonce_limit: 2,
            ..Default::default()
        });
        let mut dev = device(MacVersion::V1_0_3, 0x02, None);
        dev.used_dev_nonces = vec![1, 2];
        store(&h, dev).await;

        h.js.handle_join(
            &cluster_ctx(),
            &cluster(),
            request("00ffffffffffffff42ffffffffffff42420300b4b2b65b", MacVersion::V1_0_3),
        )
        .await
        .unwrap();
        assert_eq!(stored(&h).await.used_dev_nonces, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_mic_mismatch() {
        let h = harness();
        store(&h, device(MacVersion::V1_1, 0x01, Some(0x01))).await;

        let mut req = request(S2_JOIN_REQUEST, MacVersion::V1_1);
        if let Some(raw) = req.raw_payload.as_mut() {
            raw[22] ^= 0xFF;
        }
        let err = h
            .js
            .handle_join(&cluster_ctx(), &cluster(), req)
            .await
            .unwrap_err();
        assert_eq!(err, Error::MicMismatch);
        assert_eq!(stored(&h).await.last_join_nonce, 0);
    }

    #[tokio::test]
    async fn test_join_nonce_exhausted() {
        let h = harness();
        let mut dev = device(MacVersion::V1_1, 0x01, Some(0x01));
        dev.last_join_nonce = MAX_JOIN_NONCE;
        store(&h, dev).await;

        let err = h
            .js
            .handle_join(
                &cluster_ctx(),
                &cluster(),
                request("00ffffffffffffff42ffffffffffff4242020003cc8d8c", MacVersion::V1_0_3),
            )
            .await
            .unwrap_err();
        assert_eq!(err, Error::JoinNonceTooHigh);
    }

    #[tokio::test]
    async fn test_request_validation() {
        let h = harness();
        store(&h, device(MacVersion::V1_1, 0x01, Some(0x01))).await;
        let js = &h.js;
        let join = |req: JoinRequest| async move {
            js.handle_join(&cluster_ctx(), &cluster(), req).await
        };

        let err = join(request(S2_JOIN_REQUEST, MacVersion::Unknown)).await.unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_MAC_VERSION");

        let mut req = request(S2_JOIN_REQUEST, MacVersion::V1_1);
        req.dev_addr = DevAddr::default();
        assert_eq!(join(req).await.unwrap_err(), Error::NoDevAddr);

        let mut req = request(S2_JOIN_REQUEST, MacVersion::V1_1);
        req.raw_payload = None;
        assert_eq!(join(req).await.unwrap_err(), Error::NoJoinRequest);

        let mut req = request(S2_JOIN_REQUEST, MacVersion::V1_1);
        req.raw_payload.as_mut().unwrap().truncate(22);
        assert_eq!(join(req).await.unwrap_err().code(), "DECODE_PAYLOAD");

        let mut req = request(S2_JOIN_REQUEST, MacVersion::V1_1);
        req.raw_payload.as_mut().unwrap()[0] = 0x40;
        assert_eq!(join(req).await.unwrap_err().code(), "WRONG_PAYLOAD_TYPE");

        let mut req = request(S2_JOIN_REQUEST, MacVersion::V1_1);
        req.raw_payload.as_mut().unwrap()[0] = 0x01;
        assert_eq!(
            join(req).await.unwrap_err(),
            Error::UnsupportedLorawanMajor(1)
        );

        let mut req = request(S2_JOIN_REQUEST, MacVersion::V1_1);
        req.raw_payload.as_mut().unwrap()[9..17].fill(0);
        assert_eq!(join(req).await.unwrap_err(), Error::NoDevEui);
    }

    #[tokio::test]
    async fn test_unknown_join_eui() {
        let h = harness_with(JoinServerConfig {
            join_eui_prefixes: vec!["4200000000000000/64".parse().unwrap()],
            ..Default::default()
        });
        store(&h, device(MacVersion::V1_1, 0x01, Some(0x01))).await;

        let err = h
            .js
            .handle_join(&cluster_ctx(), &cluster(), request(S2_JOIN_REQUEST, MacVersion::V1_1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORWARD_JOIN_REQUEST");

        let err = h
            .js
            .handle_join(&cluster_ctx(), &cluster(), request(S1_JOIN_REQUEST, MacVersion::V1_0_3))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_APP_EUI");
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let h = harness();
        let err = h
            .js
            .handle_join(&cluster_ctx(), &cluster(), request(S2_JOIN_REQUEST, MacVersion::V1_1))
            .await
            .unwrap_err();
        assert_eq!(err, Error::DeviceNotFound);
    }

    #[tokio::test]
    async fn test_expired_deadline() {
        let h = harness();
        store(&h, device(MacVersion::V1_1, 0x01, Some(0x01))).await;

        let ctx = cluster_ctx().with_deadline(Instant::now());
        tokio::time::sleep(Duration::from_millis(1)).await;
        let err = h
            .js
            .handle_join(&ctx, &cluster(), request(S2_JOIN_REQUEST, MacVersion::V1_1))
            .await
            .unwrap_err();
        assert_eq!(err, Error::DeadlineExceeded);
        assert!(stored(&h).await.session.is_none());
        assert!(h.keys.range_by_dev_eui(ids().dev_eui).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_application_kek_wraps_app_s_key() {
        let h = harness();
        store(&h, device(MacVersion::V1_0_3, 0x02, None)).await;

        let kek = AesKey([0x77; 16]);
        let wrapped_kek = vault().wrap(&kek, "device").await.unwrap();
        h.app_activation
            .set_by_id(
                "test-app",
                Box::new(move |_| {
                    Ok((
                        Some(ApplicationActivationSettings {
                            kek_label: Some("app-kek".to_string()),
                            kek: Some(wrapped_kek),
                            ..Default::default()
                        }),
                        SettingsField::ALL.to_vec(),
                    ))
                }),
            )
            .await
            .unwrap();

        let res = h
            .js
            .handle_join(&cluster_ctx(), &cluster(), request(S1_JOIN_REQUEST, MacVersion::V1_0_3))
            .await
            .unwrap();
        let app_s_key = res.session_keys.app_s_key.unwrap();
        assert_eq!(app_s_key.kek_label(), Some("app-kek"));
        let as_vault = MemKeyVault::default().with_kek("app-kek", kek);
        assert_eq!(
            as_vault.unwrap(&app_s_key).await.unwrap(),
            key("99b152b425d330e0781d57e040cab689")
        );
    }

    #[tokio::test]
    async fn test_unlabelled_application_kek_is_skipped() {
        let h = harness();
        store(&h, device(MacVersion::V1_0_3, 0x02, None)).await;

        let wrapped_kek = vault().wrap(&AesKey([0x77; 16]), "device").await.unwrap();
        h.app_activation
            .set_by_id(
                "test-app",
                Box::new(move |_| {
                    Ok((
                        Some(ApplicationActivationSettings {
                            kek: Some(wrapped_kek),
                            ..Default::default()
                        }),
                        SettingsField::ALL.to_vec(),
                    ))
                }),
            )
            .await
            .unwrap();

        let res = h
            .js
            .handle_join(&cluster_ctx(), &cluster(), request(S1_JOIN_REQUEST, MacVersion::V1_0_3))
            .await
            .unwrap();
        let app_s_key = res.session_keys.app_s_key.unwrap();
        assert_eq!(app_s_key.kek_label(), Some("as:asa.example"));
        assert_eq!(
            vault().unwrap(&app_s_key).await.unwrap(),
            key("99b152b425d330e0781d57e040cab689")
        );
    }

    #[tokio::test]
    async fn test_keys_unwrapped_without_kek() {
        let h = harness();
        let mut dev = device(MacVersion::V1_1, 0x01, Some(0x01));
        dev.network_server_address = Some("nsb.example".to_string());
        dev.application_server_address = None;
        store(&h, dev).await;

        let res = h
            .js
            .handle_join(&cluster_ctx(), &cluster(), request(S2_JOIN_REQUEST, MacVersion::V1_1))
            .await
            .unwrap();
        assert!(!res.session_keys.f_nwk_s_int_key.unwrap().is_wrapped());
        assert!(!res.session_keys.app_s_key.unwrap().is_wrapped());
    }

    #[tokio::test]
    async fn test_explicit_kek_label() {
        let h = harness();
        let mut dev = device(MacVersion::V1_1, 0x01, Some(0x01));
        dev.network_server_kek_label = Some("ns:nsa.example".to_string());
        dev.network_server_address = None;
        dev.application_server_kek_label = Some("as:asa.example".to_string());
        store(&h, dev).await;

        let res = h
            .js
            .handle_join(&cluster_ctx(), &cluster(), request(S2_JOIN_REQUEST, MacVersion::V1_1))
            .await
            .unwrap();
        assert_eq!(
            res.session_keys.nwk_s_enc_key.unwrap().kek_label(),
            Some("ns:nsa.example")
        );
        assert_eq!(
            res.session_keys.app_s_key.unwrap().kek_label(),
            Some("as:asa.example")
        );
    }

    /// Crypto service that counts the calls it forwards.
    struct CountingCrypto {
        inner: LocalCryptoService,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CryptoService for CountingCrypto {
        async fn join_request_mic(
            &self,
            dev: &CryptoDevice,
            version: MacVersion,
            payload: &[u8],
        ) -> Result<[u8; 4]> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.join_request_mic(dev, version, payload).await
        }

        async fn join_accept_mic(
            &self,
            dev: &CryptoDevice,
            version: MacVersion,
            join_req_type: u8,
            dev_nonce: u16,
            payload: &[u8],
        ) -> Result<[u8; 4]> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner
                .join_accept_mic(dev, version, join_req_type, dev_nonce, payload)
                .await
        }

        async fn encrypt_join_accept(
            &self,
            dev: &CryptoDevice,
            version: MacVersion,
            payload: &[u8],
        ) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.encrypt_join_accept(dev, version, payload).await
        }

        async fn encrypt_rejoin_accept(
            &self,
            dev: &CryptoDevice,
            version: MacVersion,
            payload: &[u8],
        ) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.encrypt_rejoin_accept(dev, version, payload).await
        }

        async fn derive_nwk_s_keys(
            &self,
            dev: &CryptoDevice,
            version: MacVersion,
            join_nonce: u32,
            dev_nonce: u16,
            net_id: NetId,
        ) -> Result<NwkSKeys> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner
                .derive_nwk_s_keys(dev, version, join_nonce, dev_nonce, net_id)
                .await
        }

        async fn derive_app_s_key(
            &self,
            dev: &CryptoDevice,
            version: MacVersion,
            join_nonce: u32,
            dev_nonce: u16,
            net_id: NetId,
        ) -> Result<KeyEnvelope> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner
                .derive_app_s_key(dev, version, join_nonce, dev_nonce, net_id)
                .await
        }
    }

    #[tokio::test]
    async fn test_external_network_crypto() {
        let external = Arc::new(CountingCrypto {
            inner: LocalCryptoService::new(Arc::new(vault())),
            calls: AtomicUsize::new(0),
        });
        let h = harness();
        let js = h.js.with_network_crypto(external.clone());
        let mut dev = device(MacVersion::V1_1, 0x01, Some(0x01));
        dev.external_network_crypto = true;
        let ids = dev.ids.clone();
        h.devices
            .set_by_id(
                &ids.application_id,
                &ids.device_id,
                Box::new(move |_| Ok((Some(dev), DeviceField::ALL.to_vec()))),
            )
            .await
            .unwrap();

        let res = js
            .handle_join(&cluster_ctx(), &cluster(), request(S2_JOIN_REQUEST, MacVersion::V1_1))
            .await
            .unwrap();
        assert_eq!(
            res.raw_payload,
            hex::decode("201e35e83aeb73f48f740d03f9143a88c8").unwrap()
        );
        // Request MIC, accept MIC, encryption and network key derivation.
        assert_eq!(external.calls.load(Ordering::SeqCst), 4);
    }

    /// Device registry that lets another join commit right before every
    /// commit of the join under test, up to `conflicts` times.
    struct ContendedDevices {
        inner: MemDeviceRegistry,
        conflicts: AtomicUsize,
    }

    #[async_trait]
    impl DeviceRegistry for ContendedDevices {
        async fn get_by_eui(&self, join_eui: Eui64, dev_eui: Eui64) -> Result<EndDevice> {
            self.inner.get_by_eui(join_eui, dev_eui).await
        }

        async fn get_by_id(&self, application_id: &str, device_id: &str) -> Result<EndDevice> {
            self.inner.get_by_id(application_id, device_id).await
        }

        async fn set_by_eui(
            &self,
            join_eui: Eui64,
            dev_eui: Eui64,
            f: DeviceMutator<'_>,
        ) -> Result<Option<EndDevice>> {
            let left = self.conflicts.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts.store(left - 1, Ordering::SeqCst);
                self.inner
                    .set_by_eui(
                        join_eui,
                        dev_eui,
                        Box::new(|stored| {
                            let mut dev = stored.cloned().ok_or(Error::DeviceNotFound)?;
                            dev.last_join_nonce += 1;
                            Ok((Some(dev), vec![DeviceField::LastJoinNonce]))
                        }),
                    )
                    .await?;
            }
            self.inner.set_by_eui(join_eui, dev_eui, f).await
        }

        async fn set_by_id(
            &self,
            application_id: &str,
            device_id: &str,
            f: DeviceMutator<'_>,
        ) -> Result<Option<EndDevice>> {
            self.inner.set_by_id(application_id, device_id, f).await
        }

        async fn range_by_id(&self) -> Result<Vec<EndDeviceIdentifiers>> {
            self.inner.range_by_id().await
        }

        async fn batch_delete(
            &self,
            ids: &[EndDeviceIdentifiers],
        ) -> Result<Vec<EndDeviceIdentifiers>> {
            self.inner.batch_delete(ids).await
        }
    }

    async fn contended(conflicts: usize) -> (JoinServer, Arc<ContendedDevices>, Arc<MemKeyRegistry>) {
        contended_with_key_limit(conflicts, None).await
    }

    async fn contended_with_key_limit(
        conflicts: usize,
        key_limit: Option<usize>,
    ) -> (JoinServer, Arc<ContendedDevices>, Arc<MemKeyRegistry>) {
        let devices = Arc::new(ContendedDevices {
            inner: MemDeviceRegistry::new(),
            conflicts: AtomicUsize::new(conflicts),
        });
        let keys = Arc::new(MemKeyRegistry::new(key_limit));
        let js = JoinServer::new(
            JoinServerConfig {
                join_eui_prefixes: vec!["42FFFFFFFFFFFFFF/64".parse().unwrap()],
                ..Default::default()
            },
            Components {
                devices: devices.clone(),
                keys: keys.clone(),
                app_activation: Arc::new(MemAppActivationRegistry::new()),
                key_vault: Arc::new(vault()),
            },
        )
        .unwrap();
        let dev = device(MacVersion::V1_1, 0x01, Some(0x01));
        let ids = dev.ids.clone();
        devices
            .set_by_id(
                &ids.application_id,
                &ids.device_id,
                Box::new(move |_| Ok((Some(dev), DeviceField::ALL.to_vec()))),
            )
            .await
            .unwrap();
        (js, devices, keys)
    }

    #[tokio::test]
    async fn test_conflict_is_retried_once() {
        let (js, devices, keys) = contended(1).await;
        js.handle_join(
            &cluster_ctx(),
            &cluster(),
            request("00ffffffffffffff42ffffffffffff424202002d82ce28", MacVersion::V1_1),
        )
        .await
        .unwrap();

        let dev = devices.get_by_eui(ids().join_eui, ids().dev_eui).await.unwrap();
        assert_eq!(dev.last_join_nonce, 2);
        assert_eq!(dev.last_dev_nonce, 2);
        // The key record of the first attempt is gone.
        assert_eq!(keys.range_by_dev_eui(ids().dev_eui).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_conflict_is_reported() {
        let (js, devices, keys) = contended(2).await;
        let err = js
            .handle_join(
                &cluster_ctx(),
                &cluster(),
                request("00ffffffffffffff42ffffffffffff424202002d82ce28", MacVersion::V1_1),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRANSACTION_CONFLICT");

        let dev = devices.get_by_eui(ids().join_eui, ids().dev_eui).await.unwrap();
        assert_eq!(dev.last_join_nonce, 2);
        assert_eq!(dev.last_dev_nonce, 0);
        assert!(keys.range_by_dev_eui(ids().dev_eui).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_current_session_keys() {
        let (js, devices, keys) = contended_with_key_limit(0, Some(1)).await;
        let first = js
            .handle_join(&cluster_ctx(), &cluster(), request(S2_JOIN_REQUEST, MacVersion::V1_1))
            .await
            .unwrap();
        let current = first.session_keys.session_key_id;

        devices.conflicts.store(2, Ordering::SeqCst);
        let err = js
            .handle_join(
                &cluster_ctx(),
                &cluster(),
                request("00ffffffffffffff42ffffffffffff424202002d82ce28", MacVersion::V1_1),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRANSACTION_CONFLICT");

        let dev = devices.get_by_eui(ids().join_eui, ids().dev_eui).await.unwrap();
        assert_eq!(dev.session.unwrap().keys.session_key_id, current);
        assert_eq!(keys.range_by_dev_eui(ids().dev_eui).await.unwrap(), vec![current]);
        assert!(keys.get_by_id(ids().dev_eui, current).await.is_ok());
    }

    #[tokio::test]
    async fn test_successful_join_prunes_key_history() {
        let (js, _, keys) = contended_with_key_limit(0, Some(1)).await;
        js.handle_join(&cluster_ctx(), &cluster(), request(S2_JOIN_REQUEST, MacVersion::V1_1))
            .await
            .unwrap();
        let second = js
            .handle_join(
                &cluster_ctx(),
                &cluster(),
                request("00ffffffffffffff42ffffffffffff424202002d82ce28", MacVersion::V1_1),
            )
            .await
            .unwrap();
        assert_eq!(
            keys.range_by_dev_eui(ids().dev_eui).await.unwrap(),
            vec![second.session_keys.session_key_id]
        );
    }

    #[test]
    fn test_check_dev_nonce() {
        let mut dev = EndDevice::new(ids());
        let next = check_dev_nonce(&dev, MacVersion::V1_1, 0, 32).unwrap();
        assert_eq!(next.last_dev_nonce, 0);

        dev.last_join_nonce = 1;
        assert!(check_dev_nonce(&dev, MacVersion::V1_1, 0, 32).is_err());
        assert_eq!(
            check_dev_nonce(&dev, MacVersion::V1_1, 1, 32)
                .unwrap()
                .last_dev_nonce,
            1
        );

        dev.used_dev_nonces = vec![2, 5];
        let next = check_dev_nonce(&dev, MacVersion::V1_0_2, 3, 32).unwrap();
        assert_eq!(next.used_dev_nonces, vec![2, 3, 5]);
        assert_eq!(next.last_dev_nonce, dev.last_dev_nonce);
        assert_eq!(
            check_dev_nonce(&dev, MacVersion::V1_0_2, 5, 32).unwrap_err(),
            Error::ReuseDevNonce(5)
        );
    }

    #[test]
    fn test_address_kek_label() {
        assert_eq!(
            address_kek_label("ns", Some("https://nsa.example:8886")),
            "ns:nsa.example"
        );
        assert_eq!(address_kek_label("as", None), "");
    }

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio_test::block_on(f)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_1_1_nonces_increase(nonces in proptest::collection::vec(0u16..64, 1..12)) {
            block_on(async {
                let h = harness();
                store(&h, device(MacVersion::V1_1, 0x01, Some(0x01))).await;
                let nwk_key = AesKey([0x01; 16]);

                let mut accepted: Vec<(u16, u32)> = Vec::new();
                for dn in nonces {
                    let before = stored(&h).await;
                    let req = JoinRequest::new(
                        signed_request(&nwk_key, dn),
                        MacVersion::V1_1,
                        "42FFFF".parse().unwrap(),
                        "42FFFFFF".parse().unwrap(),
                    );
                    let res = h.js.handle_join(&cluster_ctx(), &cluster(), req).await;
                    let after = stored(&h).await;
                    match res {
                        Ok(_) => {
                            if let Some((last_dn, last_jn)) = accepted.last() {
                                prop_assert!(dn > *last_dn);
                                prop_assert_eq!(after.last_join_nonce, last_jn + 1);
                            }
                            prop_assert_eq!(after.last_dev_nonce, dn as u32);
                            accepted.push((dn, after.last_join_nonce));
                        }
                        Err(err) => {
                            prop_assert_eq!(err.code(), "DEV_NONCE_TOO_SMALL");
                            prop_assert!(!accepted.is_empty());
                            prop_assert_eq!(NonceState::of(&after), NonceState::of(&before));
                            prop_assert_eq!(after.session, before.session);
                        }
                    }
                }
                Ok(())
            })?;
        }

        #[test]
        fn prop_1_0_nonces_never_repeat(nonces in proptest::collection::vec(0u16..16, 1..12)) {
            block_on(async {
                let h = harness();
                store(&h, device(MacVersion::V1_0_3, 0x02, None)).await;
                let app_key = AesKey([0x02; 16]);

                let mut seen = std::collections::BTreeSet::new();
                let mut join_nonce = 0;
                for dn in nonces {
                    let before = stored(&h).await;
                    let req = JoinRequest::new(
                        signed_request(&app_key, dn),
                        MacVersion::V1_0_3,
                        "42FFFF".parse().unwrap(),
                        "42FFFFFF".parse().unwrap(),
                    );
                    let res = h.js.handle_join(&cluster_ctx(), &cluster(), req).await;
                    let after = stored(&h).await;
                    if seen.insert(dn) {
                        prop_assert!(res.is_ok());
                        join_nonce += 1;
                        prop_assert_eq!(after.last_join_nonce, join_nonce);
                        prop_assert!(after.used_dev_nonces.windows(2).all(|w| w[0] < w[1]));
                    } else {
                        prop_assert_eq!(res.unwrap_err(), Error::ReuseDevNonce(dn));
                        prop_assert_eq!(NonceState::of(&after), NonceState::of(&before));
                    }
                }
                Ok(())
            })?;
        }

        #[test]
        fn prop_join_accept_decrypts(
            dev_nonce in 0u16..1024,
            cf_list in proptest::option::of(proptest::array::uniform16(any::<u8>())),
        ) {
            block_on(async {
                let h = harness();
                store(&h, device(MacVersion::V1_0_3, 0x02, None)).await;
                let app_key = AesKey([0x02; 16]);
                let mut req = JoinRequest::new(
                    signed_request(&app_key, dev_nonce),
                    MacVersion::V1_0_3,
                    "42FFFF".parse().unwrap(),
                    "42FFFFFF".parse().unwrap(),
                );
                req.cf_list = cf_list;
                let res = h.js.handle_join(&cluster_ctx(), &cluster(), req).await.unwrap();

                let mut plain = vec![res.raw_payload[0]];
                plain.extend(primitives::decrypt_join_accept(&app_key, &res.raw_payload[1..]).unwrap());
                let accept = JoinAcceptMessage::parse(&plain).unwrap();
                prop_assert_eq!(accept.payload.join_nonce, 1);
                prop_assert_eq!(accept.payload.cf_list, cf_list);
                prop_assert_eq!(accept.build().unwrap(), plain.clone());
                let mic = primitives::compute_legacy_join_accept_mic(&app_key, &plain[..plain.len() - 4]);
                prop_assert_eq!(accept.mic, mic);
                Ok(())
            })?;
        }
    }
}
