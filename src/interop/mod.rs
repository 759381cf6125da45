//! Backend Interfaces front end
//!
//! [`InteropHandler`] answers `JoinReq`, `HomeNSReq` and `AppSKeyReq`
//! messages from peers in other networks. Requests run through the Join
//! Server with the interop authorizer; the transport edge is expected to
//! have authenticated the peer (TLS client certificate) and put its identity
//! in the [`Context`]. Failures never surface as errors: every answer
//! carries a `Result` object instead.

pub mod messages;

use std::sync::Arc;
use tracing::debug;

use crate::auth::{Authorizer, Context};
use crate::error::{Error, Result};
use crate::joinserver::{JoinRequest, JoinServer, SessionKeyRequest};
use crate::lorawan::encoder::CF_LIST_LEN;
use crate::lorawan::keys::KeyEnvelope;
use crate::lorawan::{DlSettings, Eui64, NetId};

pub use messages::{
    AnswerResult, AppSKeyAns, AppSKeyReq, HomeNsAns, HomeNsReq, InteropKeyEnvelope, JoinAns,
    JoinReq, MessageHeader, MessageType, ProtocolVersion, ResultCode,
};

/// Result code for a failed request. `fallback` covers errors without a
/// dedicated code.
pub fn result_code(err: &Error, fallback: ResultCode) -> ResultCode {
    use Error::*;
    match err {
        MicMismatch => ResultCode::MicFailed,
        DeviceNotFound => ResultCode::UnknownDevEui,
        DecodePayload(_)
        | WrongPayloadType(_)
        | UnsupportedLorawanMajor(_)
        | UnsupportedMacVersion(_)
        | NoJoinRequest
        | NoDevEui
        | NoJoinEui
        | NoDevAddr
        | InvalidField(..) => ResultCode::MalformedMessage,
        NetIdMismatch { .. } | NoNetId => ResultCode::ActivationDisallowed,
        UnknownJoinEui(_) | UnknownAppEui(_) | ForwardJoinRequest(_) => {
            ResultCode::UnknownReceiver
        }
        Unauthenticated(_) | PermissionDenied(_) => ResultCode::UnknownSender,
        _ => fallback,
    }
}

fn failure(err: &Error, fallback: ResultCode) -> AnswerResult {
    AnswerResult {
        result_code: result_code(err, fallback),
        description: err.to_string(),
    }
}

pub struct InteropHandler {
    js: Arc<JoinServer>,
    authorizer: Authorizer,
}

impl InteropHandler {
    pub fn new(js: Arc<JoinServer>) -> Self {
        Self {
            js,
            authorizer: Authorizer::Interop,
        }
    }

    /// Handle a JSON request and return the JSON answer. Only a body
    /// without a readable message header is rejected outright.
    pub async fn handle_message(&self, ctx: &Context, body: &[u8]) -> Result<Vec<u8>> {
        let header: MessageHeader = serde_json::from_slice(body)
            .map_err(|e| Error::DecodePayload(format!("message header: {}", e)))?;
        debug!(
            transaction_id = header.transaction_id,
            message_type = ?header.message_type,
            sender_id = %header.sender_id,
            "Interop request"
        );

        let answer = match header.message_type {
            MessageType::JoinReq => match serde_json::from_slice::<JoinReq>(body) {
                Ok(req) => serde_json::to_vec(&self.join_req(ctx, req).await),
                Err(e) => serde_json::to_vec(&JoinAns::failed(
                    self.answer_header(&header, MessageType::JoinAns),
                    malformed(e),
                )),
            },
            MessageType::HomeNsReq => match serde_json::from_slice::<HomeNsReq>(body) {
                Ok(req) => serde_json::to_vec(&self.home_ns_req(ctx, req).await),
                Err(e) => serde_json::to_vec(&HomeNsAns {
                    header: self.answer_header(&header, MessageType::HomeNsAns),
                    result: malformed(e),
                    h_net_id: None,
                    h_ns_id: None,
                }),
            },
            MessageType::AppSKeyReq => match serde_json::from_slice::<AppSKeyReq>(body) {
                Ok(req) => serde_json::to_vec(&self.app_s_key_req(ctx, req).await),
                Err(e) => serde_json::to_vec(&AppSKeyAns {
                    header: self.answer_header(&header, MessageType::AppSKeyAns),
                    result: malformed(e),
                    dev_eui: Eui64::ZERO,
                    app_s_key: None,
                    session_key_id: String::new(),
                }),
            },
            other => {
                return Err(Error::InvalidField(
                    "MessageType".to_string(),
                    format!("{:?} is not a request", other),
                ))
            }
        };
        answer.map_err(|e| Error::EncodePayload(e.to_string()))
    }

    pub async fn join_req(&self, ctx: &Context, req: JoinReq) -> JoinAns {
        let header = self.answer_header(&req.header, MessageType::JoinAns);
        match self.join(ctx, &req).await {
            Ok(ans) => JoinAns { header, ..ans },
            Err(err) => JoinAns::failed(header, failure(&err, ResultCode::JoinReqFailed)),
        }
    }

    async fn join(&self, ctx: &Context, req: &JoinReq) -> Result<JoinAns> {
        self.check_receiver(&req.header)?;
        let net_id: NetId = req.header.sender_id.parse()?;
        let cf_list = match &req.cf_list {
            None => None,
            Some(cf_list) => Some(<[u8; CF_LIST_LEN]>::try_from(cf_list.as_slice()).map_err(
                |_| Error::InvalidField("CFList".to_string(), format!("{} bytes", cf_list.len())),
            )?),
        };

        let res = self
            .js
            .handle_join(
                ctx,
                &self.authorizer,
                JoinRequest {
                    raw_payload: Some(req.phy_payload.clone()),
                    payload: None,
                    selected_mac_version: req.mac_version,
                    net_id,
                    dev_addr: req.dev_addr,
                    dl_settings: DlSettings(req.dl_settings),
                    rx_delay: req.rx_delay,
                    cf_list,
                },
            )
            .await?;

        let keys = &res.session_keys;
        let envelope = |k: &Option<KeyEnvelope>| k.as_ref().map(InteropKeyEnvelope::from);
        let mut ans = JoinAns::failed(req.header.clone(), AnswerResult::success());
        ans.phy_payload = Some(res.raw_payload.clone());
        ans.lifetime = Some(res.lifetime.as_secs()).filter(|s| *s > 0);
        if req.mac_version.is_1_1() {
            ans.f_nwk_s_int_key = envelope(&keys.f_nwk_s_int_key);
            ans.s_nwk_s_int_key = envelope(&keys.s_nwk_s_int_key);
            ans.nwk_s_enc_key = envelope(&keys.nwk_s_enc_key);
        } else {
            ans.nwk_s_key = envelope(&keys.f_nwk_s_int_key);
        }
        ans.app_s_key = envelope(&keys.app_s_key);
        ans.session_key_id = Some(hex::encode_upper(keys.session_key_id.0));
        Ok(ans)
    }

    pub async fn home_ns_req(&self, ctx: &Context, req: HomeNsReq) -> HomeNsAns {
        let header = self.answer_header(&req.header, MessageType::HomeNsAns);
        let res = async {
            let join_eui = self.check_receiver(&req.header)?;
            self.js
                .get_home_network(ctx, &self.authorizer, join_eui, req.dev_eui)
                .await
        }
        .await;
        match res {
            Ok(home) => HomeNsAns {
                h_ns_id: home.ns_id.filter(|_| header.protocol_version.has_ns_id()),
                header,
                result: AnswerResult::success(),
                h_net_id: Some(home.net_id),
            },
            Err(err) => {
                debug!(code = err.code(), error = %err, "HomeNSReq failed");
                HomeNsAns {
                    header,
                    result: failure(&err, ResultCode::Other),
                    h_net_id: None,
                    h_ns_id: None,
                }
            }
        }
    }

    pub async fn app_s_key_req(&self, ctx: &Context, req: AppSKeyReq) -> AppSKeyAns {
        let header = self.answer_header(&req.header, MessageType::AppSKeyAns);
        let res = async {
            let join_eui = self.check_receiver(&req.header)?;
            let session_key_id = req.session_key_id.parse()?;
            self.js
                .get_app_s_key(
                    ctx,
                    &self.authorizer,
                    &SessionKeyRequest {
                        session_key_id,
                        join_eui,
                        dev_eui: req.dev_eui,
                    },
                )
                .await
        }
        .await;
        let (result, app_s_key) = match res {
            Ok(res) => (
                AnswerResult::success(),
                Some(InteropKeyEnvelope::from(&res.app_s_key)),
            ),
            Err(err) => {
                debug!(code = err.code(), error = %err, "AppSKeyReq failed");
                (failure(&err, ResultCode::Other), None)
            }
        };
        AppSKeyAns {
            header,
            result,
            dev_eui: req.dev_eui,
            app_s_key,
            session_key_id: req.session_key_id,
        }
    }

    /// The receiver must be a JoinEUI this Join Server serves.
    fn check_receiver(&self, header: &MessageHeader) -> Result<Eui64> {
        let join_eui: Eui64 = header.receiver_id.parse()?;
        if !self.js.config().serves_join_eui(join_eui) {
            return Err(Error::UnknownJoinEui(join_eui.to_string()));
        }
        Ok(join_eui)
    }

    /// Answers are sent as the addressed JoinEUI, or as the default JoinEUI
    /// when the receiver ID is unreadable.
    fn answer_header(&self, req: &MessageHeader, message_type: MessageType) -> MessageHeader {
        let sender_id = match req.receiver_id.parse::<Eui64>() {
            Ok(join_eui) => join_eui.to_string(),
            Err(_) => self
                .js
                .config()
                .default_join_eui
                .map(|eui| eui.to_string())
                .unwrap_or_default(),
        };
        req.answer(message_type, sender_id)
    }
}

fn malformed(err: serde_json::Error) -> AnswerResult {
    AnswerResult {
        result_code: ResultCode::MalformedMessage,
        description: err.to_string(),
    }
}
