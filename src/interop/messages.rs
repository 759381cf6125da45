//! LoRaWAN Backend Interfaces messages (JSON)
//!
//! Reference: LoRaWAN Backend Interfaces Specification 1.0 and 1.1.
//!
//! Field names follow the Backend Interfaces JSON encoding. Identifiers and
//! byte strings are upper-case hex. NSID fields only exist in protocol 1.1.

use serde::{Deserialize, Serialize};

use crate::lorawan::keys::{hex_bytes, KeyEnvelope};
use crate::lorawan::{DevAddr, Eui64, MacVersion, NetId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "1.0")]
    V1_0,
    #[serde(rename = "1.1")]
    V1_1,
}

impl ProtocolVersion {
    pub fn has_ns_id(self) -> bool {
        self == ProtocolVersion::V1_1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    JoinReq,
    JoinAns,
    #[serde(rename = "HomeNSReq")]
    HomeNsReq,
    #[serde(rename = "HomeNSAns")]
    HomeNsAns,
    #[serde(rename = "AppSKeyReq")]
    AppSKeyReq,
    #[serde(rename = "AppSKeyAns")]
    AppSKeyAns,
}

impl MessageType {
    /// Answer type of a request type.
    pub fn answer(self) -> Option<MessageType> {
        match self {
            MessageType::JoinReq => Some(MessageType::JoinAns),
            MessageType::HomeNsReq => Some(MessageType::HomeNsAns),
            MessageType::AppSKeyReq => Some(MessageType::AppSKeyAns),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    #[serde(rename = "MICFailed")]
    MicFailed,
    JoinReqFailed,
    ActivationDisallowed,
    #[serde(rename = "UnknownDevEUI")]
    UnknownDevEui,
    MalformedMessage,
    UnknownReceiver,
    UnknownSender,
    Other,
}

/// `Result` object of an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerResult {
    #[serde(rename = "ResultCode")]
    pub result_code: ResultCode,
    #[serde(rename = "Description", default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl AnswerResult {
    pub fn success() -> Self {
        Self {
            result_code: ResultCode::Success,
            description: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result_code == ResultCode::Success
    }
}

/// Fields common to every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    #[serde(rename = "ProtocolVersion")]
    pub protocol_version: ProtocolVersion,
    #[serde(rename = "SenderID")]
    pub sender_id: String,
    #[serde(rename = "ReceiverID")]
    pub receiver_id: String,
    #[serde(rename = "TransactionID")]
    pub transaction_id: u32,
    #[serde(rename = "MessageType")]
    pub message_type: MessageType,
    #[serde(rename = "SenderNSID", default, skip_serializing_if = "Option::is_none")]
    pub sender_ns_id: Option<String>,
    #[serde(rename = "ReceiverNSID", default, skip_serializing_if = "Option::is_none")]
    pub receiver_ns_id: Option<String>,
}

impl MessageHeader {
    /// Header of the answer to this request, sent by `sender_id`.
    pub fn answer(&self, message_type: MessageType, sender_id: String) -> MessageHeader {
        let ns_id = self.protocol_version.has_ns_id();
        MessageHeader {
            protocol_version: self.protocol_version,
            sender_id,
            receiver_id: self.sender_id.clone(),
            transaction_id: self.transaction_id,
            message_type,
            sender_ns_id: None,
            receiver_ns_id: self.sender_ns_id.clone().filter(|_| ns_id),
        }
    }
}

/// Key as carried in answers: wrapped under `KEKLabel`, or plaintext when
/// the label is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteropKeyEnvelope {
    #[serde(rename = "KEKLabel", default)]
    pub kek_label: String,
    #[serde(rename = "AESKey", with = "hex_bytes")]
    pub aes_key: Vec<u8>,
}

impl From<&KeyEnvelope> for InteropKeyEnvelope {
    fn from(envelope: &KeyEnvelope) -> Self {
        match envelope {
            KeyEnvelope::Wrapped {
                kek_label,
                encrypted_key,
            } => Self {
                kek_label: kek_label.clone(),
                aes_key: encrypted_key.clone(),
            },
            KeyEnvelope::Plain { key } => Self {
                kek_label: String::new(),
                aes_key: key.as_bytes().to_vec(),
            },
        }
    }
}

mod hex_u8 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u8, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:02X}", v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u8, D::Error> {
        let s = String::deserialize(d)?;
        u8::from_str_radix(&s, 16).map_err(serde::de::Error::custom)
    }
}

mod hex_bytes_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(v) => s.serialize_str(&hex::encode_upper(v)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinReq {
    #[serde(flatten)]
    pub header: MessageHeader,
    #[serde(rename = "MACVersion")]
    pub mac_version: MacVersion,
    #[serde(rename = "PHYPayload", with = "hex_bytes")]
    pub phy_payload: Vec<u8>,
    #[serde(rename = "DevEUI")]
    pub dev_eui: Eui64,
    #[serde(rename = "DevAddr")]
    pub dev_addr: DevAddr,
    #[serde(rename = "DLSettings", with = "hex_u8")]
    pub dl_settings: u8,
    #[serde(rename = "RxDelay")]
    pub rx_delay: u8,
    #[serde(
        rename = "CFList",
        with = "hex_bytes_opt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cf_list: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAns {
    #[serde(flatten)]
    pub header: MessageHeader,
    #[serde(
        rename = "PHYPayload",
        with = "hex_bytes_opt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub phy_payload: Option<Vec<u8>>,
    #[serde(rename = "Result")]
    pub result: AnswerResult,
    /// Session key lifetime in seconds.
    #[serde(rename = "Lifetime", default, skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<u64>,
    /// LoRaWAN 1.0 network session key.
    #[serde(rename = "NwkSKey", default, skip_serializing_if = "Option::is_none")]
    pub nwk_s_key: Option<InteropKeyEnvelope>,
    #[serde(rename = "FNwkSIntKey", default, skip_serializing_if = "Option::is_none")]
    pub f_nwk_s_int_key: Option<InteropKeyEnvelope>,
    #[serde(rename = "SNwkSIntKey", default, skip_serializing_if = "Option::is_none")]
    pub s_nwk_s_int_key: Option<InteropKeyEnvelope>,
    #[serde(rename = "NwkSEncKey", default, skip_serializing_if = "Option::is_none")]
    pub nwk_s_enc_key: Option<InteropKeyEnvelope>,
    #[serde(rename = "AppSKey", default, skip_serializing_if = "Option::is_none")]
    pub app_s_key: Option<InteropKeyEnvelope>,
    #[serde(rename = "SessionKeyID", default, skip_serializing_if = "Option::is_none")]
    pub session_key_id: Option<String>,
}

impl JoinAns {
    pub fn failed(header: MessageHeader, result: AnswerResult) -> Self {
        Self {
            header,
            phy_payload: None,
            result,
            lifetime: None,
            nwk_s_key: None,
            f_nwk_s_int_key: None,
            s_nwk_s_int_key: None,
            nwk_s_enc_key: None,
            app_s_key: None,
            session_key_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeNsReq {
    #[serde(flatten)]
    pub header: MessageHeader,
    #[serde(rename = "DevEUI")]
    pub dev_eui: Eui64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeNsAns {
    #[serde(flatten)]
    pub header: MessageHeader,
    #[serde(rename = "Result")]
    pub result: AnswerResult,
    #[serde(rename = "HNetID", default, skip_serializing_if = "Option::is_none")]
    pub h_net_id: Option<NetId>,
    /// Home Network Server ID. Protocol 1.1 only.
    #[serde(rename = "HNSID", default, skip_serializing_if = "Option::is_none")]
    pub h_ns_id: Option<Eui64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSKeyReq {
    #[serde(flatten)]
    pub header: MessageHeader,
    #[serde(rename = "DevEUI")]
    pub dev_eui: Eui64,
    #[serde(rename = "SessionKeyID")]
    pub session_key_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSKeyAns {
    #[serde(flatten)]
    pub header: MessageHeader,
    #[serde(rename = "Result")]
    pub result: AnswerResult,
    #[serde(rename = "DevEUI")]
    pub dev_eui: Eui64,
    #[serde(rename = "AppSKey", default, skip_serializing_if = "Option::is_none")]
    pub app_s_key: Option<InteropKeyEnvelope>,
    #[serde(rename = "SessionKeyID")]
    pub session_key_id: String,
}
