pub mod encoder;
pub mod keys;
pub mod types;

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

use crate::error::Error;
pub use types::{DevAddr, DlSettings, Eui64, JoinEuiPrefix, MacVersion, NetId};

/// Length of a join-request PHY payload.
pub const JOIN_REQUEST_LEN: usize = 23;

/// Join-request type byte used in the 1.1 join-accept MIC.
pub const JOIN_REQUEST_TYPE: u8 = 0xFF;

/// LoRaWAN MAC Header (MHDR) - Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl MType {
    fn bits(self) -> u8 {
        match self {
            MType::JoinRequest => 0b000,
            MType::JoinAccept => 0b001,
            MType::UnconfirmedDataUp => 0b010,
            MType::UnconfirmedDataDown => 0b011,
            MType::ConfirmedDataUp => 0b100,
            MType::ConfirmedDataDown => 0b101,
            MType::RejoinRequest => 0b110,
            MType::Proprietary => 0b111,
        }
    }
}

impl From<u8> for MType {
    fn from(mhdr: u8) -> Self {
        match (mhdr >> 5) & 0x07 {
            0b000 => MType::JoinRequest,
            0b001 => MType::JoinAccept,
            0b010 => MType::UnconfirmedDataUp,
            0b011 => MType::UnconfirmedDataDown,
            0b100 => MType::ConfirmedDataUp,
            0b101 => MType::ConfirmedDataDown,
            0b110 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MType::JoinRequest => write!(f, "JoinRequest"),
            MType::JoinAccept => write!(f, "JoinAccept"),
            MType::UnconfirmedDataUp => write!(f, "UnconfirmedDataUp"),
            MType::UnconfirmedDataDown => write!(f, "UnconfirmedDataDown"),
            MType::ConfirmedDataUp => write!(f, "ConfirmedDataUp"),
            MType::ConfirmedDataDown => write!(f, "ConfirmedDataDown"),
            MType::RejoinRequest => write!(f, "RejoinRequest"),
            MType::Proprietary => write!(f, "Proprietary"),
        }
    }
}

/// LoRaWAN Major version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Major {
    LoRaWANR1,
    Unknown(u8),
}

impl From<u8> for Major {
    fn from(mhdr: u8) -> Self {
        match mhdr & 0x03 {
            0 => Major::LoRaWANR1,
            other => Major::Unknown(other),
        }
    }
}

/// MAC header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mhdr {
    pub mtype: MType,
    pub major: Major,
}

impl Mhdr {
    pub const JOIN_REQUEST: Mhdr = Mhdr {
        mtype: MType::JoinRequest,
        major: Major::LoRaWANR1,
    };

    pub const JOIN_ACCEPT: Mhdr = Mhdr {
        mtype: MType::JoinAccept,
        major: Major::LoRaWANR1,
    };

    pub fn to_byte(self) -> u8 {
        let major = match self.major {
            Major::LoRaWANR1 => 0,
            Major::Unknown(m) => m & 0x03,
        };
        (self.mtype.bits() << 5) | major
    }
}

impl From<u8> for Mhdr {
    fn from(b: u8) -> Self {
        Mhdr {
            mtype: MType::from(b),
            major: Major::from(b),
        }
    }
}

/// Decoded join-request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequestPayload {
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_nonce: u16,
}

/// A join-request PHY payload (MHDR, body and MIC).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequestMessage {
    pub mhdr: Mhdr,
    pub payload: Option<JoinRequestPayload>,
    pub mic: [u8; 4],
}

impl JoinRequestMessage {
    pub fn new(payload: JoinRequestPayload, mic: [u8; 4]) -> Self {
        Self {
            mhdr: Mhdr::JOIN_REQUEST,
            payload: Some(payload),
            mic,
        }
    }

    /// Serialize to the 23-byte on-air form.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let payload = self.payload.as_ref().ok_or(Error::NoJoinRequest)?;
        let mut buf = BytesMut::with_capacity(JOIN_REQUEST_LEN);
        buf.put_u8(self.mhdr.to_byte());
        buf.put_slice(&payload.join_eui.to_le_bytes());
        buf.put_slice(&payload.dev_eui.to_le_bytes());
        buf.put_u16_le(payload.dev_nonce);
        buf.put_slice(&self.mic);
        Ok(buf.to_vec())
    }
}

impl fmt::Display for JoinRequestMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Some(p) => write!(
                f,
                "{} JoinEUI={} DevEUI={} DevNonce={:04X} MIC={}",
                self.mhdr.mtype,
                p.join_eui,
                p.dev_eui,
                p.dev_nonce,
                hex::encode_upper(self.mic)
            ),
            None => write!(f, "{} (no payload)", self.mhdr.mtype),
        }
    }
}

/// Decode a join-request PHY payload.
///
/// MHDR(1) + JoinEUI(8) + DevEUI(8) + DevNonce(2) + MIC(4) = 23 bytes. The
/// MType is not checked here so the caller can report it precisely.
pub fn decode_join_request(data: &[u8]) -> Result<JoinRequestMessage, Error> {
    if data.len() != JOIN_REQUEST_LEN {
        return Err(Error::DecodePayload(format!(
            "join-request must be {} bytes, got {}",
            JOIN_REQUEST_LEN,
            data.len()
        )));
    }

    let mut buf = data;
    let mhdr = Mhdr::from(buf.get_u8());
    let mut join_eui = [0u8; 8];
    buf.copy_to_slice(&mut join_eui);
    let mut dev_eui = [0u8; 8];
    buf.copy_to_slice(&mut dev_eui);
    let dev_nonce = buf.get_u16_le();
    let mut mic = [0u8; 4];
    buf.copy_to_slice(&mut mic);

    Ok(JoinRequestMessage {
        mhdr,
        payload: Some(JoinRequestPayload {
            join_eui: Eui64::from_le_bytes(join_eui),
            dev_eui: Eui64::from_le_bytes(dev_eui),
            dev_nonce,
        }),
        mic,
    })
}
