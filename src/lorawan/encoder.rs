//! LoRaWAN join-accept encoder
//!
//! Builds the plaintext join-accept that the Join Server MICs and encrypts.
//!
//! Frame structure (before encryption):
//!   MHDR(1) | JoinNonce(3,LE) | NetID(3,LE) | DevAddr(4,LE) | DLSettings(1) | RxDelay(1) | [CFList(16)] | MIC(4)
//!
//! Everything after the MHDR is encrypted as a whole, so the body plus MIC
//! is always 16 or 32 bytes.

use bytes::{Buf, BufMut, BytesMut};

use super::{DevAddr, DlSettings, Mhdr, MType, NetId};
use crate::error::Error;

/// Largest value a 24-bit JoinNonce can take.
pub const MAX_JOIN_NONCE: u32 = 0x00FF_FFFF;

/// Length of an optional channel-frequency list.
pub const CF_LIST_LEN: usize = 16;

/// Join-accept fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAcceptPayload {
    /// Server counter (24-bit)
    pub join_nonce: u32,
    pub net_id: NetId,
    pub dev_addr: DevAddr,
    pub dl_settings: DlSettings,
    /// RX1 delay in seconds (0 means 1)
    pub rx_delay: u8,
    pub cf_list: Option<[u8; CF_LIST_LEN]>,
}

impl JoinAcceptPayload {
    /// MHDR and body, without MIC. This is the MIC input for pre-1.1
    /// devices and the tail of the MIC input for 1.1 devices.
    pub fn build(&self) -> Result<Vec<u8>, Error> {
        if self.join_nonce > MAX_JOIN_NONCE {
            return Err(Error::EncodePayload(format!(
                "JoinNonce {:#X} exceeds 24 bits",
                self.join_nonce
            )));
        }

        let mut frame = BytesMut::with_capacity(13 + CF_LIST_LEN);
        frame.put_u8(Mhdr::JOIN_ACCEPT.to_byte());
        frame.put_uint_le(self.join_nonce as u64, 3);
        frame.put_slice(&self.net_id.to_le_bytes());
        frame.put_slice(&self.dev_addr.to_le_bytes());
        frame.put_u8(self.dl_settings.0);
        frame.put_u8(self.rx_delay);
        if let Some(cf_list) = &self.cf_list {
            frame.put_slice(cf_list);
        }
        Ok(frame.to_vec())
    }
}

/// A plaintext join-accept with its MIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAcceptMessage {
    pub payload: JoinAcceptPayload,
    pub mic: [u8; 4],
}

impl JoinAcceptMessage {
    pub fn build(&self) -> Result<Vec<u8>, Error> {
        let mut frame = self.payload.build()?;
        frame.extend_from_slice(&self.mic);
        Ok(frame)
    }

    /// Parse a decrypted join-accept (MHDR, body, optional CFList and MIC).
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let has_cf_list = match data.len() {
            17 => false,
            33 => true,
            n => {
                return Err(Error::DecodePayload(format!(
                    "join-accept must be 17 or 33 bytes, got {}",
                    n
                )))
            }
        };

        let mut buf = data;
        let mhdr = Mhdr::from(buf.get_u8());
        if mhdr.mtype != MType::JoinAccept {
            return Err(Error::DecodePayload(format!(
                "expected JoinAccept, got {}",
                mhdr.mtype
            )));
        }

        let join_nonce = buf.get_uint_le(3) as u32;
        let mut net_id = [0u8; 3];
        buf.copy_to_slice(&mut net_id);
        let mut dev_addr = [0u8; 4];
        buf.copy_to_slice(&mut dev_addr);
        let dl_settings = DlSettings(buf.get_u8());
        let rx_delay = buf.get_u8();
        let cf_list = if has_cf_list {
            let mut cf_list = [0u8; CF_LIST_LEN];
            buf.copy_to_slice(&mut cf_list);
            Some(cf_list)
        } else {
            None
        };
        let mut mic = [0u8; 4];
        buf.copy_to_slice(&mut mic);

        Ok(Self {
            payload: JoinAcceptPayload {
                join_nonce,
                net_id: NetId::from_le_bytes(net_id),
                dev_addr: DevAddr::from_le_bytes(dev_addr),
                dl_settings,
                rx_delay,
                cf_list,
            },
            mic,
        })
    }
}
