//! LoRaWAN identifiers: EUI64, DevAddr, NetID, JoinEUI prefixes, MAC versions
//!
//! All identifiers are held most-significant byte first (the way they are
//! written on labels and in the Backend-Interfaces JSON) and are reversed to
//! little-endian only when they go on the air. They serialize as upper-case
//! hex strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

fn decode_hex<const N: usize>(name: &str, s: &str) -> Result<[u8; N], Error> {
    let bytes = hex::decode(s.trim())
        .map_err(|e| Error::InvalidField(name.to_string(), e.to_string()))?;
    bytes.as_slice().try_into().map_err(|_| {
        Error::InvalidField(
            name.to_string(),
            format!("expected {} bytes, got {}", N, bytes.len()),
        )
    })
}

/// Reverse a byte array (MSB-first <-> little-endian on-air order).
pub(crate) fn reversed<const N: usize>(mut b: [u8; N]) -> [u8; N] {
    b.reverse();
    b
}

/// 64-bit extended unique identifier (JoinEUI, DevEUI, NSID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Eui64(pub [u8; 8]);

impl Eui64 {
    pub const ZERO: Eui64 = Eui64([0; 8]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 8]
    }

    pub fn from_le_bytes(b: [u8; 8]) -> Self {
        Eui64(reversed(b))
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        reversed(self.0)
    }

    pub fn to_u64(self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl From<u64> for Eui64 {
    fn from(v: u64) -> Self {
        Eui64(v.to_be_bytes())
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl FromStr for Eui64 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex("eui64", s).map(Eui64)
    }
}

impl TryFrom<String> for Eui64 {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Eui64> for String {
    fn from(v: Eui64) -> Self {
        v.to_string()
    }
}

/// Number of NwkID bits for each NetID type (0..=7).
const NWK_ID_BITS: [u32; 8] = [6, 6, 9, 11, 12, 13, 15, 17];

/// 24-bit network identifier: 3-bit type and 21-bit ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetId(pub [u8; 3]);

impl NetId {
    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes([0, self.0[0], self.0[1], self.0[2]])
    }

    pub fn from_le_bytes(b: [u8; 3]) -> Self {
        NetId(reversed(b))
    }

    pub fn to_le_bytes(self) -> [u8; 3] {
        reversed(self.0)
    }

    /// NetID type (the 3 most significant bits).
    pub fn net_id_type(self) -> u8 {
        self.0[0] >> 5
    }

    /// The 21-bit ID field.
    pub fn id(self) -> u32 {
        self.to_u32() & 0x1F_FFFF
    }

    /// The NwkID carried in DevAddrs issued under this NetID.
    pub fn nwk_id(self) -> u32 {
        let bits = NWK_ID_BITS[self.net_id_type() as usize];
        self.id() & ((1 << bits) - 1)
    }

    /// DevAddr prefix (address and prefix length) for this NetID.
    pub fn dev_addr_prefix(self) -> (DevAddr, u32) {
        let t = self.net_id_type() as u32;
        let type_len = t + 1;
        let nwk_bits = NWK_ID_BITS[t as usize];
        // Type prefix is `t` ones followed by a zero.
        let type_prefix: u32 = ((1u32 << t) - 1) << 1;
        let addr = (type_prefix << (32 - type_len)) | (self.nwk_id() << (32 - type_len - nwk_bits));
        (DevAddr::from(addr), type_len + nwk_bits)
    }
}

impl From<u32> for NetId {
    fn from(v: u32) -> Self {
        let b = v.to_be_bytes();
        NetId([b[1], b[2], b[3]])
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl FromStr for NetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex("net_id", s).map(NetId)
    }
}

impl TryFrom<String> for NetId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NetId> for String {
    fn from(v: NetId) -> Self {
        v.to_string()
    }
}

/// 32-bit device session address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DevAddr(pub [u8; 4]);

impl DevAddr {
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 4]
    }

    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub fn from_le_bytes(b: [u8; 4]) -> Self {
        DevAddr(reversed(b))
    }

    pub fn to_le_bytes(self) -> [u8; 4] {
        reversed(self.0)
    }

    /// NetID type encoded by the leading ones of the address, if any.
    pub fn net_id_type(self) -> Option<u8> {
        let ones = self.to_u32().leading_ones();
        if ones > 7 {
            None
        } else {
            Some(ones as u8)
        }
    }

    /// NwkID bits of the address.
    pub fn nwk_id(self) -> Option<u32> {
        let t = self.net_id_type()? as u32;
        let bits = NWK_ID_BITS[t as usize];
        let shift = 32 - (t + 1) - bits;
        Some((self.to_u32() >> shift) & ((1 << bits) - 1))
    }

    /// NwkAddr bits of the address.
    pub fn nwk_addr(self) -> Option<u32> {
        let t = self.net_id_type()? as u32;
        let bits = 32 - (t + 1) - NWK_ID_BITS[t as usize];
        Some(self.to_u32() & ((1u32 << bits) - 1))
    }

    /// Whether this address was issued under `net_id`.
    pub fn belongs_to(self, net_id: NetId) -> bool {
        let (prefix, len) = net_id.dev_addr_prefix();
        let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
        self.to_u32() & mask == prefix.to_u32() & mask
    }
}

impl From<u32> for DevAddr {
    fn from(v: u32) -> Self {
        DevAddr(v.to_be_bytes())
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl FromStr for DevAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex("dev_addr", s).map(DevAddr)
    }
}

impl TryFrom<String> for DevAddr {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DevAddr> for String {
    fn from(v: DevAddr) -> Self {
        v.to_string()
    }
}

/// An accepted JoinEUI range, written `70B3D57ED0000000/36`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JoinEuiPrefix {
    pub eui: Eui64,
    pub length: u8,
}

impl JoinEuiPrefix {
    pub fn new(eui: Eui64, length: u8) -> Self {
        Self { eui, length }
    }

    fn mask(&self) -> u64 {
        match self.length {
            0 => 0,
            l if l >= 64 => u64::MAX,
            l => u64::MAX << (64 - l as u32),
        }
    }

    pub fn matches(&self, eui: Eui64) -> bool {
        let mask = self.mask();
        eui.to_u64() & mask == self.eui.to_u64() & mask
    }
}

impl fmt::Display for JoinEuiPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.eui, self.length)
    }
}

impl FromStr for JoinEuiPrefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (eui, length) = s.split_once('/').ok_or_else(|| {
            Error::InvalidField("join_eui_prefix".to_string(), format!("missing length in `{}`", s))
        })?;
        let length: u8 = length
            .parse()
            .map_err(|e| Error::InvalidField("join_eui_prefix".to_string(), format!("{}", e)))?;
        if length > 64 {
            return Err(Error::InvalidField(
                "join_eui_prefix".to_string(),
                format!("length {} exceeds 64", length),
            ));
        }
        Ok(Self {
            eui: eui.parse()?,
            length,
        })
    }
}

impl TryFrom<String> for JoinEuiPrefix {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<JoinEuiPrefix> for String {
    fn from(v: JoinEuiPrefix) -> Self {
        v.to_string()
    }
}

/// LoRaWAN MAC version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MacVersion {
    V1_0,
    V1_0_1,
    V1_0_2,
    #[default]
    V1_0_3,
    V1_0_4,
    V1_1,
    /// Any version this Join Server does not implement.
    Unknown,
}

impl MacVersion {
    pub fn is_supported(self) -> bool {
        self != MacVersion::Unknown
    }

    /// LoRaWAN 1.1 and later: separate NwkKey, counter-based DevNonce.
    pub fn is_1_1(self) -> bool {
        self == MacVersion::V1_1
    }
}

impl fmt::Display for MacVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MacVersion::V1_0 => "1.0",
            MacVersion::V1_0_1 => "1.0.1",
            MacVersion::V1_0_2 => "1.0.2",
            MacVersion::V1_0_3 => "1.0.3",
            MacVersion::V1_0_4 => "1.0.4",
            MacVersion::V1_1 => "1.1",
            MacVersion::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl From<String> for MacVersion {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(MacVersion::Unknown)
    }
}

impl From<MacVersion> for String {
    fn from(v: MacVersion) -> Self {
        v.to_string()
    }
}

impl FromStr for MacVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches(['v', 'V']) {
            "1.0" | "1.0.0" => Ok(MacVersion::V1_0),
            "1.0.1" => Ok(MacVersion::V1_0_1),
            "1.0.2" => Ok(MacVersion::V1_0_2),
            "1.0.3" => Ok(MacVersion::V1_0_3),
            "1.0.4" => Ok(MacVersion::V1_0_4),
            "1.1" | "1.1.0" => Ok(MacVersion::V1_1),
            other => Err(Error::UnsupportedMacVersion(other.to_string())),
        }
    }
}

/// Join-accept downlink settings byte: OptNeg | RX1DROffset | RX2DataRate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DlSettings(pub u8);

impl DlSettings {
    pub fn new(opt_neg: bool, rx1_dr_offset: u8, rx2_dr: u8) -> Self {
        DlSettings(((opt_neg as u8) << 7) | ((rx1_dr_offset & 0x07) << 4) | (rx2_dr & 0x0F))
    }

    pub fn opt_neg(self) -> bool {
        self.0 & 0x80 != 0
    }

    pub fn rx1_dr_offset(self) -> u8 {
        (self.0 >> 4) & 0x07
    }

    pub fn rx2_dr(self) -> u8 {
        self.0 & 0x0F
    }
}
