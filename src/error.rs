//! Error types for the Join Server core
//!
//! Every failure the core reports is a distinct [`Error`] variant carrying a
//! stable code (e.g. `DEV_NONCE_TOO_SMALL`) and an [`ErrorKind`]. The kind is
//! what transport edges translate into gRPC status codes or Backend-Interfaces
//! result codes; the code is what operators grep for.

use std::fmt;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    FailedPrecondition,
    NotFound,
    AlreadyExists,
    Unauthenticated,
    PermissionDenied,
    /// Optimistic concurrency conflict that survived the internal retry.
    Aborted,
    DeadlineExceeded,
    /// A persisted record is missing data it must have.
    Corruption,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::FailedPrecondition => "failed precondition",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::Aborted => "aborted",
            ErrorKind::DeadlineExceeded => "deadline exceeded",
            ErrorKind::Corruption => "corruption",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    // Invalid argument
    #[error("failed to decode PHY payload: {0}")]
    DecodePayload(String),
    #[error("failed to encode PHY payload: {0}")]
    EncodePayload(String),
    #[error("wrong payload type `{0}`, expected JoinRequest")]
    WrongPayloadType(String),
    #[error("no DevEUI specified")]
    NoDevEui,
    #[error("no JoinEUI specified")]
    NoJoinEui,
    #[error("no join-request payload")]
    NoJoinRequest,
    #[error("no DevAddr specified")]
    NoDevAddr,
    #[error("unknown JoinEUI `{0}`")]
    UnknownJoinEui(String),
    #[error("unknown AppEUI `{0}`")]
    UnknownAppEui(String),
    #[error("join-request for JoinEUI `{0}` must be forwarded")]
    ForwardJoinRequest(String),
    #[error("unsupported MAC version `{0}`")]
    UnsupportedMacVersion(String),
    #[error("unsupported LoRaWAN major version `{0}`")]
    UnsupportedLorawanMajor(u8),
    #[error("DevNonce `{dev_nonce}` is not greater than last DevNonce `{last}`")]
    DevNonceTooSmall { dev_nonce: u32, last: u32 },
    #[error("DevNonce `{0}` has already been used")]
    ReuseDevNonce(u16),
    #[error("DevNonce limit must be at least 1, got `{0}`")]
    DevNonceLimitInvalid(usize),
    #[error("MIC mismatch")]
    MicMismatch,
    #[error("NetID `{request}` does not match device NetID `{device}`")]
    NetIdMismatch { request: String, device: String },
    #[error("device identifiers already in use")]
    DuplicateIdentifiers,
    #[error("field `{0}` cannot be changed after creation")]
    ImmutableField(String),
    #[error("invalid field `{0}`: {1}")]
    InvalidField(String, String),

    // Failed precondition
    #[error("no NwkKey specified")]
    NoNwkKey,
    #[error("no AppKey specified")]
    NoAppKey,
    #[error("no NetID specified")]
    NoNetId,
    #[error("no Application Server ID specified")]
    NoApplicationServerId,
    #[error("JoinNonce would exceed its maximum value")]
    JoinNonceTooHigh,

    // Not found
    #[error("device not found")]
    DeviceNotFound,
    #[error("provisioner `{0}` not found")]
    ProvisionerNotFound(String),
    #[error("application activation settings not found")]
    ApplicationActivationSettingsNotFound,
    #[error("session keys not found")]
    SessionKeysNotFound,

    // Authentication and authorization
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // Concurrency and deadlines
    #[error("concurrent modification of `{0}`")]
    TransactionConflict(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,

    // Corruption
    #[error("no AppSKey in stored session keys")]
    NoAppSKey,
    #[error("no FNwkSIntKey in stored session keys")]
    NoFNwkSIntKey,
    #[error("no SNwkSIntKey in stored session keys")]
    NoSNwkSIntKey,
    #[error("no NwkSEncKey in stored session keys")]
    NoNwkSEncKey,

    // Internal
    #[error("failed to compute MIC: {0}")]
    ComputeMic(String),
    #[error("failed to encrypt join-accept: {0}")]
    EncryptPayload(String),
    #[error("failed to generate session key ID: {0}")]
    GenerateSessionKeyId(String),
    #[error("registry operation failed: {0}")]
    RegistryOperation(String),
    #[error("failed to wrap key: {0}")]
    WrapKey(String),
    #[error("failed to unwrap key: {0}")]
    UnwrapKey(String),
    #[error("crypto service request failed: {0}")]
    CryptoService(String),
    #[error("identity server request failed: {0}")]
    IdentityServer(String),
}

impl Error {
    /// Category of the error.
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            DecodePayload(_)
            | EncodePayload(_)
            | WrongPayloadType(_)
            | NoDevEui
            | NoJoinEui
            | NoJoinRequest
            | NoDevAddr
            | UnknownJoinEui(_)
            | UnknownAppEui(_)
            | ForwardJoinRequest(_)
            | UnsupportedMacVersion(_)
            | UnsupportedLorawanMajor(_)
            | DevNonceTooSmall { .. }
            | ReuseDevNonce(_)
            | DevNonceLimitInvalid(_)
            | MicMismatch
            | NetIdMismatch { .. }
            | ImmutableField(_)
            | InvalidField(..) => ErrorKind::InvalidArgument,
            // Reported as AlreadyExists on create, which is the only place
            // the registries raise it.
            DuplicateIdentifiers => ErrorKind::AlreadyExists,
            NoNwkKey | NoAppKey | NoNetId | NoApplicationServerId | JoinNonceTooHigh => {
                ErrorKind::FailedPrecondition
            }
            DeviceNotFound
            | ProvisionerNotFound(_)
            | ApplicationActivationSettingsNotFound
            | SessionKeysNotFound => ErrorKind::NotFound,
            Unauthenticated(_) => ErrorKind::Unauthenticated,
            PermissionDenied(_) => ErrorKind::PermissionDenied,
            TransactionConflict(_) => ErrorKind::Aborted,
            DeadlineExceeded => ErrorKind::DeadlineExceeded,
            NoAppSKey | NoFNwkSIntKey | NoSNwkSIntKey | NoNwkSEncKey => ErrorKind::Corruption,
            ComputeMic(_)
            | EncryptPayload(_)
            | GenerateSessionKeyId(_)
            | RegistryOperation(_)
            | WrapKey(_)
            | UnwrapKey(_)
            | CryptoService(_)
            | IdentityServer(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        use Error::*;
        match self {
            DecodePayload(_) => "DECODE_PAYLOAD",
            EncodePayload(_) => "ENCODE_PAYLOAD",
            WrongPayloadType(_) => "WRONG_PAYLOAD_TYPE",
            NoDevEui => "NO_DEV_EUI",
            NoJoinEui => "NO_JOIN_EUI",
            NoJoinRequest => "NO_JOIN_REQUEST",
            NoDevAddr => "NO_DEV_ADDR",
            UnknownJoinEui(_) => "UNKNOWN_JOIN_EUI",
            UnknownAppEui(_) => "UNKNOWN_APP_EUI",
            ForwardJoinRequest(_) => "FORWARD_JOIN_REQUEST",
            UnsupportedMacVersion(_) => "UNSUPPORTED_MAC_VERSION",
            UnsupportedLorawanMajor(_) => "UNSUPPORTED_LORAWAN_MAJOR",
            DevNonceTooSmall { .. } => "DEV_NONCE_TOO_SMALL",
            ReuseDevNonce(_) => "REUSE_DEV_NONCE",
            DevNonceLimitInvalid(_) => "DEV_NONCE_LIMIT_INVALID",
            MicMismatch => "MIC_MISMATCH",
            NetIdMismatch { .. } => "NET_ID_MISMATCH",
            DuplicateIdentifiers => "DUPLICATE_IDENTIFIERS",
            ImmutableField(_) => "IMMUTABLE_FIELD",
            InvalidField(..) => "INVALID_FIELD",
            NoNwkKey => "NO_NWK_KEY",
            NoAppKey => "NO_APP_KEY",
            NoNetId => "NO_NET_ID",
            NoApplicationServerId => "NO_APPLICATION_SERVER_ID",
            JoinNonceTooHigh => "JOIN_NONCE_TOO_HIGH",
            DeviceNotFound => "DEVICE_NOT_FOUND",
            ProvisionerNotFound(_) => "PROVISIONER_NOT_FOUND",
            ApplicationActivationSettingsNotFound => "APPLICATION_ACTIVATION_SETTINGS_NOT_FOUND",
            SessionKeysNotFound => "SESSION_KEYS_NOT_FOUND",
            Unauthenticated(_) => "UNAUTHENTICATED",
            PermissionDenied(_) => "PERMISSION_DENIED",
            TransactionConflict(_) => "TRANSACTION_CONFLICT",
            DeadlineExceeded => "DEADLINE_EXCEEDED",
            NoAppSKey => "NO_APP_S_KEY",
            NoFNwkSIntKey => "NO_F_NWK_S_INT_KEY",
            NoSNwkSIntKey => "NO_S_NWK_S_INT_KEY",
            NoNwkSEncKey => "NO_NWK_S_ENC_KEY",
            ComputeMic(_) => "COMPUTE_MIC",
            EncryptPayload(_) => "ENCRYPT_PAYLOAD",
            GenerateSessionKeyId(_) => "GENERATE_SESSION_KEY_ID",
            RegistryOperation(_) => "REGISTRY_OPERATION",
            WrapKey(_) => "WRAP_KEY",
            UnwrapKey(_) => "UNWRAP_KEY",
            CryptoService(_) => "CRYPTO_SERVICE",
            IdentityServer(_) => "IDENTITY_SERVER",
        }
    }
}
