use thiserror::Error;

pub use crate::crypto::CryptoError;
pub use crate::proto::CtapError;

/// Local preconditions that failed before anything was sent to the authenticator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("PIN is shorter than the authenticator minimum")]
    PinTooShort,
    #[error("PIN is longer than 63 bytes")]
    PinTooLong,
    #[error("authenticator does not support PINs")]
    PinNotSupported,
    #[error("authenticator has no PIN set")]
    PinNotSet,
    #[error("authenticator already has a PIN set")]
    PinAlreadySet,
    #[error("user verification required, but the authenticator offers none")]
    NoUvAvailable,
    #[error("authenticator does not support credential management")]
    CredentialManagementUnsupported,
    #[error("extension {0:?} is not registered with the library")]
    UnregisteredExtension(String),
    #[error("extension {0:?} is already registered with different parameter shapes")]
    ExtensionRegistrationConflict(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed")]
    ConnectionFailed,
    #[error("connection lost")]
    ConnectionLost,
    #[error("invalid endpoint")]
    InvalidEndpoint,
    #[error("invalid framing")]
    InvalidFraming,
    #[error("negotiation failed")]
    NegotiationFailed,
    #[error("transport unavailable")]
    TransportUnavailable,
    #[error("timed out")]
    Timeout,
}

/// Malformed or unexpected data on either side of the codec.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("empty response")]
    EmptyResponse,
    #[error("unknown CTAP status 0x{0:02x}")]
    UnknownStatus(u8),
    #[error("invalid CBOR: {0}")]
    InvalidCbor(String),
    #[error("missing field {0}")]
    MissingField(String),
    #[error("unexpected type for field {0}")]
    UnexpectedType(String),
    #[error("value out of range for field {0}")]
    IntegerOverflow(String),
    #[error("invalid authenticator data: {0}")]
    InvalidAuthenticatorData(&'static str),
    #[error("unexpected value for extension {0:?}")]
    UnexpectedExtensionValue(String),
    #[error("invalid key agreement key")]
    InvalidKeyAgreement,
    #[error("invalid PIN/UV auth token")]
    InvalidPinUvAuthToken,
    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UserVerificationError {
    #[error("wrong PIN ({retries_left:?} retries left)")]
    WrongPin { retries_left: Option<u32> },
    #[error("PIN blocked, the authenticator must be reset")]
    PinBlocked,
    #[error("PIN auth blocked, the authenticator must be power cycled")]
    PinAuthBlocked,
    #[error("PIN required, but none was provided")]
    PinRequiredButNotProvided,
    #[error("built-in user verification blocked")]
    UvBlocked,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("request of {size} bytes exceeds the authenticator limit of {max} bytes")]
    RequestTooLarge { size: usize, max: usize },
    #[error("user verification failed: {0}")]
    UserVerification(#[from] UserVerificationError),
    #[error("an excluded credential already exists on the authenticator")]
    CredentialExcluded,
    #[error("required extension {0:?} is not supported by the authenticator")]
    ExtensionUnsupported(String),
    #[error("authenticator error: {0}")]
    Ctap(#[from] CtapError),
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
}

impl From<CryptoError> for Error {
    fn from(error: CryptoError) -> Self {
        Error::Protocol(ProtocolError::Crypto(error))
    }
}

impl From<serde_cbor::Error> for ProtocolError {
    fn from(error: serde_cbor::Error) -> Self {
        ProtocolError::InvalidCbor(error.to_string())
    }
}

impl From<serde_cbor::Error> for Error {
    fn from(error: serde_cbor::Error) -> Self {
        Error::Protocol(error.into())
    }
}
