use std::hash::{Hash, Hasher};

use serde_bytes::ByteBuf;
use serde_derive::{Deserialize, Serialize};

use crate::pin::PinUvAuthProtocol;
use crate::transport::error::Error;

mod client_pin;
mod credential_management;
mod get_assertion;
mod get_info;
mod make_credential;

pub use client_pin::{
    Ctap2AuthTokenPermissionRole, Ctap2ClientPinRequest, Ctap2ClientPinResponse,
    Ctap2PinUvAuthProtocol, Ctap2PinUvAuthProtocolCommand,
};
pub use credential_management::{
    Ctap2CredentialData, Ctap2CredentialManagementMetadata, Ctap2CredentialManagementParams,
    Ctap2CredentialManagementRequest, Ctap2CredentialManagementResponse,
    Ctap2CredentialManagementSubcommand, Ctap2RPData,
};
pub use get_assertion::{
    Ctap2GetAssertionOptions, Ctap2GetAssertionRequest, Ctap2GetAssertionResponse,
};
pub use get_info::Ctap2GetInfoResponse;
pub use make_credential::{
    AppleAnonymousAttestationStmt, Ctap2AttestationStatement, Ctap2MakeCredentialOptions,
    Ctap2MakeCredentialRequest, Ctap2MakeCredentialResponse, FidoU2fAttestationStmt,
    PackedAttestationStmt, TpmAttestationStmt,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Ctap2CommandCode {
    AuthenticatorMakeCredential = 0x01,
    AuthenticatorGetAssertion = 0x02,
    AuthenticatorGetInfo = 0x04,
    AuthenticatorClientPin = 0x06,
    AuthenticatorGetNextAssertion = 0x08,
    AuthenticatorCredentialManagement = 0x0A,
    AuthenticatorSelection = 0x0B,
    AuthenticatorCredentialManagementPreview = 0x41,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ctap2PublicKeyCredentialRpEntity {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Ctap2PublicKeyCredentialRpEntity {
    #[cfg(test)]
    pub fn dummy() -> Self {
        Self::new(".dummy", ".dummy")
    }

    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: String::from(id),
            name: Some(String::from(name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ctap2PublicKeyCredentialUserEntity {
    pub id: ByteBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "displayName")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Ctap2PublicKeyCredentialUserEntity {
    #[cfg(test)]
    pub fn dummy() -> Self {
        Self {
            id: ByteBuf::from([1]),
            name: Some(String::from("dummy")),
            display_name: None,
        }
    }

    pub fn new(id: &[u8], name: &str, display_name: &str) -> Self {
        Self {
            id: ByteBuf::from(id),
            name: Some(String::from(name)),
            display_name: Some(String::from(display_name)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ctap2PublicKeyCredentialType {
    #[serde(rename = "public-key")]
    PublicKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ctap2Transport {
    BLE,
    NFC,
    USB,
    INTERNAL,
    HYBRID,
    #[serde(other)]
    Unknown,
}

/// Credential identifiers compare by their raw bytes only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ctap2PublicKeyCredentialDescriptor {
    pub r#type: Ctap2PublicKeyCredentialType,
    pub id: ByteBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transports: Option<Vec<Ctap2Transport>>,
}

impl Ctap2PublicKeyCredentialDescriptor {
    pub fn new(id: &[u8]) -> Self {
        Self {
            r#type: Ctap2PublicKeyCredentialType::PublicKey,
            id: ByteBuf::from(id),
            transports: None,
        }
    }
}

impl PartialEq for Ctap2PublicKeyCredentialDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Ctap2PublicKeyCredentialDescriptor {}

impl Hash for Ctap2PublicKeyCredentialDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// COSE algorithm identifier. Identifiers without a named variant are kept as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum Ctap2COSEAlgorithmIdentifier {
    ES256,
    EDDSA,
    ES384,
    RS256,
    Other(i32),
}

impl From<i32> for Ctap2COSEAlgorithmIdentifier {
    fn from(value: i32) -> Self {
        match value {
            -7 => Self::ES256,
            -8 => Self::EDDSA,
            -35 => Self::ES384,
            -257 => Self::RS256,
            other => Self::Other(other),
        }
    }
}

impl From<Ctap2COSEAlgorithmIdentifier> for i32 {
    fn from(algorithm: Ctap2COSEAlgorithmIdentifier) -> Self {
        match algorithm {
            Ctap2COSEAlgorithmIdentifier::ES256 => -7,
            Ctap2COSEAlgorithmIdentifier::EDDSA => -8,
            Ctap2COSEAlgorithmIdentifier::ES384 => -35,
            Ctap2COSEAlgorithmIdentifier::RS256 => -257,
            Ctap2COSEAlgorithmIdentifier::Other(value) => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ctap2CredentialType {
    #[serde(rename = "type")]
    pub public_key_type: Ctap2PublicKeyCredentialType,

    #[serde(rename = "alg")]
    pub algorithm: Ctap2COSEAlgorithmIdentifier,
}

impl Default for Ctap2CredentialType {
    fn default() -> Self {
        Self {
            public_key_type: Ctap2PublicKeyCredentialType::PublicKey,
            algorithm: Ctap2COSEAlgorithmIdentifier::ES256,
        }
    }
}

impl Ctap2CredentialType {
    pub fn new(
        public_key_type: Ctap2PublicKeyCredentialType,
        algorithm: Ctap2COSEAlgorithmIdentifier,
    ) -> Self {
        Self {
            public_key_type,
            algorithm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ctap2UserVerificationOperation {
    GetPinUvAuthTokenUsingUvWithPermissions,
    GetPinUvAuthTokenUsingPinWithPermissions,
    GetPinToken,
    /// FIDO 2.0 authenticators with built-in UV but no token support: set the `uv` option.
    DeprecatedUvOption,
}

pub trait Ctap2UserVerifiableRequest {
    fn ensure_uv_set(&mut self);
    fn calculate_and_set_uv_auth(
        &mut self,
        uv_proto: &dyn PinUvAuthProtocol,
        uv_auth_token: &[u8],
    ) -> Result<(), Error>;
    fn permissions(&self) -> Ctap2AuthTokenPermissionRole;
    fn permissions_rpid(&self) -> Option<&str>;
}
