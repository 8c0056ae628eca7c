use std::collections::BTreeMap;

use serde_bytes::ByteBuf;
use serde_cbor::Value;
use serde_derive::{Deserialize, Serialize};
use serde_indexed::SerializeIndexed;
use tracing::error;

use super::{
    Ctap2AuthTokenPermissionRole, Ctap2COSEAlgorithmIdentifier, Ctap2CredentialType,
    Ctap2PublicKeyCredentialDescriptor, Ctap2PublicKeyCredentialRpEntity,
    Ctap2PublicKeyCredentialUserEntity, Ctap2UserVerifiableRequest,
};
use crate::fido::AuthenticatorData;
use crate::ops::webauthn::MakeCredentialRequest;
use crate::pin::PinUvAuthProtocol;
use crate::proto::ctap2::cbor::{
    as_bool, as_bytes, as_map, as_text, as_value, deserialize, serialize, CborMap,
    CborResponseModel,
};
use crate::transport::error::{Error, ProtocolError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Ctap2MakeCredentialOptions {
    #[serde(rename = "rk")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_resident_key: Option<bool>,

    #[serde(rename = "uv")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecated_require_user_verification: Option<bool>,
}

impl Ctap2MakeCredentialOptions {
    pub fn skip_serializing(&self) -> bool {
        self.require_resident_key.is_none() && self.deprecated_require_user_verification.is_none()
    }
}

// https://www.w3.org/TR/webauthn/#authenticatormakecredential
#[derive(Debug, Clone, SerializeIndexed)]
#[serde_indexed(offset = 1)]
pub struct Ctap2MakeCredentialRequest {
    /// clientDataHash (0x01)
    pub hash: ByteBuf,

    /// rp (0x02)
    pub relying_party: Ctap2PublicKeyCredentialRpEntity,

    /// user (0x03)
    pub user: Ctap2PublicKeyCredentialUserEntity,

    /// pubKeyCredParams (0x04)
    pub algorithms: Vec<Ctap2CredentialType>,

    /// excludeList (0x05)
    #[serde(skip_serializing_if = "Self::skip_serializing_exclude")]
    pub exclude: Option<Vec<Ctap2PublicKeyCredentialDescriptor>>,

    /// extensions (0x06), text keyed; `Value` ordering gives the canonical encoding.
    #[serde(skip_serializing_if = "Self::skip_serializing_extensions")]
    pub extensions: Option<BTreeMap<Value, Value>>,

    /// options (0x07)
    #[serde(skip_serializing_if = "Self::skip_serializing_options")]
    pub options: Option<Ctap2MakeCredentialOptions>,

    /// pinUvAuthParam (0x08)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin_auth_param: Option<ByteBuf>,

    /// pinUvAuthProtocol (0x09)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin_auth_proto: Option<u32>,

    /// enterpriseAttestation (0x0A)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enterprise_attestation: Option<u32>,
}

impl Ctap2MakeCredentialRequest {
    pub fn skip_serializing_options(options: &Option<Ctap2MakeCredentialOptions>) -> bool {
        options.map_or(true, |options| options.skip_serializing())
    }

    pub fn skip_serializing_exclude(
        exclude: &Option<Vec<Ctap2PublicKeyCredentialDescriptor>>,
    ) -> bool {
        exclude.as_ref().map_or(true, Vec::is_empty)
    }

    pub fn skip_serializing_extensions(extensions: &Option<BTreeMap<Value, Value>>) -> bool {
        extensions.as_ref().map_or(true, BTreeMap::is_empty)
    }
}

impl From<&MakeCredentialRequest> for Ctap2MakeCredentialRequest {
    fn from(op: &MakeCredentialRequest) -> Ctap2MakeCredentialRequest {
        Ctap2MakeCredentialRequest {
            hash: ByteBuf::from(op.hash.clone()),
            relying_party: op.relying_party.clone(),
            user: op.user.clone(),
            algorithms: op.algorithms.clone(),
            exclude: op.exclude.clone(),
            extensions: None,
            options: Some(Ctap2MakeCredentialOptions {
                require_resident_key: if op.require_resident_key {
                    Some(true)
                } else {
                    None
                },
                deprecated_require_user_verification: None,
            }),
            pin_auth_param: None,
            pin_auth_proto: None,
            enterprise_attestation: None,
        }
    }
}

impl Ctap2UserVerifiableRequest for Ctap2MakeCredentialRequest {
    fn ensure_uv_set(&mut self) {
        self.options = Some(Ctap2MakeCredentialOptions {
            deprecated_require_user_verification: Some(true),
            ..self.options.unwrap_or_default()
        });
    }

    fn calculate_and_set_uv_auth(
        &mut self,
        uv_proto: &dyn PinUvAuthProtocol,
        uv_auth_token: &[u8],
    ) -> Result<(), Error> {
        let uv_auth_param = uv_proto.authenticate(uv_auth_token, &self.hash)?;
        self.pin_auth_proto = Some(uv_proto.version().into());
        self.pin_auth_param = Some(ByteBuf::from(uv_auth_param));
        Ok(())
    }

    fn permissions(&self) -> Ctap2AuthTokenPermissionRole {
        // GET_ASSERTION needed for pre-flight requests
        Ctap2AuthTokenPermissionRole::MAKE_CREDENTIAL | Ctap2AuthTokenPermissionRole::GET_ASSERTION
    }

    fn permissions_rpid(&self) -> Option<&str> {
        Some(&self.relying_party.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedAttestationStmt {
    #[serde(rename = "alg")]
    pub algorithm: Ctap2COSEAlgorithmIdentifier,

    #[serde(rename = "sig")]
    pub signature: ByteBuf,

    /// Absent for self attestation.
    #[serde(rename = "x5c", default, skip_serializing_if = "Vec::is_empty")]
    pub certificates: Vec<ByteBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FidoU2fAttestationStmt {
    #[serde(rename = "sig")]
    pub signature: ByteBuf,

    #[serde(rename = "x5c")]
    pub certificates: Vec<ByteBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpmAttestationStmt {
    #[serde(rename = "ver")]
    pub version: String,

    #[serde(rename = "alg")]
    pub algorithm: Ctap2COSEAlgorithmIdentifier,

    #[serde(rename = "sig")]
    pub signature: ByteBuf,

    #[serde(rename = "x5c")]
    pub certificates: Vec<ByteBuf>,

    #[serde(rename = "certInfo")]
    pub certificate_info: ByteBuf,

    #[serde(rename = "pubArea")]
    pub public_area: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppleAnonymousAttestationStmt {
    #[serde(rename = "x5c")]
    pub certificates: Vec<ByteBuf>,
}

/// attStmt, interpreted according to fmt.
#[derive(Debug, Clone, PartialEq)]
pub enum Ctap2AttestationStatement {
    PackedOrAndroid(PackedAttestationStmt),
    Tpm(TpmAttestationStmt),
    FidoU2F(FidoU2fAttestationStmt),
    AppleAnonymous(AppleAnonymousAttestationStmt),
    None,
    Other(BTreeMap<Value, Value>),
}

impl Ctap2AttestationStatement {
    pub fn decode(format: &str, value: Value) -> Result<Self, ProtocolError> {
        const FIELD: &str = "attStmt";
        Ok(match format {
            "packed" | "android-key" => Self::PackedOrAndroid(deserialize(value, FIELD)?),
            "tpm" => Self::Tpm(deserialize(value, FIELD)?),
            "fido-u2f" => Self::FidoU2F(deserialize(value, FIELD)?),
            "apple" => Self::AppleAnonymous(deserialize(value, FIELD)?),
            "none" => {
                if !as_map(value, FIELD)?.is_empty() {
                    error!("Non-empty attestation statement for format 'none'");
                    return Err(ProtocolError::UnexpectedType(FIELD.to_owned()));
                }
                Self::None
            }
            _ => Self::Other(as_map(value, FIELD)?),
        })
    }

    pub fn encode(&self) -> Result<Value, ProtocolError> {
        match self {
            Self::PackedOrAndroid(stmt) => serialize(stmt),
            Self::Tpm(stmt) => serialize(stmt),
            Self::FidoU2F(stmt) => serialize(stmt),
            Self::AppleAnonymous(stmt) => serialize(stmt),
            Self::None => Ok(Value::Map(BTreeMap::new())),
            Self::Other(map) => Ok(Value::Map(map.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ctap2MakeCredentialResponse {
    /// fmt (0x01)
    pub format: String,

    /// authData (0x02)
    pub authenticator_data: AuthenticatorData,

    /// attStmt (0x03)
    pub attestation_statement: Ctap2AttestationStatement,

    /// epAtt (0x04)
    pub enterprise_attestation: Option<bool>,

    /// largeBlobKey (0x05)
    pub large_blob_key: Option<Vec<u8>>,

    /// unsignedExtensionOutputs (0x06)
    pub unsigned_extension_outputs: Option<BTreeMap<Value, Value>>,

    pub residual: BTreeMap<Value, Value>,
}

impl Ctap2MakeCredentialResponse {
    pub fn credential_descriptor(&self) -> Option<Ctap2PublicKeyCredentialDescriptor> {
        self.authenticator_data
            .credential_id()
            .map(Ctap2PublicKeyCredentialDescriptor::new)
    }
}

impl CborResponseModel for Ctap2MakeCredentialResponse {
    fn from_cbor(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut map = CborMap::from_slice(data)?;
        let format = map.required(0x01, "fmt", as_text)?;
        let authenticator_data = map.required(0x02, "authData", as_bytes)?;
        let attestation_statement = map.required(0x03, "attStmt", as_value)?;
        Ok(Self {
            authenticator_data: AuthenticatorData::from_slice(&authenticator_data)?,
            attestation_statement: Ctap2AttestationStatement::decode(
                &format,
                attestation_statement,
            )?,
            format,
            enterprise_attestation: map.optional(0x04, "epAtt", as_bool)?,
            large_blob_key: map.optional(0x05, "largeBlobKey", as_bytes)?,
            unsigned_extension_outputs: map.optional(0x06, "unsignedExtensionOutputs", as_map)?,
            residual: map.into_residual(),
        })
    }

    fn to_cbor(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut map = CborMap::new();
        map.insert(0x01, Value::Text(self.format.clone()));
        map.insert(0x02, Value::Bytes(self.authenticator_data.to_bytes()?));
        map.insert(0x03, self.attestation_statement.encode()?);
        map.insert_opt(0x04, self.enterprise_attestation.map(Value::Bool));
        map.insert_opt(0x05, self.large_blob_key.clone().map(Value::Bytes));
        map.insert_opt(0x06, self.unsigned_extension_outputs.clone().map(Value::Map));
        map.extend(&self.residual);
        map.to_vec()
    }
}
