use std::collections::BTreeMap;

use serde_bytes::ByteBuf;
use serde_cbor::Value;
use serde_derive::Serialize;
use serde_indexed::SerializeIndexed;

use super::{
    Ctap2AuthTokenPermissionRole, Ctap2PublicKeyCredentialDescriptor,
    Ctap2PublicKeyCredentialUserEntity, Ctap2UserVerifiableRequest,
};
use crate::fido::AuthenticatorData;
use crate::ops::webauthn::GetAssertionRequest;
use crate::pin::PinUvAuthProtocol;
use crate::proto::ctap2::cbor::{
    as_bool, as_bytes, as_map, as_uint, deserialize, serialize, CborMap, CborResponseModel,
};
use crate::transport::error::{Error, ProtocolError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Ctap2GetAssertionOptions {
    #[serde(rename = "up")]
    /// True for all requests; False for pre-flight only.
    pub require_user_presence: bool,

    #[serde(rename = "uv")]
    #[serde(skip_serializing_if = "Self::skip_serializing_uv")]
    pub require_user_verification: bool,
}

impl Ctap2GetAssertionOptions {
    fn skip_serializing_uv(uv: &bool) -> bool {
        !uv
    }
}

// https://www.w3.org/TR/webauthn/#op-get-assertion
#[derive(Debug, Clone, SerializeIndexed)]
#[serde_indexed(offset = 1)]
pub struct Ctap2GetAssertionRequest {
    /// rpId (0x01)
    pub relying_party_id: String,

    /// clientDataHash (0x02)
    pub client_data_hash: ByteBuf,

    /// allowList (0x03)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<Ctap2PublicKeyCredentialDescriptor>,

    /// extensions (0x04)
    #[serde(skip_serializing_if = "Self::skip_serializing_extensions")]
    pub extensions: Option<BTreeMap<Value, Value>>,

    /// options (0x05)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Ctap2GetAssertionOptions>,

    /// pinUvAuthParam (0x06)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin_auth_param: Option<ByteBuf>,

    /// pinUvAuthProtocol (0x07)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin_auth_proto: Option<u32>,
}

impl Ctap2GetAssertionRequest {
    pub fn skip_serializing_extensions(extensions: &Option<BTreeMap<Value, Value>>) -> bool {
        extensions.as_ref().map_or(true, BTreeMap::is_empty)
    }
}

impl From<&GetAssertionRequest> for Ctap2GetAssertionRequest {
    fn from(op: &GetAssertionRequest) -> Self {
        Self {
            relying_party_id: op.relying_party_id.clone(),
            client_data_hash: ByteBuf::from(op.hash.clone()),
            allow: op.allow.clone(),
            extensions: None,
            options: Some(Ctap2GetAssertionOptions {
                require_user_presence: true,
                require_user_verification: false,
            }),
            pin_auth_param: None,
            pin_auth_proto: None,
        }
    }
}

impl Ctap2UserVerifiableRequest for Ctap2GetAssertionRequest {
    fn ensure_uv_set(&mut self) {
        self.options = Some(Ctap2GetAssertionOptions {
            require_user_verification: true,
            ..self.options.unwrap_or_default()
        });
    }

    fn calculate_and_set_uv_auth(
        &mut self,
        uv_proto: &dyn PinUvAuthProtocol,
        uv_auth_token: &[u8],
    ) -> Result<(), Error> {
        let uv_auth_param = uv_proto.authenticate(uv_auth_token, &self.client_data_hash)?;
        self.pin_auth_proto = Some(uv_proto.version().into());
        self.pin_auth_param = Some(ByteBuf::from(uv_auth_param));
        Ok(())
    }

    fn permissions(&self) -> Ctap2AuthTokenPermissionRole {
        Ctap2AuthTokenPermissionRole::GET_ASSERTION
    }

    fn permissions_rpid(&self) -> Option<&str> {
        Some(&self.relying_party_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ctap2GetAssertionResponse {
    /// credential (0x01)
    pub credential_id: Option<Ctap2PublicKeyCredentialDescriptor>,

    /// authData (0x02)
    pub authenticator_data: AuthenticatorData,

    /// signature (0x03)
    pub signature: Vec<u8>,

    /// user (0x04)
    pub user: Option<Ctap2PublicKeyCredentialUserEntity>,

    /// numberOfCredentials (0x05)
    pub credentials_count: Option<u32>,

    /// userSelected (0x06)
    pub user_selected: Option<bool>,

    /// largeBlobKey (0x07)
    pub large_blob_key: Option<Vec<u8>>,

    /// unsignedExtensionOutputs (0x08)
    pub unsigned_extension_outputs: Option<BTreeMap<Value, Value>>,

    pub residual: BTreeMap<Value, Value>,
}

fn as_authenticator_data(value: Value, field: &str) -> Result<AuthenticatorData, ProtocolError> {
    AuthenticatorData::from_slice(&as_bytes(value, field)?)
}

impl CborResponseModel for Ctap2GetAssertionResponse {
    fn from_cbor(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut map = CborMap::from_slice(data)?;
        Ok(Self {
            credential_id: map.optional(0x01, "credential", deserialize)?,
            authenticator_data: map.required(0x02, "authData", as_authenticator_data)?,
            signature: map.required(0x03, "signature", as_bytes)?,
            user: map.optional(0x04, "user", deserialize)?,
            credentials_count: map.optional(0x05, "numberOfCredentials", as_uint)?,
            user_selected: map.optional(0x06, "userSelected", as_bool)?,
            large_blob_key: map.optional(0x07, "largeBlobKey", as_bytes)?,
            unsigned_extension_outputs: map.optional(0x08, "unsignedExtensionOutputs", as_map)?,
            residual: map.into_residual(),
        })
    }

    fn to_cbor(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut map = CborMap::new();
        if let Some(credential) = &self.credential_id {
            map.insert(0x01, serialize(credential)?);
        }
        map.insert(0x02, Value::Bytes(self.authenticator_data.to_bytes()?));
        map.insert(0x03, Value::Bytes(self.signature.clone()));
        if let Some(user) = &self.user {
            map.insert(0x04, serialize(user)?);
        }
        map.insert_opt(0x05, self.credentials_count.map(|n| Value::Integer(n.into())));
        map.insert_opt(0x06, self.user_selected.map(Value::Bool));
        map.insert_opt(0x07, self.large_blob_key.clone().map(Value::Bytes));
        map.insert_opt(0x08, self.unsigned_extension_outputs.clone().map(Value::Map));
        map.extend(&self.residual);
        map.to_vec()
    }
}
