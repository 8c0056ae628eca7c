use bitflags::bitflags;
use cosey::PublicKey;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde_bytes::ByteBuf;
use serde_cbor::Value;
use serde_indexed::SerializeIndexed;
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::crypto::EcPublicKey;
use crate::pin::{cose_key_from_ec, ec_from_cose_value};
use crate::proto::ctap2::cbor::{as_bool, as_bytes, as_uint, serialize, CborMap, CborResponseModel};
use crate::transport::error::ProtocolError;

#[derive(Debug, Clone, SerializeIndexed)]
#[serde_indexed(offset = 1)]
pub struct Ctap2ClientPinRequest {
    /// pinUvAuthProtocol (0x01)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Ctap2PinUvAuthProtocol>,

    /// subCommand (0x02)
    pub command: Ctap2PinUvAuthProtocolCommand,

    /// keyAgreement (0x03)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_agreement: Option<PublicKey>,

    /// pinUvAuthParam (0x04)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uv_auth_param: Option<ByteBuf>,

    /// newPinEnc (0x05)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_pin_encrypted: Option<ByteBuf>,

    /// pinHashEnc (0x06)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin_hash_encrypted: Option<ByteBuf>,

    #[serde(skip_serializing_if = "always_skip")]
    pub unused_07: (),

    #[serde(skip_serializing_if = "always_skip")]
    pub unused_08: (),

    /// permissions (0x09)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,

    /// rpId (0x0A)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions_rpid: Option<String>,
}

impl Ctap2ClientPinRequest {
    fn new(
        protocol: Option<Ctap2PinUvAuthProtocol>,
        command: Ctap2PinUvAuthProtocolCommand,
    ) -> Self {
        Self {
            protocol,
            command,
            key_agreement: None,
            uv_auth_param: None,
            new_pin_encrypted: None,
            pin_hash_encrypted: None,
            unused_07: (),
            unused_08: (),
            permissions: None,
            permissions_rpid: None,
        }
    }

    pub fn new_get_key_agreement(protocol: Ctap2PinUvAuthProtocol) -> Self {
        Self::new(Some(protocol), Ctap2PinUvAuthProtocolCommand::GetKeyAgreement)
    }

    pub fn new_get_pin_retries(protocol: Option<Ctap2PinUvAuthProtocol>) -> Self {
        Self::new(protocol, Ctap2PinUvAuthProtocolCommand::GetPinRetries)
    }

    pub fn new_get_uv_retries() -> Self {
        Self::new(None, Ctap2PinUvAuthProtocolCommand::GetUvRetries)
    }

    pub fn new_get_pin_token(
        protocol: Ctap2PinUvAuthProtocol,
        public_key: PublicKey,
        pin_hash_enc: &[u8],
    ) -> Self {
        Self {
            key_agreement: Some(public_key),
            pin_hash_encrypted: Some(ByteBuf::from(pin_hash_enc)),
            ..Self::new(Some(protocol), Ctap2PinUvAuthProtocolCommand::GetPinToken)
        }
    }

    pub fn new_get_pin_token_with_perm(
        protocol: Ctap2PinUvAuthProtocol,
        public_key: PublicKey,
        pin_hash_enc: &[u8],
        permissions: Ctap2AuthTokenPermissionRole,
        permissions_rpid: Option<&str>,
    ) -> Self {
        Self {
            key_agreement: Some(public_key),
            pin_hash_encrypted: Some(ByteBuf::from(pin_hash_enc)),
            permissions: Some(permissions.bits()),
            permissions_rpid: permissions_rpid.map(str::to_owned),
            ..Self::new(
                Some(protocol),
                Ctap2PinUvAuthProtocolCommand::GetPinUvAuthTokenUsingPinWithPermissions,
            )
        }
    }

    pub fn new_get_uv_token_with_perm(
        protocol: Ctap2PinUvAuthProtocol,
        public_key: PublicKey,
        permissions: Ctap2AuthTokenPermissionRole,
        permissions_rpid: Option<&str>,
    ) -> Self {
        Self {
            key_agreement: Some(public_key),
            permissions: Some(permissions.bits()),
            permissions_rpid: permissions_rpid.map(str::to_owned),
            ..Self::new(
                Some(protocol),
                Ctap2PinUvAuthProtocolCommand::GetPinUvAuthTokenUsingUvWithPermissions,
            )
        }
    }

    pub fn new_change_pin(
        protocol: Ctap2PinUvAuthProtocol,
        new_pin_enc: &[u8],
        curr_pin_enc: &[u8],
        public_key: PublicKey,
        uv_auth_param: &[u8],
    ) -> Self {
        Self {
            key_agreement: Some(public_key),
            uv_auth_param: Some(ByteBuf::from(uv_auth_param)),
            new_pin_encrypted: Some(ByteBuf::from(new_pin_enc)),
            pin_hash_encrypted: Some(ByteBuf::from(curr_pin_enc)),
            ..Self::new(Some(protocol), Ctap2PinUvAuthProtocolCommand::ChangePin)
        }
    }

    pub fn new_set_pin(
        protocol: Ctap2PinUvAuthProtocol,
        new_pin_enc: &[u8],
        public_key: PublicKey,
        uv_auth_param: &[u8],
    ) -> Self {
        Self {
            key_agreement: Some(public_key),
            uv_auth_param: Some(ByteBuf::from(uv_auth_param)),
            new_pin_encrypted: Some(ByteBuf::from(new_pin_enc)),
            ..Self::new(Some(protocol), Ctap2PinUvAuthProtocolCommand::SetPin)
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ctap2AuthTokenPermissionRole: u32 {
        const MAKE_CREDENTIAL = 0x01;
        const GET_ASSERTION = 0x02;
        const CREDENTIAL_MANAGEMENT = 0x04;
        const BIO_ENROLLMENT = 0x08;
        const LARGE_BLOB_WRITE = 0x10;
        const AUTHENTICATOR_CONFIGURATION = 0x20;
    }
}

#[repr(u32)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    IntoPrimitive,
    TryFromPrimitive,
    Serialize_repr,
    Deserialize_repr,
)]
pub enum Ctap2PinUvAuthProtocol {
    One = 1,
    Two = 2,
}

#[repr(u32)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    IntoPrimitive,
    TryFromPrimitive,
    Serialize_repr,
    Deserialize_repr,
)]
pub enum Ctap2PinUvAuthProtocolCommand {
    GetPinRetries = 0x01,
    GetKeyAgreement = 0x02,
    SetPin = 0x03,
    ChangePin = 0x04,
    GetPinToken = 0x05,
    GetPinUvAuthTokenUsingUvWithPermissions = 0x06,
    GetUvRetries = 0x07,
    GetPinUvAuthTokenUsingPinWithPermissions = 0x09,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ctap2ClientPinResponse {
    /// keyAgreement (0x01)
    pub key_agreement: Option<EcPublicKey>,

    /// pinUvAuthToken (0x02), encrypted
    pub pin_uv_auth_token: Option<Vec<u8>>,

    /// pinRetries (0x03)
    pub pin_retries: Option<u32>,

    /// powerCycleState (0x04)
    pub power_cycle_state: Option<bool>,

    /// uvRetries (0x05)
    pub uv_retries: Option<u32>,
}

fn as_ec_key(value: Value, _field: &str) -> Result<EcPublicKey, ProtocolError> {
    ec_from_cose_value(&value)
}

impl CborResponseModel for Ctap2ClientPinResponse {
    fn from_cbor(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut map = CborMap::from_slice(data)?;
        Ok(Self {
            key_agreement: map.optional(0x01, "keyAgreement", as_ec_key)?,
            pin_uv_auth_token: map.optional(0x02, "pinUvAuthToken", as_bytes)?,
            pin_retries: map.optional(0x03, "pinRetries", as_uint)?,
            power_cycle_state: map.optional(0x04, "powerCycleState", as_bool)?,
            uv_retries: map.optional(0x05, "uvRetries", as_uint)?,
        })
    }

    fn to_cbor(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut map = CborMap::new();
        if let Some(key) = &self.key_agreement {
            map.insert(0x01, serialize(&cose_key_from_ec(key)?)?);
        }
        map.insert_opt(0x02, self.pin_uv_auth_token.clone().map(Value::Bytes));
        map.insert_opt(0x03, self.pin_retries.map(|n| Value::Integer(n.into())));
        map.insert_opt(0x04, self.power_cycle_state.map(Value::Bool));
        map.insert_opt(0x05, self.uv_retries.map(|n| Value::Integer(n.into())));
        map.to_vec()
    }
}

impl Ctap2ClientPinResponse {
    /// Extracts pinRetries from the body of an error response, if the authenticator sent one.
    pub fn pin_retries_from_error_body(data: Option<&[u8]>) -> Option<u32> {
        let mut map = CborMap::from_slice(data?).ok()?;
        map.optional(0x03, "pinRetries", as_uint).ok().flatten()
    }
}

// Required by serde_indexed, as serde(skip) isn't supported yet:
//   https://github.com/trussed-dev/serde-indexed/pull/14
fn always_skip(_v: &()) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use serde_cbor::Value;
    use std::collections::BTreeMap;

    use super::{
        Ctap2AuthTokenPermissionRole, Ctap2ClientPinRequest, Ctap2ClientPinResponse,
        Ctap2PinUvAuthProtocol,
    };
    use crate::crypto::{CryptoProvider, RustCryptoProvider};
    use crate::pin::cose_key_from_ec;
    use crate::proto::ctap2::cbor::CborResponseModel;

    #[test]
    fn token_request_keys() {
        let crypto = RustCryptoProvider::new();
        let key = crypto.generate_key_pair().unwrap().public_key;
        let request = Ctap2ClientPinRequest::new_get_pin_token_with_perm(
            Ctap2PinUvAuthProtocol::Two,
            cose_key_from_ec(&key).unwrap(),
            &[0u8; 32],
            Ctap2AuthTokenPermissionRole::GET_ASSERTION,
            Some("example.org"),
        );
        let encoded = serde_cbor::to_vec(&request).unwrap();
        let value: BTreeMap<Value, Value> = serde_cbor::from_slice(&encoded).unwrap();
        let keys: Vec<_> = value.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![1, 2, 3, 6, 9, 10]
                .into_iter()
                .map(Value::Integer)
                .collect::<Vec<_>>()
        );
        assert_eq!(value[&Value::Integer(1)], Value::Integer(2));
        assert_eq!(value[&Value::Integer(2)], Value::Integer(9));
        assert_eq!(value[&Value::Integer(9)], Value::Integer(2));
        assert_eq!(
            value[&Value::Integer(10)],
            Value::Text("example.org".into())
        );
    }

    #[test]
    fn response_with_key_agreement_roundtrip() {
        let crypto = RustCryptoProvider::new();
        let response = Ctap2ClientPinResponse {
            key_agreement: Some(crypto.generate_key_pair().unwrap().public_key),
            pin_retries: Some(8),
            ..Default::default()
        };
        let encoded = response.to_cbor().unwrap();
        assert_eq!(Ctap2ClientPinResponse::from_cbor(&encoded).unwrap(), response);
    }

    #[test]
    fn retries_from_error_body() {
        let body = Ctap2ClientPinResponse {
            pin_retries: Some(2),
            ..Default::default()
        }
        .to_cbor()
        .unwrap();
        assert_eq!(
            Ctap2ClientPinResponse::pin_retries_from_error_body(Some(&body)),
            Some(2)
        );
        assert_eq!(Ctap2ClientPinResponse::pin_retries_from_error_body(None), None);
        assert_eq!(
            Ctap2ClientPinResponse::pin_retries_from_error_body(Some(&[0xff])),
            None
        );
    }
}
