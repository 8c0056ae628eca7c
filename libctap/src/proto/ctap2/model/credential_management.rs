use serde_bytes::ByteBuf;
use serde_cbor::Value;
use serde_indexed::SerializeIndexed;
use serde_repr::{Deserialize_repr, Serialize_repr};

use super::{
    Ctap2AuthTokenPermissionRole, Ctap2PinUvAuthProtocol, Ctap2PublicKeyCredentialDescriptor,
    Ctap2PublicKeyCredentialRpEntity, Ctap2PublicKeyCredentialUserEntity,
    Ctap2UserVerifiableRequest,
};
use crate::pin::PinUvAuthProtocol;
use crate::proto::ctap2::cbor::{
    as_bytes, as_uint, as_value, deserialize, serialize, CborMap, CborResponseModel,
};
use crate::transport::error::{Error, ProtocolError};

#[derive(Debug, Clone, SerializeIndexed)]
#[serde_indexed(offset = 1)]
pub struct Ctap2CredentialManagementRequest {
    /// subCommand (0x01)
    pub subcommand: Ctap2CredentialManagementSubcommand,

    /// subCommandParams (0x02)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subcommand_params: Option<Ctap2CredentialManagementParams>,

    /// pinUvAuthProtocol (0x03)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Ctap2PinUvAuthProtocol>,

    /// pinUvAuthParam (0x04)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uv_auth_param: Option<ByteBuf>,

    /// Selects the prototype command code (0x41); never encoded.
    #[serde(skip_serializing_if = "always_skip_bool")]
    pub use_legacy_preview: bool,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
pub enum Ctap2CredentialManagementSubcommand {
    GetCredsMetadata = 0x01,
    EnumerateRPsBegin = 0x02,
    EnumerateRPsGetNextRP = 0x03,
    EnumerateCredentialsBegin = 0x04,
    EnumerateCredentialsGetNextCredential = 0x05,
    DeleteCredential = 0x06,
    UpdateUserInformation = 0x07,
}

impl Ctap2CredentialManagementSubcommand {
    /// The "next" subcommands continue an enumeration and carry no pinUvAuthParam.
    pub fn requires_auth(&self) -> bool {
        !matches!(
            self,
            Self::EnumerateRPsGetNextRP | Self::EnumerateCredentialsGetNextCredential
        )
    }
}

#[derive(Debug, Clone, PartialEq, SerializeIndexed)]
#[serde_indexed(offset = 1)]
pub struct Ctap2CredentialManagementParams {
    /// rpIDHash (0x01)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpid_hash: Option<ByteBuf>,

    /// credentialID (0x02)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<Ctap2PublicKeyCredentialDescriptor>,

    /// user (0x03)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Ctap2PublicKeyCredentialUserEntity>,
}

impl Ctap2CredentialManagementRequest {
    fn new(
        subcommand: Ctap2CredentialManagementSubcommand,
        subcommand_params: Option<Ctap2CredentialManagementParams>,
    ) -> Self {
        Self {
            subcommand,
            subcommand_params,
            protocol: None,
            uv_auth_param: None,
            use_legacy_preview: false,
        }
    }

    pub fn new_get_credential_metadata() -> Self {
        Self::new(Ctap2CredentialManagementSubcommand::GetCredsMetadata, None)
    }

    pub fn new_enumerate_rps_begin() -> Self {
        Self::new(Ctap2CredentialManagementSubcommand::EnumerateRPsBegin, None)
    }

    pub fn new_enumerate_rps_next_rp() -> Self {
        Self::new(Ctap2CredentialManagementSubcommand::EnumerateRPsGetNextRP, None)
    }

    pub fn new_enumerate_credentials_begin(rpid_hash: &[u8]) -> Self {
        Self::new(
            Ctap2CredentialManagementSubcommand::EnumerateCredentialsBegin,
            Some(Ctap2CredentialManagementParams {
                rpid_hash: Some(ByteBuf::from(rpid_hash)),
                credential_id: None,
                user: None,
            }),
        )
    }

    pub fn new_enumerate_credentials_next() -> Self {
        Self::new(
            Ctap2CredentialManagementSubcommand::EnumerateCredentialsGetNextCredential,
            None,
        )
    }

    pub fn new_delete_credential(credential_id: &Ctap2PublicKeyCredentialDescriptor) -> Self {
        Self::new(
            Ctap2CredentialManagementSubcommand::DeleteCredential,
            Some(Ctap2CredentialManagementParams {
                rpid_hash: None,
                credential_id: Some(credential_id.clone()),
                user: None,
            }),
        )
    }

    pub fn new_update_user_information(
        credential_id: &Ctap2PublicKeyCredentialDescriptor,
        user: &Ctap2PublicKeyCredentialUserEntity,
    ) -> Self {
        Self::new(
            Ctap2CredentialManagementSubcommand::UpdateUserInformation,
            Some(Ctap2CredentialManagementParams {
                rpid_hash: None,
                credential_id: Some(credential_id.clone()),
                user: Some(user.clone()),
            }),
        )
    }

    /// subCommand || subCommandParams, the message authenticated with the token.
    pub fn auth_message(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut data = vec![self.subcommand as u8];
        if let Some(params) = &self.subcommand_params {
            data.extend(serde_cbor::to_vec(params)?);
        }
        Ok(data)
    }
}

impl Ctap2UserVerifiableRequest for Ctap2CredentialManagementRequest {
    fn ensure_uv_set(&mut self) {
        // No uv option on this command.
    }

    fn calculate_and_set_uv_auth(
        &mut self,
        uv_proto: &dyn PinUvAuthProtocol,
        uv_auth_token: &[u8],
    ) -> Result<(), Error> {
        let uv_auth_param = uv_proto.authenticate(uv_auth_token, &self.auth_message()?)?;
        self.protocol = Some(uv_proto.version());
        self.uv_auth_param = Some(ByteBuf::from(uv_auth_param));
        Ok(())
    }

    fn permissions(&self) -> Ctap2AuthTokenPermissionRole {
        Ctap2AuthTokenPermissionRole::CREDENTIAL_MANAGEMENT
    }

    fn permissions_rpid(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Ctap2CredentialManagementResponse {
    /// existingResidentCredentialsCount (0x01)
    pub existing_resident_credentials_count: Option<u32>,

    /// maxPossibleRemainingResidentCredentialsCount (0x02)
    pub max_possible_remaining_resident_credentials_count: Option<u32>,

    /// rp (0x03)
    pub rp: Option<Ctap2PublicKeyCredentialRpEntity>,

    /// rpIDHash (0x04)
    pub rp_id_hash: Option<Vec<u8>>,

    /// totalRPs (0x05)
    pub total_rps: Option<u32>,

    /// user (0x06)
    pub user: Option<Ctap2PublicKeyCredentialUserEntity>,

    /// credentialID (0x07)
    pub credential_id: Option<Ctap2PublicKeyCredentialDescriptor>,

    /// publicKey (0x08), COSE_Key
    pub public_key: Option<Value>,

    /// totalCredentials (0x09)
    pub total_credentials: Option<u32>,

    /// credProtect (0x0A)
    pub cred_protect: Option<u8>,

    /// largeBlobKey (0x0B)
    pub large_blob_key: Option<Vec<u8>>,
}

impl CborResponseModel for Ctap2CredentialManagementResponse {
    fn from_cbor(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut map = CborMap::from_slice(data)?;
        Ok(Self {
            existing_resident_credentials_count: map.optional(
                0x01,
                "existingResidentCredentialsCount",
                as_uint,
            )?,
            max_possible_remaining_resident_credentials_count: map.optional(
                0x02,
                "maxPossibleRemainingResidentCredentialsCount",
                as_uint,
            )?,
            rp: map.optional(0x03, "rp", deserialize)?,
            rp_id_hash: map.optional(0x04, "rpIDHash", as_bytes)?,
            total_rps: map.optional(0x05, "totalRPs", as_uint)?,
            user: map.optional(0x06, "user", deserialize)?,
            credential_id: map.optional(0x07, "credentialID", deserialize)?,
            public_key: map.optional(0x08, "publicKey", as_value)?,
            total_credentials: map.optional(0x09, "totalCredentials", as_uint)?,
            cred_protect: map.optional(0x0A, "credProtect", as_uint)?,
            large_blob_key: map.optional(0x0B, "largeBlobKey", as_bytes)?,
        })
    }

    fn to_cbor(&self) -> Result<Vec<u8>, ProtocolError> {
        let uint = |n: u32| Value::Integer(n.into());
        let mut map = CborMap::new();
        map.insert_opt(0x01, self.existing_resident_credentials_count.map(uint));
        map.insert_opt(
            0x02,
            self.max_possible_remaining_resident_credentials_count.map(uint),
        );
        if let Some(rp) = &self.rp {
            map.insert(0x03, serialize(rp)?);
        }
        map.insert_opt(0x04, self.rp_id_hash.clone().map(Value::Bytes));
        map.insert_opt(0x05, self.total_rps.map(uint));
        if let Some(user) = &self.user {
            map.insert(0x06, serialize(user)?);
        }
        if let Some(credential_id) = &self.credential_id {
            map.insert(0x07, serialize(credential_id)?);
        }
        map.insert_opt(0x08, self.public_key.clone());
        map.insert_opt(0x09, self.total_credentials.map(uint));
        map.insert_opt(0x0A, self.cred_protect.map(|n| Value::Integer(n.into())));
        map.insert_opt(0x0B, self.large_blob_key.clone().map(Value::Bytes));
        map.to_vec()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ctap2CredentialManagementMetadata {
    pub existing_resident_credentials_count: u32,
    pub max_possible_remaining_resident_credentials_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ctap2CredentialData {
    pub user: Ctap2PublicKeyCredentialUserEntity,
    pub credential_id: Ctap2PublicKeyCredentialDescriptor,
    pub public_key: Value,
    pub cred_protect: Option<u8>,
    /// This is not there in the Preview mode
    pub large_blob_key: Option<Vec<u8>>,
}

impl TryFrom<Ctap2CredentialManagementResponse> for Ctap2CredentialData {
    type Error = ProtocolError;
    fn try_from(response: Ctap2CredentialManagementResponse) -> Result<Self, ProtocolError> {
        Ok(Self {
            user: response
                .user
                .ok_or_else(|| ProtocolError::MissingField("user".into()))?,
            credential_id: response
                .credential_id
                .ok_or_else(|| ProtocolError::MissingField("credentialID".into()))?,
            public_key: response
                .public_key
                .ok_or_else(|| ProtocolError::MissingField("publicKey".into()))?,
            cred_protect: response.cred_protect,
            large_blob_key: response.large_blob_key,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ctap2RPData {
    pub rp: Ctap2PublicKeyCredentialRpEntity,
    pub rp_id_hash: Vec<u8>,
}

impl TryFrom<Ctap2CredentialManagementResponse> for Ctap2RPData {
    type Error = ProtocolError;
    fn try_from(response: Ctap2CredentialManagementResponse) -> Result<Self, ProtocolError> {
        Ok(Self {
            rp: response
                .rp
                .ok_or_else(|| ProtocolError::MissingField("rp".into()))?,
            rp_id_hash: response
                .rp_id_hash
                .ok_or_else(|| ProtocolError::MissingField("rpIDHash".into()))?,
        })
    }
}

// Required by serde_indexed, as serde(skip) isn't supported yet:
//   https://github.com/trussed-dev/serde-indexed/pull/14
fn always_skip_bool(_v: &bool) -> bool {
    true
}
