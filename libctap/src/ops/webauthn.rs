use rand::{thread_rng, RngCore};
use tracing::debug;

use crate::proto::ctap2::{
    Ctap2CredentialType, Ctap2GetAssertionResponse, Ctap2MakeCredentialResponse,
    Ctap2PublicKeyCredentialDescriptor, Ctap2PublicKeyCredentialRpEntity,
    Ctap2PublicKeyCredentialUserEntity,
};

const CLIENT_DATA_HASH_LEN: usize = 32;
const USER_ID_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserVerificationRequirement {
    Required,
    Preferred,
    Discouraged,
}

impl UserVerificationRequirement {
    /// Check if user verification is preferred or required for this request
    pub fn is_preferred(&self) -> bool {
        match self {
            Self::Required | Self::Preferred => true,
            Self::Discouraged => false,
        }
    }

    /// Check if user verification is strictly required for this request
    pub fn is_required(&self) -> bool {
        matches!(self, Self::Required)
    }
}

#[derive(Debug, Clone)]
pub struct MakeCredentialRequest {
    /// clientDataHash
    pub hash: Vec<u8>,
    /// rpEntity
    pub relying_party: Ctap2PublicKeyCredentialRpEntity,
    /// userEntity
    pub user: Ctap2PublicKeyCredentialUserEntity,
    pub require_resident_key: bool,
    pub user_verification: UserVerificationRequirement,
    /// credTypesAndPubKeyAlgs
    pub algorithms: Vec<Ctap2CredentialType>,
    /// excludeCredentialDescriptorList
    pub exclude: Option<Vec<Ctap2PublicKeyCredentialDescriptor>>,
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    thread_rng().fill_bytes(&mut bytes);
    bytes
}

impl MakeCredentialRequest {
    /// A request with a random client data hash and user id, ES256 only.
    pub fn new(rp_id: &str, user_display_name: &str) -> Self {
        let request = Self {
            hash: random_bytes(CLIENT_DATA_HASH_LEN),
            relying_party: Ctap2PublicKeyCredentialRpEntity {
                id: rp_id.to_owned(),
                name: None,
            },
            user: Ctap2PublicKeyCredentialUserEntity::new(
                &random_bytes(USER_ID_LEN),
                user_display_name,
                user_display_name,
            ),
            require_resident_key: false,
            user_verification: UserVerificationRequirement::Preferred,
            algorithms: vec![Ctap2CredentialType::default()],
            exclude: None,
        };
        debug!(rp_id, "New MakeCredential request");
        request
    }

    #[cfg(test)]
    pub fn dummy() -> Self {
        Self {
            hash: vec![0; 32],
            relying_party: Ctap2PublicKeyCredentialRpEntity::dummy(),
            user: Ctap2PublicKeyCredentialUserEntity::dummy(),
            algorithms: vec![Ctap2CredentialType::default()],
            exclude: None,
            require_resident_key: false,
            user_verification: UserVerificationRequirement::Preferred,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MakeCredentialResponse {
    pub response: Ctap2MakeCredentialResponse,
    /// Extensions the authenticator does not support, dropped before sending.
    pub dropped_extensions: Vec<String>,
}

impl MakeCredentialResponse {
    pub fn credential_descriptor(&self) -> Option<Ctap2PublicKeyCredentialDescriptor> {
        self.response.credential_descriptor()
    }
}

#[derive(Debug, Clone)]
pub struct GetAssertionRequest {
    pub relying_party_id: String,
    /// clientDataHash
    pub hash: Vec<u8>,
    pub allow: Vec<Ctap2PublicKeyCredentialDescriptor>,
    pub user_verification: UserVerificationRequirement,
}

impl GetAssertionRequest {
    pub fn new(rp_id: &str, client_data_hash: &[u8]) -> Self {
        Self {
            relying_party_id: rp_id.to_owned(),
            hash: client_data_hash.to_vec(),
            allow: vec![],
            user_verification: UserVerificationRequirement::Preferred,
        }
    }

    pub fn allow(mut self, credentials: &[Ctap2PublicKeyCredentialDescriptor]) -> Self {
        self.allow.extend_from_slice(credentials);
        self
    }
}

#[derive(Debug, Clone)]
pub struct GetAssertionResponse {
    /// In the order the authenticator returned them.
    pub assertions: Vec<Ctap2GetAssertionResponse>,
    pub dropped_extensions: Vec<String>,
}
