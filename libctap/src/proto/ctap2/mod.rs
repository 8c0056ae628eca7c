pub mod cbor;

mod model;
mod protocol;

pub use model::Ctap2GetInfoResponse;
pub use model::{
    AppleAnonymousAttestationStmt, Ctap2AttestationStatement, Ctap2AuthTokenPermissionRole,
    Ctap2COSEAlgorithmIdentifier, Ctap2ClientPinRequest, Ctap2ClientPinResponse,
    Ctap2CommandCode, Ctap2CredentialType, Ctap2MakeCredentialOptions, Ctap2PinUvAuthProtocol,
    Ctap2PinUvAuthProtocolCommand, Ctap2PublicKeyCredentialDescriptor,
    Ctap2PublicKeyCredentialRpEntity, Ctap2PublicKeyCredentialType,
    Ctap2PublicKeyCredentialUserEntity, Ctap2Transport, Ctap2UserVerifiableRequest,
    Ctap2UserVerificationOperation, FidoU2fAttestationStmt, PackedAttestationStmt,
    TpmAttestationStmt,
};
pub use model::{
    Ctap2CredentialData, Ctap2CredentialManagementMetadata, Ctap2CredentialManagementParams,
    Ctap2CredentialManagementRequest, Ctap2CredentialManagementResponse,
    Ctap2CredentialManagementSubcommand, Ctap2RPData,
};
pub use model::{Ctap2GetAssertionOptions, Ctap2GetAssertionRequest, Ctap2GetAssertionResponse};
pub use model::{Ctap2MakeCredentialRequest, Ctap2MakeCredentialResponse};
pub use protocol::{check_status, Ctap2};
