use std::convert::TryFrom;

use serde::Serialize;
use serde_cbor::ser::to_vec;

use crate::proto::ctap2::model::Ctap2ClientPinRequest;
use crate::proto::ctap2::model::Ctap2CommandCode;
use crate::proto::ctap2::model::Ctap2CredentialManagementRequest;
use crate::proto::ctap2::model::Ctap2GetAssertionRequest;
use crate::proto::ctap2::model::Ctap2MakeCredentialRequest;
use crate::transport::error::ProtocolError;

#[derive(Debug, Clone, PartialEq)]
pub struct CborRequest {
    pub command: Ctap2CommandCode,
    pub encoded_data: Vec<u8>,
}

impl CborRequest {
    pub fn new(command: Ctap2CommandCode) -> Self {
        Self {
            command,
            encoded_data: vec![],
        }
    }

    pub fn with_body<T: Serialize>(
        command: Ctap2CommandCode,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            command,
            encoded_data: to_vec(body)?,
        })
    }

    /// Command byte followed by the CBOR body.
    pub fn ctap_data(&self) -> Vec<u8> {
        let mut data = vec![self.command as u8];
        data.extend(&self.encoded_data);
        data
    }

    pub fn len(&self) -> usize {
        1 + self.encoded_data.len()
    }
}

impl TryFrom<&Ctap2MakeCredentialRequest> for CborRequest {
    type Error = ProtocolError;
    fn try_from(request: &Ctap2MakeCredentialRequest) -> Result<CborRequest, ProtocolError> {
        CborRequest::with_body(Ctap2CommandCode::AuthenticatorMakeCredential, request)
    }
}

impl TryFrom<&Ctap2GetAssertionRequest> for CborRequest {
    type Error = ProtocolError;
    fn try_from(request: &Ctap2GetAssertionRequest) -> Result<CborRequest, ProtocolError> {
        CborRequest::with_body(Ctap2CommandCode::AuthenticatorGetAssertion, request)
    }
}

impl TryFrom<&Ctap2ClientPinRequest> for CborRequest {
    type Error = ProtocolError;
    fn try_from(request: &Ctap2ClientPinRequest) -> Result<CborRequest, ProtocolError> {
        CborRequest::with_body(Ctap2CommandCode::AuthenticatorClientPin, request)
    }
}

impl TryFrom<&Ctap2CredentialManagementRequest> for CborRequest {
    type Error = ProtocolError;
    fn try_from(request: &Ctap2CredentialManagementRequest) -> Result<CborRequest, ProtocolError> {
        let command = if request.use_legacy_preview {
            Ctap2CommandCode::AuthenticatorCredentialManagementPreview
        } else {
            Ctap2CommandCode::AuthenticatorCredentialManagement
        };
        CborRequest::with_body(command, request)
    }
}
