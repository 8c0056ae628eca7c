use async_trait::async_trait;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::proto::ctap2::cbor::{CborRequest, CborResponse, CborResponseModel};
use crate::proto::ctap2::Ctap2CommandCode;
use crate::transport::error::{CtapError, Error, UserVerificationError};

use super::{
    Ctap2ClientPinRequest, Ctap2ClientPinResponse, Ctap2CredentialManagementRequest,
    Ctap2CredentialManagementResponse, Ctap2GetAssertionRequest, Ctap2GetAssertionResponse,
    Ctap2GetInfoResponse, Ctap2MakeCredentialRequest, Ctap2MakeCredentialResponse,
};

/// The raw CTAP2 command set, on top of a single message exchange.
///
/// Implementors provide the exchange and the authenticator's message size limit;
/// every command is a provided method.
#[async_trait]
pub trait Ctap2: Send {
    /// `maxMsgSize` advertised by the authenticator, if known.
    fn max_msg_size(&self) -> Option<usize>;

    /// Sends one CTAP message (command byte and CBOR body), returning the raw response.
    async fn exchange(&mut self, message: &[u8]) -> Result<Vec<u8>, Error>;

    #[instrument(skip_all, fields(cmd = ?request.command))]
    async fn send_cbor_request(&mut self, request: &CborRequest) -> Result<CborResponse, Error> {
        let size = request.len();
        if let Some(max) = self.max_msg_size() {
            if size > max {
                warn!({ size, max }, "Request exceeds the authenticator message size");
                return Err(Error::RequestTooLarge { size, max });
            }
        }
        let packet = self.exchange(&request.ctap_data()).await?;
        let response = CborResponse::try_from(packet.as_slice())?;
        debug!(status = ?response.status_code, "CTAP2 response");
        Ok(response)
    }

    #[instrument(skip_all)]
    async fn ctap2_get_info(&mut self) -> Result<Ctap2GetInfoResponse, Error> {
        let request = CborRequest::new(Ctap2CommandCode::AuthenticatorGetInfo);
        let response = check_status(self.send_cbor_request(&request).await?)?;
        let info = Ctap2GetInfoResponse::from_cbor(response.body()?)?;
        debug!(?info, "CTAP2 GetInfo response");
        Ok(info)
    }

    #[instrument(skip_all)]
    async fn ctap2_make_credential(
        &mut self,
        request: &Ctap2MakeCredentialRequest,
    ) -> Result<Ctap2MakeCredentialResponse, Error> {
        trace!(?request);
        let cbor_request = CborRequest::try_from(request)?;
        let response = check_status(self.send_cbor_request(&cbor_request).await?)?;
        let ctap_response = Ctap2MakeCredentialResponse::from_cbor(response.body()?)?;
        trace!(?ctap_response, "CTAP2 MakeCredential response");
        Ok(ctap_response)
    }

    #[instrument(skip_all)]
    async fn ctap2_get_assertion(
        &mut self,
        request: &Ctap2GetAssertionRequest,
    ) -> Result<Ctap2GetAssertionResponse, Error> {
        trace!(?request);
        let cbor_request = CborRequest::try_from(request)?;
        let response = check_status(self.send_cbor_request(&cbor_request).await?)?;
        let ctap_response = Ctap2GetAssertionResponse::from_cbor(response.body()?)?;
        trace!(?ctap_response, "CTAP2 GetAssertion response");
        Ok(ctap_response)
    }

    #[instrument(skip_all)]
    async fn ctap2_get_next_assertion(&mut self) -> Result<Ctap2GetAssertionResponse, Error> {
        let cbor_request = CborRequest::new(Ctap2CommandCode::AuthenticatorGetNextAssertion);
        let response = check_status(self.send_cbor_request(&cbor_request).await?)?;
        let ctap_response = Ctap2GetAssertionResponse::from_cbor(response.body()?)?;
        trace!(?ctap_response, "CTAP2 GetNextAssertion response");
        Ok(ctap_response)
    }

    #[instrument(skip_all, fields(command = ?request.command))]
    async fn ctap2_client_pin(
        &mut self,
        request: &Ctap2ClientPinRequest,
    ) -> Result<Ctap2ClientPinResponse, Error> {
        let cbor_request = CborRequest::try_from(request)?;
        let response = check_status(self.send_cbor_request(&cbor_request).await?)?;
        match &response.data {
            Some(data) => Ok(Ctap2ClientPinResponse::from_cbor(data)?),
            None => Ok(Ctap2ClientPinResponse::default()),
        }
    }

    #[instrument(skip_all, fields(subcommand = ?request.subcommand))]
    async fn ctap2_credential_management(
        &mut self,
        request: &Ctap2CredentialManagementRequest,
    ) -> Result<Ctap2CredentialManagementResponse, Error> {
        let cbor_request = CborRequest::try_from(request)?;
        let response = check_status(self.send_cbor_request(&cbor_request).await?)?;
        let ctap_response = match &response.data {
            Some(data) => Ctap2CredentialManagementResponse::from_cbor(data)?,
            None => Ctap2CredentialManagementResponse::default(),
        };
        trace!(?ctap_response, "CTAP2 CredentialManagement response");
        Ok(ctap_response)
    }

    #[instrument(skip_all)]
    async fn ctap2_selection(&mut self) -> Result<(), Error> {
        let cbor_request = CborRequest::new(Ctap2CommandCode::AuthenticatorSelection);
        check_status(self.send_cbor_request(&cbor_request).await?)?;
        info!("Authenticator selected");
        Ok(())
    }
}

/// Maps a non-success status to the matching engine error.
pub fn check_status(response: CborResponse) -> Result<CborResponse, Error> {
    let error = match response.status_code {
        CtapError::Ok => return Ok(response),
        CtapError::CredentialExcluded => Error::CredentialExcluded,
        CtapError::PINInvalid => {
            let retries_left =
                Ctap2ClientPinResponse::pin_retries_from_error_body(response.data.as_deref());
            UserVerificationError::WrongPin { retries_left }.into()
        }
        CtapError::PINBlocked => UserVerificationError::PinBlocked.into(),
        CtapError::PINAuthBlocked => UserVerificationError::PinAuthBlocked.into(),
        CtapError::UvBlocked => UserVerificationError::UvBlocked.into(),
        status => Error::Ctap(status),
    };
    error!(status = ?response.status_code, %error, "Authenticator returned an error");
    Err(error)
}
