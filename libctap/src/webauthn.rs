use std::sync::Arc;

use tracing::{debug, error, info, instrument, trace, warn};

use crate::client::Ctap2Client;
use crate::crypto::CryptoProvider;
use crate::extensions::{ExtensionContext, ExtensionSet};
use crate::ops::webauthn::{
    GetAssertionRequest, GetAssertionResponse, MakeCredentialRequest, MakeCredentialResponse,
    UserVerificationRequirement,
};
use crate::pin::{pin_hash, KeyAgreementPlatformKey, PinRequestContext, PinUvAuthProtocol};
use crate::proto::ctap2::{
    Ctap2, Ctap2ClientPinRequest, Ctap2GetAssertionRequest, Ctap2GetInfoResponse,
    Ctap2MakeCredentialRequest, Ctap2UserVerifiableRequest, Ctap2UserVerificationOperation,
};
use crate::transport::error::{Error, PlatformError, ProtocolError, UserVerificationError};

/// Key material for one operation. Dropped, with the shared secret, when the
/// operation returns.
pub(crate) struct UvSession {
    pub protocol: Box<dyn PinUvAuthProtocol>,
    pub key_agreement: Option<KeyAgreementPlatformKey>,
}

impl UvSession {
    pub fn context(&self) -> ExtensionContext<'_> {
        ExtensionContext {
            key_agreement: self.key_agreement.as_ref(),
            protocol: Some(self.protocol.as_ref()),
        }
    }
}

pub(crate) fn select_uv_proto(
    crypto: Arc<dyn CryptoProvider>,
    info: &Ctap2GetInfoResponse,
) -> Box<dyn PinUvAuthProtocol> {
    let version = info.preferred_pin_uv_auth_protocol();
    debug!(?version, "Selected PIN/UV auth protocol");
    version.create_protocol_object(crypto)
}

/// getKeyAgreement, then the platform half of the ECDH exchange.
#[instrument(skip_all)]
pub(crate) async fn obtain_shared_secret(
    client: &mut Ctap2Client<'_>,
    uv_proto: &dyn PinUvAuthProtocol,
) -> Result<KeyAgreementPlatformKey, Error> {
    let request = Ctap2ClientPinRequest::new_get_key_agreement(uv_proto.version());
    let response = client.ctap2_client_pin(&request).await?;
    let Some(peer) = response.key_agreement else {
        error!("getKeyAgreement response has no keyAgreement");
        return Err(ProtocolError::MissingField("keyAgreement".into()).into());
    };
    Ok(uv_proto.encapsulate(&peer)?)
}

/// Checks the retry counter, then asks the PIN provider.
#[instrument(skip_all)]
pub(crate) async fn obtain_pin(
    client: &mut Ctap2Client<'_>,
    uv_proto: &dyn PinUvAuthProtocol,
    rp_id: Option<&str>,
) -> Result<String, Error> {
    let request = Ctap2ClientPinRequest::new_get_pin_retries(Some(uv_proto.version()));
    let retries_left = client.ctap2_client_pin(&request).await?.pin_retries;
    if retries_left == Some(0) {
        warn!("No PIN attempts left");
        return Err(UserVerificationError::PinBlocked.into());
    }

    let context = PinRequestContext {
        retries_left,
        rp_id: rp_id.map(str::to_owned),
        device: client.to_string(),
    };
    let pin_provider = client.pin_provider();
    let Some(pin) = pin_provider.provide_pin(&context).await else {
        info!("PIN provider declined to provide a PIN");
        return Err(UserVerificationError::PinRequiredButNotProvided.into());
    };
    Ok(pin)
}

/// Whether this operation should verify the user, given the request policy and
/// what the authenticator insists on.
pub(crate) fn uv_wanted(
    requirement: UserVerificationRequirement,
    info: &Ctap2GetInfoResponse,
    make_credential: bool,
) -> bool {
    match requirement {
        UserVerificationRequirement::Required => true,
        UserVerificationRequirement::Preferred => info.is_uv_protected(),
        UserVerificationRequirement::Discouraged => {
            info.option_enabled("alwaysUv")
                || (make_credential
                    && info.option_enabled("clientPin")
                    && !info.option_enabled("makeCredUvNotRqd"))
        }
    }
}

/// Obtains a pinUvAuthToken for the request's permissions, and authenticates
/// the request with it.
#[instrument(skip_all, fields(dev = %client, uv))]
pub(crate) async fn user_verification<R>(
    client: &mut Ctap2Client<'_>,
    requirement: UserVerificationRequirement,
    uv: bool,
    request: &mut R,
) -> Result<UvSession, Error>
where
    R: Ctap2UserVerifiableRequest + Send,
{
    let info = client.info().await?;
    let mut session = UvSession {
        protocol: select_uv_proto(client.crypto(), &info),
        key_agreement: None,
    };
    if !uv {
        debug!("User verification not requested");
        return Ok(session);
    }

    let rp_id = request.permissions_rpid().map(str::to_owned);
    let permissions = request.permissions();
    let mut uv_blocked = false;
    let (response, key_agreement) = loop {
        let Some(operation) = info.uv_operation(uv_blocked) else {
            if requirement.is_required() {
                error!("User verification required, but the authenticator offers none");
                return Err(PlatformError::NoUvAvailable.into());
            }
            debug!("No user verification available, proceeding without");
            return Ok(session);
        };

        let uv_proto = session.protocol.as_ref();
        match operation {
            Ctap2UserVerificationOperation::DeprecatedUvOption => {
                request.ensure_uv_set();
                return Ok(session);
            }
            Ctap2UserVerificationOperation::GetPinUvAuthTokenUsingUvWithPermissions => {
                let key_agreement = obtain_shared_secret(client, uv_proto).await?;
                let token_request = Ctap2ClientPinRequest::new_get_uv_token_with_perm(
                    uv_proto.version(),
                    key_agreement.cose_key()?,
                    permissions,
                    rp_id.as_deref(),
                );
                match client.ctap2_client_pin(&token_request).await {
                    Ok(response) => break (response, key_agreement),
                    Err(Error::UserVerification(UserVerificationError::UvBlocked)) => {
                        warn!("Built-in user verification blocked, falling back to PIN");
                        uv_blocked = true;
                    }
                    Err(err) => return Err(err),
                }
            }
            Ctap2UserVerificationOperation::GetPinUvAuthTokenUsingPinWithPermissions
            | Ctap2UserVerificationOperation::GetPinToken => {
                let pin = obtain_pin(client, uv_proto, rp_id.as_deref()).await?;
                let key_agreement = obtain_shared_secret(client, uv_proto).await?;
                let pin_hash_enc = uv_proto.encrypt(
                    &key_agreement.shared_secret,
                    &pin_hash(uv_proto.crypto(), &pin),
                )?;
                let token_request = if operation
                    == Ctap2UserVerificationOperation::GetPinToken
                {
                    Ctap2ClientPinRequest::new_get_pin_token(
                        uv_proto.version(),
                        key_agreement.cose_key()?,
                        &pin_hash_enc,
                    )
                } else {
                    Ctap2ClientPinRequest::new_get_pin_token_with_perm(
                        uv_proto.version(),
                        key_agreement.cose_key()?,
                        &pin_hash_enc,
                        permissions,
                        rp_id.as_deref(),
                    )
                };
                break (client.ctap2_client_pin(&token_request).await?, key_agreement);
            }
        }
    };

    let Some(encrypted_token) = response.pin_uv_auth_token else {
        error!("Token response has no pinUvAuthToken");
        return Err(ProtocolError::MissingField("pinUvAuthToken".into()).into());
    };
    let token = session
        .protocol
        .decrypt(&key_agreement.shared_secret, &encrypted_token)
        .map_err(|err| {
            error!(%err, "Failed to decrypt pinUvAuthToken");
            ProtocolError::InvalidPinUvAuthToken
        })?;
    request.calculate_and_set_uv_auth(session.protocol.as_ref(), &token)?;
    session.key_agreement = Some(key_agreement);
    debug!("Request authenticated with pinUvAuthToken");
    Ok(session)
}

impl<'l> Ctap2Client<'l> {
    /// Runs a bare key agreement when a negotiated extension needs one and user
    /// verification did not produce it.
    async fn ensure_key_agreement(
        &mut self,
        session: &mut UvSession,
        needed: bool,
    ) -> Result<(), Error> {
        if needed && session.key_agreement.is_none() {
            debug!("Extensions need a key agreement");
            session.key_agreement =
                Some(obtain_shared_secret(self, session.protocol.as_ref()).await?);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(dev = %self))]
    pub async fn make_credential(
        &mut self,
        op: &MakeCredentialRequest,
        extensions: &mut ExtensionSet<'_>,
    ) -> Result<MakeCredentialResponse, Error> {
        trace!(?op, "WebAuthn MakeCredential request");
        let registry = self.extension_registry();
        let info = self.info().await?;
        let negotiation = extensions.negotiate(registry, &info)?;

        let mut request: Ctap2MakeCredentialRequest = op.into();
        let uv = uv_wanted(op.user_verification, &info, true);
        let mut session = user_verification(self, op.user_verification, uv, &mut request).await?;
        self.ensure_key_agreement(&mut session, extensions.needs_key_agreement(&negotiation))
            .await?;

        let inputs = extensions.make_credential_inputs(&negotiation, &session.context())?;
        request.extensions = Some(inputs);
        let response = self.ctap2_make_credential(&request).await?;
        extensions.make_credential_outputs(
            &negotiation,
            registry,
            response.authenticator_data.extensions.as_ref(),
            &session.context(),
        )?;

        info!(dropped = ?negotiation.dropped, "Credential created");
        Ok(MakeCredentialResponse {
            response,
            dropped_extensions: negotiation.dropped,
        })
    }

    #[instrument(skip_all, fields(dev = %self))]
    pub async fn get_assertions(
        &mut self,
        op: &GetAssertionRequest,
        extensions: &mut ExtensionSet<'_>,
    ) -> Result<GetAssertionResponse, Error> {
        trace!(?op, "WebAuthn GetAssertion request");
        let registry = self.extension_registry();
        let info = self.info().await?;
        let negotiation = extensions.negotiate(registry, &info)?;

        let mut request: Ctap2GetAssertionRequest = op.into();
        let uv = uv_wanted(op.user_verification, &info, false);
        let mut session = user_verification(self, op.user_verification, uv, &mut request).await?;
        self.ensure_key_agreement(&mut session, extensions.needs_key_agreement(&negotiation))
            .await?;

        let inputs = extensions.get_assertion_inputs(&negotiation, &session.context())?;
        request.extensions = Some(inputs);
        let first = self.ctap2_get_assertion(&request).await?;
        let count = first.credentials_count.unwrap_or(1);
        let mut assertions = vec![first];
        for _ in 1..count {
            assertions.push(self.ctap2_get_next_assertion().await?);
        }

        for assertion in &assertions {
            extensions.get_assertion_outputs(
                &negotiation,
                registry,
                assertion.authenticator_data.extensions.as_ref(),
                &session.context(),
            )?;
        }

        info!({ count = assertions.len() }, "Assertions received");
        Ok(GetAssertionResponse {
            assertions,
            dropped_extensions: negotiation.dropped,
        })
    }
}
