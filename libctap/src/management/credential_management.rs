use async_trait::async_trait;
use tracing::{debug, error, info, instrument};

use crate::client::Ctap2Client;
use crate::ops::webauthn::UserVerificationRequirement;
use crate::proto::ctap2::{
    Ctap2, Ctap2CredentialData, Ctap2CredentialManagementMetadata,
    Ctap2CredentialManagementRequest, Ctap2CredentialManagementResponse,
    Ctap2PublicKeyCredentialDescriptor, Ctap2PublicKeyCredentialUserEntity, Ctap2RPData,
};
use crate::transport::error::{CtapError, Error, PlatformError, ProtocolError};
use crate::webauthn::user_verification;

/// Management of the discoverable credentials stored on an authenticator.
///
/// Every call that starts an exchange obtains a fresh pinUvAuthToken with the
/// credential-management permission.
#[async_trait]
pub trait CredentialManagement {
    async fn credential_metadata(&mut self) -> Result<Ctap2CredentialManagementMetadata, Error>;
    async fn enumerate_rps(&mut self) -> Result<Vec<Ctap2RPData>, Error>;
    async fn enumerate_credentials(
        &mut self,
        rp_id_hash: &[u8],
    ) -> Result<Vec<Ctap2CredentialData>, Error>;
    async fn delete_credential(
        &mut self,
        credential_id: &Ctap2PublicKeyCredentialDescriptor,
    ) -> Result<(), Error>;
    async fn update_user_information(
        &mut self,
        credential_id: &Ctap2PublicKeyCredentialDescriptor,
        user: &Ctap2PublicKeyCredentialUserEntity,
    ) -> Result<(), Error>;
}

impl Ctap2Client<'_> {
    async fn credential_management(
        &mut self,
        mut request: Ctap2CredentialManagementRequest,
    ) -> Result<Ctap2CredentialManagementResponse, Error> {
        let info = self.info().await?;
        if !info.supports_credential_management() {
            error!("Authenticator does not support credential management");
            return Err(PlatformError::CredentialManagementUnsupported.into());
        }
        request.use_legacy_preview = info.uses_credential_management_preview();
        if request.subcommand.requires_auth() {
            user_verification(self, UserVerificationRequirement::Required, true, &mut request)
                .await?;
        }
        self.ctap2_credential_management(&request).await
    }
}

/// An empty enumeration is reported with NoCredentials.
fn empty_on_no_credentials(
    result: Result<Ctap2CredentialManagementResponse, Error>,
) -> Result<Option<Ctap2CredentialManagementResponse>, Error> {
    match result {
        Ok(response) => Ok(Some(response)),
        Err(Error::Ctap(CtapError::NoCredentials)) => Ok(None),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl<'l> CredentialManagement for Ctap2Client<'l> {
    #[instrument(skip_all, fields(dev = %self))]
    async fn credential_metadata(&mut self) -> Result<Ctap2CredentialManagementMetadata, Error> {
        let response = self
            .credential_management(Ctap2CredentialManagementRequest::new_get_credential_metadata())
            .await?;
        let (Some(existing), Some(remaining)) = (
            response.existing_resident_credentials_count,
            response.max_possible_remaining_resident_credentials_count,
        ) else {
            error!(?response, "Incomplete credential metadata");
            let field = "existingResidentCredentialsCount";
            return Err(ProtocolError::MissingField(field.into()).into());
        };
        let metadata = Ctap2CredentialManagementMetadata {
            existing_resident_credentials_count: existing,
            max_possible_remaining_resident_credentials_count: remaining,
        };
        info!(?metadata, "Credential metadata");
        Ok(metadata)
    }

    #[instrument(skip_all, fields(dev = %self))]
    async fn enumerate_rps(&mut self) -> Result<Vec<Ctap2RPData>, Error> {
        let first = self
            .credential_management(Ctap2CredentialManagementRequest::new_enumerate_rps_begin())
            .await;
        let Some(first) = empty_on_no_credentials(first)? else {
            info!("No relying parties");
            return Ok(vec![]);
        };
        let total = first.total_rps.unwrap_or(1);
        let mut rps = vec![Ctap2RPData::try_from(first)?];
        for _ in 1..total {
            let request = Ctap2CredentialManagementRequest::new_enumerate_rps_next_rp();
            let next = self.credential_management(request).await?;
            rps.push(Ctap2RPData::try_from(next)?);
        }
        info!({ count = rps.len() }, "Enumerated relying parties");
        Ok(rps)
    }

    #[instrument(skip_all, fields(dev = %self))]
    async fn enumerate_credentials(
        &mut self,
        rp_id_hash: &[u8],
    ) -> Result<Vec<Ctap2CredentialData>, Error> {
        let first = self
            .credential_management(
                Ctap2CredentialManagementRequest::new_enumerate_credentials_begin(rp_id_hash),
            )
            .await;
        let Some(first) = empty_on_no_credentials(first)? else {
            info!("No credentials for relying party");
            return Ok(vec![]);
        };
        let total = first.total_credentials.unwrap_or(1);
        let mut credentials = vec![Ctap2CredentialData::try_from(first)?];
        for _ in 1..total {
            let next = self
                .credential_management(
                    Ctap2CredentialManagementRequest::new_enumerate_credentials_next(),
                )
                .await?;
            credentials.push(Ctap2CredentialData::try_from(next)?);
        }
        info!({ count = credentials.len() }, "Enumerated credentials");
        Ok(credentials)
    }

    #[instrument(skip_all, fields(dev = %self))]
    async fn delete_credential(
        &mut self,
        credential_id: &Ctap2PublicKeyCredentialDescriptor,
    ) -> Result<(), Error> {
        self.credential_management(Ctap2CredentialManagementRequest::new_delete_credential(
            credential_id,
        ))
        .await?;
        debug!("Credential deleted");
        Ok(())
    }

    #[instrument(skip_all, fields(dev = %self))]
    async fn update_user_information(
        &mut self,
        credential_id: &Ctap2PublicKeyCredentialDescriptor,
        user: &Ctap2PublicKeyCredentialUserEntity,
    ) -> Result<(), Error> {
        self.credential_management(
            Ctap2CredentialManagementRequest::new_update_user_information(credential_id, user),
        )
        .await?;
        debug!("User information updated");
        Ok(())
    }
}
