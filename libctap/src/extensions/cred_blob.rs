use tracing::debug;

use super::{
    Extension, ExtensionContext, ExtensionParameter, ExtensionParameterKind,
    ExtensionRegistration,
};
use crate::proto::ctap2::Ctap2GetInfoResponse;
use crate::transport::error::Error;

pub const NAME: &str = "credBlob";

pub fn registration() -> ExtensionRegistration {
    ExtensionRegistration::new(
        NAME,
        ExtensionParameterKind::Boolean,
        ExtensionParameterKind::Bytes,
    )
}

/// Stores a small blob with a new credential, and reads it back on assertion.
#[derive(Debug, Default, Clone)]
pub struct CredBlobExtension {
    blob_to_store: Option<Vec<u8>>,
    created: bool,
    blobs: Vec<Option<Vec<u8>>>,
}

impl CredBlobExtension {
    pub fn new(blob_to_store: Option<Vec<u8>>) -> Self {
        Self {
            blob_to_store,
            ..Default::default()
        }
    }

    /// Whether the authenticator confirmed storing the blob.
    pub fn was_created(&self) -> bool {
        self.created
    }

    /// Blob of the first assertion.
    pub fn blob(&self) -> Option<&[u8]> {
        self.blobs.first().and_then(|blob| blob.as_deref())
    }

    /// One entry per assertion, in the order the authenticator returned them.
    pub fn blobs(&self) -> &[Option<Vec<u8>>] {
        &self.blobs
    }
}

impl Extension for CredBlobExtension {
    fn name(&self) -> &str {
        NAME
    }

    fn check_support(&self, info: &Ctap2GetInfoResponse) -> bool {
        if !info.supports_extension(NAME) {
            return false;
        }
        // credBlob depends on credProtect
        if !info.supports_extension("credProtect") {
            return false;
        }
        match (&self.blob_to_store, info.max_cred_blob_length) {
            (Some(blob), Some(max)) if blob.len() > max as usize => {
                debug!({ len = blob.len(), max }, "Blob exceeds maxCredBlobLength");
                false
            }
            _ => true,
        }
    }

    fn make_credential_input(
        &mut self,
        _ctx: &ExtensionContext,
    ) -> Result<Option<ExtensionParameter>, Error> {
        Ok(self.blob_to_store.clone().map(ExtensionParameter::Bytes))
    }

    fn make_credential_output(
        &mut self,
        output: Option<&ExtensionParameter>,
        _ctx: &ExtensionContext,
    ) -> Result<(), Error> {
        self.created = matches!(output, Some(ExtensionParameter::Boolean(true)));
        Ok(())
    }

    fn get_assertion_input(
        &mut self,
        _ctx: &ExtensionContext,
    ) -> Result<Option<ExtensionParameter>, Error> {
        self.blobs.clear();
        Ok(Some(ExtensionParameter::Boolean(true)))
    }

    fn get_assertion_output(
        &mut self,
        output: Option<&ExtensionParameter>,
        _ctx: &ExtensionContext,
    ) -> Result<(), Error> {
        self.blobs.push(match output {
            Some(ExtensionParameter::Bytes(blob)) => Some(blob.clone()),
            _ => None,
        });
        Ok(())
    }
}
