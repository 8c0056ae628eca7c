use std::fmt::{self, Display};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, trace};

use crate::crypto::CryptoProvider;
use crate::extensions::ExtensionRegistry;
use crate::library::Library;
use crate::pin::PinProvider;
use crate::proto::ctap2::{Ctap2, Ctap2GetInfoResponse};
use crate::transport::error::Error;
use crate::transport::AuthenticatorDevice;

/// A session with one authenticator.
///
/// Every operation takes `&mut self`, so a client never has two messages in
/// flight. The high-level operations live in [`crate::webauthn`],
/// [`crate::management`] and [`crate::pin`].
pub struct Ctap2Client<'l> {
    library: &'l Library,
    device: Arc<dyn AuthenticatorDevice>,
    pin_provider: Arc<dyn PinProvider>,
    info: Option<Arc<Ctap2GetInfoResponse>>,
}

impl<'l> Ctap2Client<'l> {
    pub(crate) fn new(
        library: &'l Library,
        device: Arc<dyn AuthenticatorDevice>,
        pin_provider: Arc<dyn PinProvider>,
    ) -> Self {
        Self {
            library,
            device,
            pin_provider,
            info: None,
        }
    }

    pub fn device(&self) -> &Arc<dyn AuthenticatorDevice> {
        &self.device
    }

    pub fn library(&self) -> &'l Library {
        self.library
    }

    pub(crate) fn crypto(&self) -> Arc<dyn CryptoProvider> {
        self.library.crypto()
    }

    pub(crate) fn pin_provider(&self) -> Arc<dyn PinProvider> {
        self.pin_provider.clone()
    }

    pub(crate) fn extension_registry(&self) -> &'l ExtensionRegistry {
        self.library.extension_registry()
    }

    /// Always queries the authenticator, replacing the cached info.
    #[instrument(skip_all, fields(dev = %self))]
    pub async fn get_info(&mut self) -> Result<Arc<Ctap2GetInfoResponse>, Error> {
        let info = Arc::new(self.ctap2_get_info().await?);
        self.info = Some(info.clone());
        Ok(info)
    }

    /// The cached info, fetched on first use.
    pub async fn info(&mut self) -> Result<Arc<Ctap2GetInfoResponse>, Error> {
        match &self.info {
            Some(info) => Ok(info.clone()),
            None => self.get_info().await,
        }
    }

    pub fn invalidate_info(&mut self) {
        debug!("Dropping cached GetInfo response");
        self.info = None;
    }

    /// Asks the user to confirm this authenticator, e.g. by touching it.
    #[instrument(skip_all, fields(dev = %self))]
    pub async fn selection(&mut self) -> Result<(), Error> {
        self.ctap2_selection().await
    }
}

impl Display for Ctap2Client<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.device.fmt(f)
    }
}

#[async_trait]
impl<'l> Ctap2 for Ctap2Client<'l> {
    fn max_msg_size(&self) -> Option<usize> {
        self.info
            .as_ref()
            .and_then(|info| info.max_msg_size)
            .map(|max| max as usize)
    }

    async fn exchange(&mut self, message: &[u8]) -> Result<Vec<u8>, Error> {
        trace!({ len = message.len() }, "Sending CTAP message");
        let response = self.device.send(message).await?;
        trace!({ len = response.len() }, "Received CTAP response");
        Ok(response)
    }
}
