use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::client::Ctap2Client;
use crate::crypto::{CryptoProvider, RustCryptoProvider};
use crate::extensions::{ExtensionRegistration, ExtensionRegistry};
use crate::pin::{NoPinProvider, PinProvider};
use crate::transport::error::Error;
use crate::transport::{AuthenticatorDevice, AuthenticatorListing, FilteredListing, TransportKind};

/// Root object: the crypto provider, where devices come from, the default PIN
/// provider and the extensions clients may use.
///
/// Configure it with the builder methods, then hand out clients. Clients borrow
/// the library, so registrations cannot change under a running operation.
pub struct Library {
    crypto: Arc<dyn CryptoProvider>,
    listings: Vec<Arc<dyn AuthenticatorListing>>,
    pin_provider: Arc<dyn PinProvider>,
    extension_registry: ExtensionRegistry,
}

impl Default for Library {
    fn default() -> Self {
        Self::new(Arc::new(RustCryptoProvider::new()))
    }
}

impl Library {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            crypto,
            listings: vec![],
            pin_provider: Arc::new(NoPinProvider),
            extension_registry: ExtensionRegistry::with_builtins(),
        }
    }

    pub fn with_listing(mut self, listing: Arc<dyn AuthenticatorListing>) -> Self {
        self.listings.push(listing);
        self
    }

    pub fn with_pin_provider(mut self, pin_provider: Arc<dyn PinProvider>) -> Self {
        self.pin_provider = pin_provider;
        self
    }

    pub fn register_extension(&mut self, registration: ExtensionRegistration) -> Result<(), Error> {
        self.extension_registry.register(registration)
    }

    pub fn crypto(&self) -> Arc<dyn CryptoProvider> {
        self.crypto.clone()
    }

    pub fn extension_registry(&self) -> &ExtensionRegistry {
        &self.extension_registry
    }

    /// Devices from every listing, optionally restricted to some transports.
    #[instrument(skip_all)]
    pub async fn list_devices(
        &self,
        transports: Option<&[TransportKind]>,
    ) -> Result<Vec<Arc<dyn AuthenticatorDevice>>, Error> {
        let mut devices = vec![];
        for listing in &self.listings {
            let listed = match transports {
                Some(transports) => {
                    FilteredListing::new(listing.clone(), transports)
                        .list_devices()
                        .await?
                }
                None => listing.list_devices().await?,
            };
            devices.extend(listed);
        }
        info!({ count = devices.len() }, "Listed devices");
        Ok(devices)
    }

    pub fn ctap_client(&self, device: Arc<dyn AuthenticatorDevice>) -> Ctap2Client<'_> {
        self.ctap_client_with_pin_provider(device, self.pin_provider.clone())
    }

    pub fn ctap_client_with_pin_provider(
        &self,
        device: Arc<dyn AuthenticatorDevice>,
        pin_provider: Arc<dyn PinProvider>,
    ) -> Ctap2Client<'_> {
        debug!(%device, "New CTAP2 client");
        Ctap2Client::new(self, device, pin_provider)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::Library;
    use crate::extensions::{ExtensionParameterKind, ExtensionRegistration};
    use crate::testing::SpyDevice;
    use crate::transport::{AuthenticatorDevice, StaticListing, TransportKind};

    #[tokio::test]
    async fn lists_from_every_listing() {
        let usb: Arc<dyn AuthenticatorDevice> =
            Arc::new(SpyDevice::new("usb", &[TransportKind::Usb], vec![]));
        let nfc: Arc<dyn AuthenticatorDevice> =
            Arc::new(SpyDevice::new("nfc", &[TransportKind::Nfc], vec![]));
        let library = Library::default()
            .with_listing(Arc::new(StaticListing::new(vec![usb])))
            .with_listing(Arc::new(StaticListing::new(vec![nfc])));

        assert_eq!(library.list_devices(None).await.unwrap().len(), 2);
        let nfc_only = library
            .list_devices(Some(&[TransportKind::Nfc]))
            .await
            .unwrap();
        assert_eq!(nfc_only.len(), 1);
        assert_eq!(nfc_only[0].to_string(), "nfc");
    }

    #[test]
    fn registrations_are_per_library() {
        let mut library = Library::default();
        library
            .register_extension(ExtensionRegistration::new(
                "largeBlobKey",
                ExtensionParameterKind::Boolean,
                ExtensionParameterKind::Bytes,
            ))
            .unwrap();
        assert!(library.extension_registry().get("largeBlobKey").is_some());
        assert!(Library::default()
            .extension_registry()
            .get("largeBlobKey")
            .is_none());
    }
}
