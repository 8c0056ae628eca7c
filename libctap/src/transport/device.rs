use std::collections::HashSet;
use std::fmt::{self, Display};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::transport::error::TransportError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Usb,
    Ble,
    Nfc,
    SmartCard,
    Internal,
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Usb => "usb",
            TransportKind::Ble => "ble",
            TransportKind::Nfc => "nfc",
            TransportKind::SmartCard => "smart-card",
            TransportKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// One authenticator, reachable over one or more transports.
///
/// `send` takes a complete CTAP message (command byte followed by the CBOR body)
/// and returns the complete CTAP response (status byte followed by the optional
/// CBOR body). Transport framing, keep-alives and channel setup are the
/// implementor's business.
#[async_trait]
pub trait AuthenticatorDevice: Send + Sync + Display {
    async fn send(&self, message: &[u8]) -> Result<Vec<u8>, TransportError>;
    fn transports(&self) -> HashSet<TransportKind>;
}

/// A source of devices. Each call returns a point-in-time snapshot.
#[async_trait]
pub trait AuthenticatorListing: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<Arc<dyn AuthenticatorDevice>>, TransportError>;
}

/// A fixed set of devices, discovered by the embedder.
#[derive(Clone, Default)]
pub struct StaticListing {
    devices: Vec<Arc<dyn AuthenticatorDevice>>,
}

impl StaticListing {
    pub fn new(devices: Vec<Arc<dyn AuthenticatorDevice>>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl AuthenticatorListing for StaticListing {
    async fn list_devices(&self) -> Result<Vec<Arc<dyn AuthenticatorDevice>>, TransportError> {
        Ok(self.devices.clone())
    }
}

/// Restricts another listing to devices reachable over at least one of the given transports.
pub struct FilteredListing {
    inner: Arc<dyn AuthenticatorListing>,
    transports: HashSet<TransportKind>,
}

impl FilteredListing {
    pub fn new(inner: Arc<dyn AuthenticatorListing>, transports: &[TransportKind]) -> Self {
        Self {
            inner,
            transports: transports.iter().copied().collect(),
        }
    }
}

#[async_trait]
impl AuthenticatorListing for FilteredListing {
    #[instrument(skip_all)]
    async fn list_devices(&self) -> Result<Vec<Arc<dyn AuthenticatorDevice>>, TransportError> {
        let devices = self.inner.list_devices().await?;
        let total = devices.len();
        let kept: Vec<_> = devices
            .into_iter()
            .filter(|device| !device.transports().is_disjoint(&self.transports))
            .collect();
        debug!({ total, kept = kept.len() }, "Filtered device listing");
        Ok(kept)
    }
}
