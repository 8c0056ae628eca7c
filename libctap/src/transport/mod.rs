pub mod device;
pub mod error;

pub use device::{
    AuthenticatorDevice, AuthenticatorListing, FilteredListing, StaticListing, TransportKind,
};
