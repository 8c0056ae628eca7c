pub mod ctap2;
mod error;

pub use error::CtapError;
