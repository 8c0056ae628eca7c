//! A CTAP2 client: talks to FIDO2 authenticators over whatever transport the
//! embedder provides, negotiates user verification and extensions, and exposes
//! the result as WebAuthn-shaped operations.

pub mod client;
pub mod crypto;
pub mod extensions;
pub mod ffi;
pub mod fido;
pub mod library;
pub mod management;
pub mod ops;
pub mod pin;
pub mod proto;
pub mod transport;
pub mod webauthn;

#[cfg(test)]
mod testing;

pub use client::Ctap2Client;
pub use library::Library;
