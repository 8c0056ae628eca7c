//! Cryptography provider capability.
//!
//! The engine never calls a primitive directly: everything goes through a
//! [`CryptoProvider`], so embedders can back the PIN/UV protocols with a
//! platform keystore or hardware module. [`RustCryptoProvider`] is the default,
//! built on the RustCrypto crates.

use std::fmt;

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::Mac;
use p256::{
    elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint},
    EncodedPoint, FieldBytes, PublicKey as P256PublicKey, SecretKey,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::error;

type Aes256CbcEncryptor = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDecryptor = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = hmac::Hmac<Sha256>;

pub const AES_BLOCK_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("data length {0} is not a multiple of the AES block size")]
    UnalignedData(usize),
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid output length requested")]
    InvalidOutputLength,
}

/// An uncompressed P-256 point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcPublicKey {
    pub x: [u8; 32],
    pub y: [u8; 32],
}

/// Opaque P-256 private scalar. Only the provider that created it interprets the bytes.
#[derive(Clone)]
pub struct EcPrivateKey(Vec<u8>);

impl EcPrivateKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for EcPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EcPrivateKey(..)")
    }
}

#[derive(Debug, Clone)]
pub struct EcKeyPair {
    pub private_key: EcPrivateKey,
    pub public_key: EcPublicKey,
}

pub trait CryptoProvider: Send + Sync {
    /// Generates a fresh P-256 key pair.
    fn generate_key_pair(&self) -> Result<EcKeyPair, CryptoError>;

    /// Returns Z, the x-coordinate of the shared point.
    fn ecdh(&self, private_key: &EcPrivateKey, peer: &EcPublicKey) -> Result<Vec<u8>, CryptoError>;

    /// AES-256-CBC without padding.
    fn aes256_cbc_encrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// AES-256-CBC without padding.
    fn aes256_cbc_decrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn hmac_sha256(&self, key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn sha256(&self, data: &[u8]) -> Vec<u8>;

    fn hkdf_sha256(
        &self,
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        length: usize,
    ) -> Result<Vec<u8>, CryptoError>;

    fn random_bytes(&self, length: usize) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RustCryptoProvider;

impl RustCryptoProvider {
    pub fn new() -> Self {
        Self
    }
}

fn check_aligned(data: &[u8]) -> Result<(), CryptoError> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        error!({ len = data.len() }, "Data length is not a multiple of AES block length");
        return Err(CryptoError::UnalignedData(data.len()));
    }
    Ok(())
}

fn field_bytes(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        expected: 32,
        actual: bytes.len(),
    })
}

impl CryptoProvider for RustCryptoProvider {
    fn generate_key_pair(&self) -> Result<EcKeyPair, CryptoError> {
        let secret = SecretKey::random(&mut OsRng);
        let point = secret.public_key().to_encoded_point(false);
        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            error!("Generated public key is not an uncompressed point");
            return Err(CryptoError::InvalidPublicKey);
        };
        Ok(EcKeyPair {
            private_key: EcPrivateKey(secret.to_bytes().to_vec()),
            public_key: EcPublicKey {
                x: field_bytes(x)?,
                y: field_bytes(y)?,
            },
        })
    }

    fn ecdh(&self, private_key: &EcPrivateKey, peer: &EcPublicKey) -> Result<Vec<u8>, CryptoError> {
        let Ok(secret) = SecretKey::from_slice(private_key.as_bytes()) else {
            error!("Failed to parse private key");
            return Err(CryptoError::InvalidPrivateKey);
        };
        let encoded_point = EncodedPoint::from_affine_coordinates(
            FieldBytes::from_slice(&peer.x),
            FieldBytes::from_slice(&peer.y),
            false,
        );
        let Some(peer_public_key) =
            Option::<P256PublicKey>::from(P256PublicKey::from_encoded_point(&encoded_point))
        else {
            error!("Peer public key is not on the curve");
            return Err(CryptoError::InvalidPublicKey);
        };
        let shared =
            p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer_public_key.as_affine());
        Ok(shared.raw_secret_bytes().to_vec())
    }

    fn aes256_cbc_encrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        check_aligned(plaintext)?;
        let Ok(enc) = Aes256CbcEncryptor::new_from_slices(key, iv) else {
            error!(
                { key_len = key.len(), iv_len = iv.len() },
                "Invalid key or IV for AES-256 encryption"
            );
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: key.len(),
            });
        };
        Ok(enc.encrypt_padded_vec_mut::<NoPadding>(plaintext))
    }

    fn aes256_cbc_decrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        check_aligned(ciphertext)?;
        let Ok(dec) = Aes256CbcDecryptor::new_from_slices(key, iv) else {
            error!(
                { key_len = key.len(), iv_len = iv.len() },
                "Invalid key or IV for AES-256 decryption"
            );
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: key.len(),
            });
        };
        dec.decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    fn hmac_sha256(&self, key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut hmac = HmacSha256::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: key.len(),
        })?;
        hmac.update(message);
        Ok(hmac.finalize().into_bytes().to_vec())
    }

    fn sha256(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::default();
        hasher.update(data);
        hasher.finalize().to_vec()
    }

    fn hkdf_sha256(
        &self,
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        length: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = vec![0u8; length];
        hk.expand(info, &mut okm)
            .map_err(|_| CryptoError::InvalidOutputLength)?;
        Ok(okm)
    }

    fn random_bytes(&self, length: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; length];
        OsRng.fill_bytes(&mut bytes);
        bytes
    }
}
