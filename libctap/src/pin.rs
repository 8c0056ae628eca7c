use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use heapless_bytes::Bytes;
use serde_cbor::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::client::Ctap2Client;
use crate::crypto::{CryptoError, CryptoProvider, EcPublicKey, AES_BLOCK_SIZE};
use crate::proto::ctap2::{Ctap2, Ctap2ClientPinRequest, Ctap2PinUvAuthProtocol};
use crate::transport::error::{Error, PlatformError, ProtocolError};
use crate::webauthn::{obtain_pin, obtain_shared_secret, select_uv_proto};

/// Longest PIN, in bytes, that still leaves room for padding.
const PIN_MAX_BYTES: usize = 63;
const PADDED_PIN_LEN: usize = 64;

/// What the PIN provider is told when asked for a PIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinRequestContext {
    pub retries_left: Option<u32>,
    pub rp_id: Option<String>,
    pub device: String,
}

#[async_trait]
pub trait PinProvider: Send + Sync {
    /// Returns `None` to cancel the operation.
    async fn provide_pin(&self, context: &PinRequestContext) -> Option<String>;
}

#[derive(Clone)]
pub struct StaticPinProvider {
    pin: String,
}

impl StaticPinProvider {
    pub fn new(pin: &str) -> Self {
        Self {
            pin: pin.to_owned(),
        }
    }
}

impl fmt::Debug for StaticPinProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticPinProvider(..)")
    }
}

#[async_trait]
impl PinProvider for StaticPinProvider {
    async fn provide_pin(&self, context: &PinRequestContext) -> Option<String> {
        let retries_left = context.retries_left;
        if retries_left.map_or(false, |no| no <= 1) {
            warn!(
                ?retries_left,
                "Refusing to provide static PIN, insufficient number of attempts left"
            );
            return None;
        }

        info!(?retries_left, device = %context.device, "Providing static PIN");
        Some(self.pin.clone())
    }
}

#[derive(Debug, Default)]
pub struct StdinPromptPinProvider {}

impl StdinPromptPinProvider {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl PinProvider for StdinPromptPinProvider {
    async fn provide_pin(&self, context: &PinRequestContext) -> Option<String> {
        use std::io::{self, Write};
        use text_io::try_read;

        if let Some(retries_left) = context.retries_left {
            println!("PIN: {} attempts left.", retries_left);
        }
        match &context.rp_id {
            Some(rp_id) => print!("PIN: Please enter the PIN for {} ({}): ", context.device, rp_id),
            None => print!("PIN: Please enter the PIN for {}: ", context.device),
        }
        let _ = io::stdout().flush();
        let pin_raw: Result<String, _> = try_read!("{}\n");

        match pin_raw {
            Ok(pin) if !pin.is_empty() => Some(pin),
            _ => {
                println!("PIN: No PIN provided, cancelling operation.");
                None
            }
        }
    }
}

/// Never provides a PIN; operations needing one fail with `PinRequiredButNotProvided`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPinProvider;

#[async_trait]
impl PinProvider for NoPinProvider {
    async fn provide_pin(&self, _context: &PinRequestContext) -> Option<String> {
        debug!("No PIN provider configured");
        None
    }
}

/// The platform half of a key agreement: the ephemeral public key to send to the
/// authenticator and the shared secret derived from it. The private key is gone by
/// the time this exists.
#[derive(Clone)]
pub struct KeyAgreementPlatformKey {
    pub public_key: EcPublicKey,
    pub shared_secret: Vec<u8>,
    pub protocol: Ctap2PinUvAuthProtocol,
}

impl KeyAgreementPlatformKey {
    /// The platform key, as sent in the keyAgreement field.
    pub fn cose_key(&self) -> Result<cosey::PublicKey, ProtocolError> {
        cose_key_from_ec(&self.public_key)
    }
}

impl fmt::Debug for KeyAgreementPlatformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyAgreementPlatformKey")
            .field("public_key", &self.public_key)
            .field("shared_secret", &"..")
            .field("protocol", &self.protocol)
            .finish()
    }
}

pub trait PinUvAuthProtocol: Send + Sync {
    fn version(&self) -> Ctap2PinUvAuthProtocol;

    fn crypto(&self) -> &dyn CryptoProvider;

    /// kdf(Z) → sharedSecret
    fn kdf(&self, z: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// The plaintext must be a multiple of the AES block size.
    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn authenticate(&self, key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Generates an ephemeral key pair, runs ECDH against the authenticator's key and
    /// derives the shared secret.
    #[instrument(skip_all, fields(version = ?self.version()))]
    fn encapsulate(&self, peer: &EcPublicKey) -> Result<KeyAgreementPlatformKey, CryptoError> {
        let key_pair = self.crypto().generate_key_pair()?;
        let z = self.crypto().ecdh(&key_pair.private_key, peer)?;
        Ok(KeyAgreementPlatformKey {
            public_key: key_pair.public_key,
            shared_secret: self.kdf(&z)?,
            protocol: self.version(),
        })
    }
}

pub struct PinUvAuthProtocolOne {
    crypto: Arc<dyn CryptoProvider>,
}

impl PinUvAuthProtocolOne {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self { crypto }
    }
}

impl PinUvAuthProtocol for PinUvAuthProtocolOne {
    fn version(&self) -> Ctap2PinUvAuthProtocol {
        Ctap2PinUvAuthProtocol::One
    }

    fn crypto(&self) -> &dyn CryptoProvider {
        self.crypto.as_ref()
    }

    fn kdf(&self, z: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.crypto.sha256(z))
    }

    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        // All-zero IV, no padding.
        self.crypto
            .aes256_cbc_encrypt(key, &[0; AES_BLOCK_SIZE], plaintext)
    }

    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.crypto
            .aes256_cbc_decrypt(key, &[0; AES_BLOCK_SIZE], ciphertext)
    }

    fn authenticate(&self, key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut hmac = self.crypto.hmac_sha256(key, message)?;
        hmac.truncate(16);
        Ok(hmac)
    }
}

pub struct PinUvAuthProtocolTwo {
    crypto: Arc<dyn CryptoProvider>,
}

impl PinUvAuthProtocolTwo {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self { crypto }
    }

    /// Selects the AES half of the shared secret.
    fn aes_key(key: &[u8]) -> Result<&[u8], CryptoError> {
        key.get(32..64).ok_or(CryptoError::InvalidKeyLength {
            expected: 64,
            actual: key.len(),
        })
    }
}

impl PinUvAuthProtocol for PinUvAuthProtocolTwo {
    fn version(&self) -> Ctap2PinUvAuthProtocol {
        Ctap2PinUvAuthProtocol::Two
    }

    fn crypto(&self) -> &dyn CryptoProvider {
        self.crypto.as_ref()
    }

    fn kdf(&self, z: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let salt = [0u8; 32];
        let mut output = self.crypto.hkdf_sha256(&salt, z, b"CTAP2 HMAC key", 32)?;
        output.extend(self.crypto.hkdf_sha256(&salt, z, b"CTAP2 AES key", 32)?);
        Ok(output)
    }

    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = Self::aes_key(key)?;
        let iv = self.crypto.random_bytes(AES_BLOCK_SIZE);
        let ct = self.crypto.aes256_cbc_encrypt(key, &iv, plaintext)?;
        let mut out = iv;
        out.extend(ct);
        Ok(out)
    }

    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = Self::aes_key(key)?;
        if ciphertext.len() < AES_BLOCK_SIZE {
            error!({ len = ciphertext.len() }, "Invalid length for ciphertext");
            return Err(CryptoError::UnalignedData(ciphertext.len()));
        }
        let (iv, ct) = ciphertext.split_at(AES_BLOCK_SIZE);
        self.crypto.aes256_cbc_decrypt(key, iv, ct)
    }

    fn authenticate(&self, key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        // Tokens are exactly 32 bytes; shared secrets keep their HMAC half.
        let key = key.get(..32).ok_or(CryptoError::InvalidKeyLength {
            expected: 32,
            actual: key.len(),
        })?;
        self.crypto.hmac_sha256(key, message)
    }
}

impl Ctap2PinUvAuthProtocol {
    pub fn create_protocol_object(
        &self,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Box<dyn PinUvAuthProtocol> {
        match self {
            Ctap2PinUvAuthProtocol::One => Box::new(PinUvAuthProtocolOne::new(crypto)),
            Ctap2PinUvAuthProtocol::Two => Box::new(PinUvAuthProtocolTwo::new(crypto)),
        }
    }
}

/// hash(pin) -> LEFT(SHA-256(pin), 16)
pub fn pin_hash(crypto: &dyn CryptoProvider, pin: &str) -> Vec<u8> {
    let mut hashed = crypto.sha256(pin.as_bytes());
    hashed.truncate(16);
    hashed
}

pub fn cose_key_from_ec(key: &EcPublicKey) -> Result<cosey::PublicKey, ProtocolError> {
    let x = Bytes::<32>::from_slice(&key.x).map_err(|_| ProtocolError::InvalidKeyAgreement)?;
    let y = Bytes::<32>::from_slice(&key.y).map_err(|_| ProtocolError::InvalidKeyAgreement)?;
    Ok(cosey::PublicKey::EcdhEsHkdf256Key(
        cosey::EcdhEsHkdf256PublicKey { x, y },
    ))
}

const COSE_KTY: i128 = 1;
const COSE_ALG: i128 = 3;
const COSE_CRV: i128 = -1;
const COSE_X: i128 = -2;
const COSE_Y: i128 = -3;
const COSE_KTY_EC2: i128 = 2;
const COSE_CRV_P256: i128 = 1;
const COSE_ALG_ECDH_ES_HKDF_256: i128 = -25;

/// Parses the authenticator's keyAgreement COSE_Key (EC2, P-256).
pub fn ec_from_cose_value(value: &Value) -> Result<EcPublicKey, ProtocolError> {
    let Value::Map(entries) = value else {
        error!(?value, "keyAgreement is not a map");
        return Err(ProtocolError::InvalidKeyAgreement);
    };
    let get = |label: i128| entries.get(&Value::Integer(label));

    if get(COSE_KTY) != Some(&Value::Integer(COSE_KTY_EC2))
        || get(COSE_CRV) != Some(&Value::Integer(COSE_CRV_P256))
    {
        error!("keyAgreement is not an EC2 P-256 key");
        return Err(ProtocolError::InvalidKeyAgreement);
    }
    if let Some(alg) = get(COSE_ALG) {
        if alg != &Value::Integer(COSE_ALG_ECDH_ES_HKDF_256) {
            error!(?alg, "Unexpected keyAgreement algorithm");
            return Err(ProtocolError::InvalidKeyAgreement);
        }
    }

    let coordinate = |label: i128| -> Result<[u8; 32], ProtocolError> {
        let Some(Value::Bytes(bytes)) = get(label) else {
            error!(?label, "keyAgreement coordinate missing");
            return Err(ProtocolError::InvalidKeyAgreement);
        };
        bytes.as_slice().try_into().map_err(|_| {
            error!({ len = bytes.len() }, "keyAgreement coordinate has the wrong length");
            ProtocolError::InvalidKeyAgreement
        })
    };
    Ok(EcPublicKey {
        x: coordinate(COSE_X)?,
        y: coordinate(COSE_Y)?,
    })
}

#[async_trait]
pub trait PinManagement {
    async fn get_pin_retries(&mut self) -> Result<u32, Error>;
    async fn set_pin(&mut self, new_pin: &str) -> Result<(), Error>;
    async fn change_pin(&mut self, new_pin: &str) -> Result<(), Error>;
}

fn check_new_pin(new_pin: &str, min_length: u32) -> Result<Vec<u8>, Error> {
    if new_pin.chars().count() < min_length as usize {
        warn!(min_length, "New PIN is too short");
        return Err(Error::Platform(PlatformError::PinTooShort));
    }
    if new_pin.len() > PIN_MAX_BYTES {
        warn!("New PIN is too long");
        return Err(Error::Platform(PlatformError::PinTooLong));
    }
    let mut padded = new_pin.as_bytes().to_vec();
    padded.resize(PADDED_PIN_LEN, 0x00);
    Ok(padded)
}

impl Ctap2Client<'_> {
    #[instrument(skip_all, fields(dev = %self))]
    async fn set_or_change_pin(&mut self, new_pin: &str, change: bool) -> Result<(), Error> {
        let info = self.info().await?;
        let padded_new_pin = check_new_pin(new_pin, info.min_pin_length())?;

        match (info.option_present("clientPin"), info.option_enabled("clientPin"), change) {
            (false, _, _) => return Err(Error::Platform(PlatformError::PinNotSupported)),
            (true, true, false) => return Err(Error::Platform(PlatformError::PinAlreadySet)),
            (true, false, true) => return Err(Error::Platform(PlatformError::PinNotSet)),
            _ => {}
        }

        let uv_proto = select_uv_proto(self.crypto(), &info);
        let current_pin = if change {
            Some(obtain_pin(self, uv_proto.as_ref(), None).await?)
        } else {
            None
        };

        let key_agreement = obtain_shared_secret(self, uv_proto.as_ref()).await?;
        let shared_secret = &key_agreement.shared_secret;
        let new_pin_enc = uv_proto.encrypt(shared_secret, &padded_new_pin)?;

        let request = match current_pin {
            Some(current_pin) => {
                let pin_hash = pin_hash(uv_proto.crypto(), &current_pin);
                let pin_hash_enc = uv_proto.encrypt(shared_secret, &pin_hash)?;
                // authenticate(shared secret, newPinEnc || pinHashEnc)
                let uv_auth_param = uv_proto.authenticate(
                    shared_secret,
                    &[new_pin_enc.as_slice(), pin_hash_enc.as_slice()].concat(),
                )?;
                Ctap2ClientPinRequest::new_change_pin(
                    uv_proto.version(),
                    &new_pin_enc,
                    &pin_hash_enc,
                    key_agreement.cose_key()?,
                    &uv_auth_param,
                )
            }
            None => {
                let uv_auth_param = uv_proto.authenticate(shared_secret, &new_pin_enc)?;
                Ctap2ClientPinRequest::new_set_pin(
                    uv_proto.version(),
                    &new_pin_enc,
                    key_agreement.cose_key()?,
                    &uv_auth_param,
                )
            }
        };

        self.ctap2_client_pin(&request).await?;
        // The clientPin option changed; the next operation must see it.
        self.invalidate_info();
        info!(change, "PIN updated");
        Ok(())
    }
}

#[async_trait]
impl<'l> PinManagement for Ctap2Client<'l> {
    #[instrument(skip_all, fields(dev = %self))]
    async fn get_pin_retries(&mut self) -> Result<u32, Error> {
        let info = self.info().await?;
        if !info.option_present("clientPin") {
            return Err(Error::Platform(PlatformError::PinNotSupported));
        }
        let protocol = info.preferred_pin_uv_auth_protocol();
        let response = self
            .ctap2_client_pin(&Ctap2ClientPinRequest::new_get_pin_retries(Some(protocol)))
            .await?;
        let Some(retries) = response.pin_retries else {
            error!("getPinRetries response has no pinRetries");
            return Err(ProtocolError::MissingField("pinRetries".into()).into());
        };
        Ok(retries)
    }

    async fn set_pin(&mut self, new_pin: &str) -> Result<(), Error> {
        self.set_or_change_pin(new_pin, false).await
    }

    async fn change_pin(&mut self, new_pin: &str) -> Result<(), Error> {
        self.set_or_change_pin(new_pin, true).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use serde_cbor::Value;

    use super::{
        check_new_pin, cose_key_from_ec, ec_from_cose_value, pin_hash, PinManagement,
        PinProvider, PinRequestContext, PinUvAuthProtocol, PinUvAuthProtocolOne,
        PinUvAuthProtocolTwo, StaticPinProvider,
    };
    use crate::crypto::{CryptoError, CryptoProvider, RustCryptoProvider};
    use crate::pin::NoPinProvider;
    use crate::proto::ctap2::Ctap2PinUvAuthProtocol;
    use crate::testing::{init_tracing, MockAuthenticator};
    use crate::transport::error::{Error, PlatformError, ProtocolError, UserVerificationError};
    use crate::Library;

    fn crypto() -> Arc<dyn CryptoProvider> {
        Arc::new(RustCryptoProvider::new())
    }

    #[test]
    fn key_agreement_agrees_with_authenticator_peer() {
        for version in [Ctap2PinUvAuthProtocol::One, Ctap2PinUvAuthProtocol::Two] {
            let protocol = version.create_protocol_object(crypto());
            let authenticator = crypto().generate_key_pair().unwrap();

            let platform = protocol.encapsulate(&authenticator.public_key).unwrap();
            let z = crypto()
                .ecdh(&authenticator.private_key, &platform.public_key)
                .unwrap();
            let authenticator_secret = protocol.kdf(&z).unwrap();

            assert_eq!(platform.shared_secret, authenticator_secret);
            assert_eq!(platform.protocol, version);
        }
    }

    #[test]
    fn protocol_one_vectors() {
        let protocol = PinUvAuthProtocolOne::new(crypto());
        let key = [0x42; 32];
        let plaintext = [0x11; 32];

        let ciphertext = protocol.encrypt(&key, &plaintext).unwrap();
        assert_eq!(ciphertext.len(), 32);
        // Zero IV: deterministic.
        assert_eq!(ciphertext, protocol.encrypt(&key, &plaintext).unwrap());
        assert_eq!(protocol.decrypt(&key, &ciphertext).unwrap(), plaintext);

        let tag = protocol.authenticate(&key, b"message").unwrap();
        assert_eq!(tag.len(), 16);
        assert_eq!(tag, crypto().hmac_sha256(&key, b"message").unwrap()[..16]);

        assert_eq!(
            protocol.encrypt(&key, &[0; 15]),
            Err(CryptoError::UnalignedData(15))
        );
    }

    #[test]
    fn protocol_two_vectors() {
        let protocol = PinUvAuthProtocolTwo::new(crypto());
        let shared = protocol.kdf(&[7; 32]).unwrap();
        assert_eq!(shared.len(), 64);

        let ciphertext = protocol.encrypt(&shared, &[0x22; 16]).unwrap();
        assert_eq!(ciphertext.len(), 32);
        assert_eq!(protocol.decrypt(&shared, &ciphertext).unwrap(), vec![0x22; 16]);
        assert!(protocol.decrypt(&shared, &ciphertext[..15]).is_err());

        let tag = protocol.authenticate(&shared, b"message").unwrap();
        assert_eq!(tag, crypto().hmac_sha256(&shared[..32], b"message").unwrap());
        assert_eq!(tag.len(), 32);

        assert_eq!(
            protocol.encrypt(&shared[..32], &[0; 16]),
            Err(CryptoError::InvalidKeyLength {
                expected: 64,
                actual: 32
            })
        );
    }

    #[test]
    fn pin_hash_is_truncated_sha256() {
        let hash = pin_hash(crypto().as_ref(), "1234");
        assert_eq!(
            hash,
            vec![
                0x03, 0xac, 0x67, 0x42, 0x16, 0xf3, 0xe1, 0x5c, 0x76, 0x1e, 0xe1, 0xa5, 0xe2,
                0x55, 0xf0, 0x67
            ]
        );
    }

    #[test]
    fn cose_key_round_trip_and_rejection() {
        let key = crypto().generate_key_pair().unwrap().public_key;
        let value = serde_cbor::value::to_value(cose_key_from_ec(&key).unwrap()).unwrap();
        assert_eq!(ec_from_cose_value(&value).unwrap(), key);

        let Value::Map(mut entries) = value else {
            panic!("COSE key is a map");
        };
        entries.insert(Value::Integer(-2), Value::Bytes(vec![1; 31]));
        assert_eq!(
            ec_from_cose_value(&Value::Map(entries)),
            Err(ProtocolError::InvalidKeyAgreement)
        );

        let mut rsa = BTreeMap::new();
        rsa.insert(Value::Integer(1), Value::Integer(3));
        assert!(ec_from_cose_value(&Value::Map(rsa)).is_err());
    }

    #[tokio::test]
    async fn static_provider_refuses_last_attempt() {
        let provider = StaticPinProvider::new("1234");
        let mut context = PinRequestContext {
            retries_left: Some(8),
            rp_id: None,
            device: "mock".into(),
        };
        assert_eq!(provider.provide_pin(&context).await, Some("1234".into()));
        context.retries_left = Some(1);
        assert_eq!(provider.provide_pin(&context).await, None);
        assert_eq!(NoPinProvider.provide_pin(&context).await, None);
    }

    #[test]
    fn new_pin_validation() {
        assert_eq!(
            check_new_pin("123", 4),
            Err(Error::Platform(PlatformError::PinTooShort))
        );
        // Code points, not bytes.
        assert!(check_new_pin("ééé", 4).is_err());
        assert_eq!(
            check_new_pin(&"1".repeat(64), 4),
            Err(Error::Platform(PlatformError::PinTooLong))
        );
        let padded = check_new_pin("1234", 4).unwrap();
        assert_eq!(padded.len(), 64);
        assert_eq!(&padded[..5], b"1234\0");
    }

    #[tokio::test]
    async fn set_then_change_pin() {
        init_tracing();
        let authenticator = MockAuthenticator::builder()
            .protocols(&[2])
            .build();
        let library = Library::default();
        let mut client =
            library.ctap_client_with_pin_provider(authenticator.device(), Arc::new(NoPinProvider));

        client.set_pin("4321").await.unwrap();
        assert_eq!(authenticator.pin().as_deref(), Some("4321"));
        assert_eq!(
            client.set_pin("5555").await,
            Err(Error::Platform(PlatformError::PinAlreadySet))
        );

        // Changing needs the current PIN from the provider.
        assert_eq!(
            client.change_pin("5555").await,
            Err(Error::UserVerification(
                UserVerificationError::PinRequiredButNotProvided
            ))
        );

        let mut client = library.ctap_client_with_pin_provider(
            authenticator.device(),
            Arc::new(StaticPinProvider::new("4321")),
        );
        client.change_pin("5555").await.unwrap();
        assert_eq!(authenticator.pin().as_deref(), Some("5555"));
        assert_eq!(client.get_pin_retries().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn change_pin_with_wrong_current_pin() {
        init_tracing();
        let authenticator = MockAuthenticator::builder().pin("1234").build();
        let library = Library::default();
        let mut client = library.ctap_client_with_pin_provider(
            authenticator.device(),
            Arc::new(StaticPinProvider::new("0000")),
        );
        assert_eq!(
            client.change_pin("5555").await,
            Err(Error::UserVerification(UserVerificationError::WrongPin {
                retries_left: Some(7)
            }))
        );
        assert_eq!(authenticator.pin().as_deref(), Some("1234"));
    }
}
