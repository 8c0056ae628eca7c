//! Test doubles: a scripted spy device and an in-memory authenticator.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt::{self, Display};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_bytes::ByteBuf;
use serde_cbor::Value;
use tracing_subscriber::EnvFilter;

use crate::crypto::{CryptoProvider, EcKeyPair, RustCryptoProvider};
use crate::fido::{AttestedCredentialData, AuthenticatorData, AuthenticatorDataFlags};
use crate::pin::{cose_key_from_ec, ec_from_cose_value, pin_hash, PinUvAuthProtocol};
use crate::proto::ctap2::cbor::CborResponseModel;
use crate::proto::ctap2::{
    Ctap2AttestationStatement, Ctap2ClientPinResponse, Ctap2CredentialManagementParams,
    Ctap2CredentialManagementRequest, Ctap2CredentialManagementResponse,
    Ctap2CredentialManagementSubcommand, Ctap2GetAssertionResponse, Ctap2GetInfoResponse,
    Ctap2MakeCredentialResponse, Ctap2PinUvAuthProtocol, Ctap2PublicKeyCredentialDescriptor,
    Ctap2PublicKeyCredentialRpEntity, Ctap2PublicKeyCredentialUserEntity,
};
use crate::transport::error::{CtapError, TransportError};
use crate::transport::{AuthenticatorDevice, TransportKind};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Replies with canned responses, in order, and records what it was sent.
pub(crate) struct SpyDevice {
    name: String,
    transports: HashSet<TransportKind>,
    replies: Mutex<VecDeque<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl SpyDevice {
    pub fn new(name: &str, transports: &[TransportKind], replies: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.to_owned(),
            transports: transports.iter().copied().collect(),
            replies: Mutex::new(replies.into()),
            sent: Mutex::new(vec![]),
        }
    }

    /// Command bytes of every message sent so far.
    pub fn commands(&self) -> Vec<u8> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|message| message.first().copied())
            .collect()
    }
}

impl Display for SpyDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[async_trait]
impl AuthenticatorDevice for SpyDevice {
    async fn send(&self, message: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.sent.lock().unwrap().push(message.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError::ConnectionLost)
    }

    fn transports(&self) -> HashSet<TransportKind> {
        self.transports.clone()
    }
}

const DEFAULT_PIN_RETRIES: u32 = 8;
const MAX_RESIDENT_CREDENTIALS: u32 = 25;
const CRED_RANDOM: [u8; 32] = [0x5A; 32];

struct StoredCredential {
    rp: Ctap2PublicKeyCredentialRpEntity,
    user: Ctap2PublicKeyCredentialUserEntity,
    id: Vec<u8>,
    public_key: Value,
    blob: Option<Vec<u8>>,
    resident: bool,
}

/// A failed command: status plus optional body.
struct Failure(CtapError, Option<Vec<u8>>);

impl From<CtapError> for Failure {
    fn from(status: CtapError) -> Self {
        Failure(status, None)
    }
}

type Reply = Result<Option<Vec<u8>>, Failure>;

struct MockState {
    crypto: Arc<dyn CryptoProvider>,
    key_agreement_key: EcKeyPair,
    protocols: Vec<u32>,
    extensions: Vec<String>,
    confirm_cred_blob: bool,
    credential_management: bool,
    credential_management_preview: bool,
    built_in_uv: bool,
    uv_blocked: bool,

    pin: Option<String>,
    pin_retries: u32,
    token: Option<Vec<u8>>,
    credentials: Vec<StoredCredential>,
    pending: VecDeque<Vec<u8>>,

    commands: Vec<u8>,
    key_agreements: usize,
    last_extensions: Option<BTreeMap<Value, Value>>,
    last_pin_uv_auth_protocol: Option<u32>,
}

fn field(params: &BTreeMap<Value, Value>, key: i128) -> Option<&Value> {
    params.get(&Value::Integer(key))
}

fn int_field(params: &BTreeMap<Value, Value>, key: i128) -> Option<i128> {
    match field(params, key) {
        Some(Value::Integer(n)) => Some(*n),
        _ => None,
    }
}

fn bytes_field(params: &BTreeMap<Value, Value>, key: i128) -> Option<Vec<u8>> {
    match field(params, key) {
        Some(Value::Bytes(bytes)) => Some(bytes.clone()),
        _ => None,
    }
}

fn typed_field<T: serde::de::DeserializeOwned>(
    params: &BTreeMap<Value, Value>,
    key: i128,
) -> Result<T, Failure> {
    let value = field(params, key).ok_or(CtapError::MissingParameter)?;
    serde_cbor::value::from_value(value.clone()).map_err(|_| CtapError::InvalidCbor.into())
}

fn encode<T: CborResponseModel>(response: &T) -> Reply {
    Ok(Some(response.to_cbor().unwrap()))
}

impl MockState {
    fn protocol(&self, version: Option<i128>) -> Result<Box<dyn PinUvAuthProtocol>, Failure> {
        let version = u32::try_from(version.unwrap_or(1)).map_err(|_| CtapError::InvalidParameter)?;
        if !self.protocols.contains(&version) {
            return Err(CtapError::InvalidParameter.into());
        }
        let version =
            Ctap2PinUvAuthProtocol::try_from(version).map_err(|_| CtapError::InvalidParameter)?;
        Ok(version.create_protocol_object(self.crypto.clone()))
    }

    /// The authenticator side of the key agreement.
    fn shared_secret(
        &self,
        protocol: &dyn PinUvAuthProtocol,
        platform_key: Option<&Value>,
    ) -> Result<Vec<u8>, Failure> {
        let platform_key = platform_key.ok_or(CtapError::MissingParameter)?;
        let peer = ec_from_cose_value(platform_key).map_err(|_| CtapError::InvalidParameter)?;
        let z = self
            .crypto
            .ecdh(&self.key_agreement_key.private_key, &peer)
            .map_err(|_| CtapError::InvalidParameter)?;
        protocol.kdf(&z).map_err(|_| CtapError::Other.into())
    }

    fn wrong_pin(&mut self) -> Failure {
        self.pin_retries = self.pin_retries.saturating_sub(1);
        let body = Ctap2ClientPinResponse {
            pin_retries: Some(self.pin_retries),
            ..Default::default()
        };
        Failure(CtapError::PINInvalid, Some(body.to_cbor().unwrap()))
    }

    fn check_pin_hash(
        &mut self,
        protocol: &dyn PinUvAuthProtocol,
        shared: &[u8],
        pin_hash_enc: Option<Vec<u8>>,
    ) -> Result<(), Failure> {
        let Some(pin) = self.pin.clone() else {
            return Err(CtapError::PINNotSet.into());
        };
        if self.pin_retries == 0 {
            return Err(CtapError::PINBlocked.into());
        }
        let pin_hash_enc = pin_hash_enc.ok_or(CtapError::MissingParameter)?;
        let presented = protocol
            .decrypt(shared, &pin_hash_enc)
            .map_err(|_| CtapError::InvalidParameter)?;
        if presented != pin_hash(self.crypto.as_ref(), &pin) {
            return Err(self.wrong_pin());
        }
        self.pin_retries = DEFAULT_PIN_RETRIES;
        Ok(())
    }

    fn issue_token(&mut self, protocol: &dyn PinUvAuthProtocol, shared: &[u8]) -> Reply {
        let token = self.crypto.random_bytes(32);
        let encrypted = protocol
            .encrypt(shared, &token)
            .map_err(|_| CtapError::Other)?;
        self.token = Some(token);
        encode(&Ctap2ClientPinResponse {
            pin_uv_auth_token: Some(encrypted),
            ..Default::default()
        })
    }

    /// Verifies a pinUvAuthParam against the current token.
    fn verify_auth_param(
        &self,
        version: Option<i128>,
        param: Option<Vec<u8>>,
        message: &[u8],
    ) -> Result<bool, Failure> {
        let Some(param) = param else {
            return Ok(false);
        };
        let protocol = self.protocol(version)?;
        let token = self.token.as_ref().ok_or(CtapError::PINAuthInvalid)?;
        let expected = protocol
            .authenticate(token, message)
            .map_err(|_| CtapError::Other)?;
        if expected != param {
            return Err(CtapError::PINAuthInvalid.into());
        }
        Ok(true)
    }

    fn handle(&mut self, message: &[u8]) -> Vec<u8> {
        let Some((&command, body)) = message.split_first() else {
            return vec![CtapError::InvalidLength.into()];
        };
        self.commands.push(command);
        let params: BTreeMap<Value, Value> = if body.is_empty() {
            BTreeMap::new()
        } else {
            match serde_cbor::from_slice(body) {
                Ok(params) => params,
                Err(_) => return vec![CtapError::InvalidCbor.into()],
            }
        };

        let reply = match command {
            0x01 => self.make_credential(&params),
            0x02 => self.get_assertion(&params),
            0x04 => self.get_info(),
            0x06 => self.client_pin(&params),
            0x08 => self.get_next_assertion(),
            0x0A if self.credential_management => self.credential_management(&params),
            0x41 if self.credential_management_preview => self.credential_management(&params),
            0x0B => Ok(None),
            _ => Err(CtapError::InvalidCommand.into()),
        };
        let (status, body) = match reply {
            Ok(body) => (CtapError::Ok, body),
            Err(Failure(status, body)) => (status, body),
        };
        let mut response = vec![status.into()];
        response.extend(body.unwrap_or_default());
        response
    }

    fn get_info(&mut self) -> Reply {
        let mut options = BTreeMap::new();
        options.insert("rk".to_string(), true);
        options.insert("up".to_string(), true);
        options.insert("clientPin".to_string(), self.pin.is_some());
        if self.built_in_uv {
            options.insert("uv".to_string(), true);
        }
        if self.credential_management_preview && !self.credential_management {
            options.insert("credentialMgmtPreview".to_string(), true);
        } else {
            options.insert("pinUvAuthToken".to_string(), true);
            options.insert("credMgmt".to_string(), self.credential_management);
        }
        encode(&Ctap2GetInfoResponse {
            versions: vec!["FIDO_2_0".into(), "FIDO_2_1".into()],
            extensions: Some(self.extensions.clone()),
            aaguid: vec![0; 16],
            options: Some(options),
            max_msg_size: Some(1200),
            max_cred_blob_length: Some(32),
            pin_auth_protos: Some(self.protocols.clone()),
            ..Default::default()
        })
    }

    fn client_pin(&mut self, params: &BTreeMap<Value, Value>) -> Reply {
        let version = int_field(params, 0x01);
        match int_field(params, 0x02) {
            // getPinRetries
            Some(0x01) => encode(&Ctap2ClientPinResponse {
                pin_retries: Some(self.pin_retries),
                ..Default::default()
            }),
            // getKeyAgreement
            Some(0x02) => {
                self.protocol(version)?;
                self.key_agreements += 1;
                encode(&Ctap2ClientPinResponse {
                    key_agreement: Some(self.key_agreement_key.public_key.clone()),
                    ..Default::default()
                })
            }
            // setPin
            Some(0x03) => {
                if self.pin.is_some() {
                    return Err(CtapError::NotAllowed.into());
                }
                let protocol = self.protocol(version)?;
                let shared = self.shared_secret(protocol.as_ref(), field(params, 0x03))?;
                let new_pin_enc = bytes_field(params, 0x05).ok_or(CtapError::MissingParameter)?;
                let param = bytes_field(params, 0x04).ok_or(CtapError::MissingParameter)?;
                if protocol.authenticate(&shared, &new_pin_enc).ok() != Some(param) {
                    return Err(CtapError::PINAuthInvalid.into());
                }
                self.pin = Some(decrypt_pin(protocol.as_ref(), &shared, &new_pin_enc)?);
                self.pin_retries = DEFAULT_PIN_RETRIES;
                Ok(None)
            }
            // changePin
            Some(0x04) => {
                let protocol = self.protocol(version)?;
                let shared = self.shared_secret(protocol.as_ref(), field(params, 0x03))?;
                let new_pin_enc = bytes_field(params, 0x05).ok_or(CtapError::MissingParameter)?;
                let pin_hash_enc = bytes_field(params, 0x06).ok_or(CtapError::MissingParameter)?;
                let param = bytes_field(params, 0x04).ok_or(CtapError::MissingParameter)?;
                let message = [new_pin_enc.as_slice(), pin_hash_enc.as_slice()].concat();
                if protocol.authenticate(&shared, &message).ok() != Some(param) {
                    return Err(CtapError::PINAuthInvalid.into());
                }
                self.check_pin_hash(protocol.as_ref(), &shared, Some(pin_hash_enc))?;
                self.pin = Some(decrypt_pin(protocol.as_ref(), &shared, &new_pin_enc)?);
                Ok(None)
            }
            // getPinToken, getPinUvAuthTokenUsingPinWithPermissions
            Some(0x05) | Some(0x09) => {
                let protocol = self.protocol(version)?;
                let shared = self.shared_secret(protocol.as_ref(), field(params, 0x03))?;
                self.check_pin_hash(protocol.as_ref(), &shared, bytes_field(params, 0x06))?;
                self.issue_token(protocol.as_ref(), &shared)
            }
            // getPinUvAuthTokenUsingUvWithPermissions
            Some(0x06) => {
                if !self.built_in_uv {
                    return Err(CtapError::InvalidSubcommand.into());
                }
                if self.uv_blocked {
                    return Err(CtapError::UvBlocked.into());
                }
                let protocol = self.protocol(version)?;
                let shared = self.shared_secret(protocol.as_ref(), field(params, 0x03))?;
                self.issue_token(protocol.as_ref(), &shared)
            }
            _ => Err(CtapError::InvalidSubcommand.into()),
        }
    }

    fn make_credential(&mut self, params: &BTreeMap<Value, Value>) -> Reply {
        let hash = bytes_field(params, 0x01).ok_or(CtapError::MissingParameter)?;
        let rp: Ctap2PublicKeyCredentialRpEntity = typed_field(params, 0x02)?;
        let user: Ctap2PublicKeyCredentialUserEntity = typed_field(params, 0x03)?;
        let inputs = match field(params, 0x06) {
            Some(Value::Map(inputs)) => Some(inputs.clone()),
            _ => None,
        };
        self.last_extensions = inputs.clone();
        self.last_pin_uv_auth_protocol =
            int_field(params, 0x09).and_then(|v| u32::try_from(v).ok());

        let uv = self.verify_auth_param(int_field(params, 0x09), bytes_field(params, 0x08), &hash)?;
        if !uv && self.pin.is_some() {
            return Err(CtapError::PINRequired.into());
        }

        if let Some(Value::Array(exclude)) = field(params, 0x05) {
            for descriptor in exclude {
                let descriptor: Ctap2PublicKeyCredentialDescriptor =
                    serde_cbor::value::from_value(descriptor.clone())
                        .map_err(|_| CtapError::InvalidCbor)?;
                if self
                    .credentials
                    .iter()
                    .any(|c| c.rp.id == rp.id && c.id == descriptor.id.as_slice())
                {
                    return Err(CtapError::CredentialExcluded.into());
                }
            }
        }

        let resident = match field(params, 0x07) {
            Some(Value::Map(options)) => {
                options.get(&Value::Text("rk".into())) == Some(&Value::Bool(true))
            }
            _ => false,
        };
        let input = |name: &str| {
            inputs
                .as_ref()
                .and_then(|inputs| inputs.get(&Value::Text(name.into())))
                .filter(|_| self.extensions.iter().any(|e| e == name))
                .cloned()
        };

        let mut outputs = BTreeMap::new();
        let blob = match input("credBlob") {
            Some(Value::Bytes(blob)) => {
                if self.confirm_cred_blob {
                    outputs.insert("credBlob".to_string(), Value::Bool(true));
                }
                Some(blob)
            }
            _ => None,
        };
        if let Some(Value::Integer(level)) = input("credProtect") {
            outputs.insert("credProtect".to_string(), Value::Integer(level));
        }
        if input("hmac-secret") == Some(Value::Bool(true)) {
            outputs.insert("hmac-secret".to_string(), Value::Bool(true));
        }
        if input("uvm").is_some() {
            outputs.insert("uvm".to_string(), uvm_output());
        }

        let credential_key = self.crypto.generate_key_pair().unwrap().public_key;
        let public_key =
            serde_cbor::value::to_value(cose_key_from_ec(&credential_key).unwrap()).unwrap();
        let id = self.crypto.random_bytes(16);

        let mut flags =
            AuthenticatorDataFlags::USER_PRESENT | AuthenticatorDataFlags::ATTESTED_CREDENTIALS;
        if uv {
            flags |= AuthenticatorDataFlags::USER_VERIFIED;
        }
        if !outputs.is_empty() {
            flags |= AuthenticatorDataFlags::EXTENSION_DATA;
        }
        let authenticator_data = AuthenticatorData {
            rp_id_hash: self.rp_id_hash(&rp.id),
            flags,
            signature_count: 0,
            attested_credential: Some(AttestedCredentialData {
                aaguid: [0; 16],
                credential_id: id.clone(),
                credential_public_key: public_key.clone(),
            }),
            extensions: (!outputs.is_empty()).then_some(outputs),
        };

        self.credentials.push(StoredCredential {
            rp,
            user,
            id,
            public_key,
            blob,
            resident,
        });

        encode(&Ctap2MakeCredentialResponse {
            format: "none".into(),
            authenticator_data,
            attestation_statement: Ctap2AttestationStatement::None,
            enterprise_attestation: None,
            large_blob_key: None,
            unsigned_extension_outputs: None,
            residual: BTreeMap::new(),
        })
    }

    fn get_assertion(&mut self, params: &BTreeMap<Value, Value>) -> Reply {
        let rp_id = match field(params, 0x01) {
            Some(Value::Text(rp_id)) => rp_id.clone(),
            _ => return Err(CtapError::MissingParameter.into()),
        };
        let hash = bytes_field(params, 0x02).ok_or(CtapError::MissingParameter)?;
        let inputs = match field(params, 0x04) {
            Some(Value::Map(inputs)) => Some(inputs.clone()),
            _ => None,
        };
        self.last_extensions = inputs.clone();
        self.last_pin_uv_auth_protocol =
            int_field(params, 0x07).and_then(|v| u32::try_from(v).ok());
        let uv = self.verify_auth_param(int_field(params, 0x07), bytes_field(params, 0x06), &hash)?;

        let allow: Vec<Ctap2PublicKeyCredentialDescriptor> = match field(params, 0x03) {
            Some(value) => {
                serde_cbor::value::from_value(value.clone()).map_err(|_| CtapError::InvalidCbor)?
            }
            None => vec![],
        };
        let matching: Vec<&StoredCredential> = self
            .credentials
            .iter()
            .filter(|c| c.rp.id == rp_id)
            .filter(|c| {
                if allow.is_empty() {
                    c.resident
                } else {
                    allow.iter().any(|d| d.id.as_slice() == c.id)
                }
            })
            .collect();
        if matching.is_empty() {
            return Err(CtapError::NoCredentials.into());
        }

        let input = |name: &str| {
            inputs
                .as_ref()
                .and_then(|inputs| inputs.get(&Value::Text(name.into())))
                .filter(|_| self.extensions.iter().any(|e| e == name))
                .cloned()
        };
        let hmac_output = match input("hmac-secret") {
            Some(Value::Map(hmac_input)) => Some(self.hmac_secret(&hmac_input)?),
            _ => None,
        };

        let count = matching.len() as u32;
        let mut replies = VecDeque::new();
        for (index, credential) in matching.iter().enumerate() {
            let mut outputs = BTreeMap::new();
            if input("credBlob") == Some(Value::Bool(true)) {
                outputs.insert(
                    "credBlob".to_string(),
                    Value::Bytes(credential.blob.clone().unwrap_or_default()),
                );
            }
            if let Some(output) = &hmac_output {
                outputs.insert("hmac-secret".to_string(), Value::Bytes(output.clone()));
            }
            if input("uvm").is_some() {
                outputs.insert("uvm".to_string(), uvm_output());
            }

            let mut flags = AuthenticatorDataFlags::USER_PRESENT;
            if uv {
                flags |= AuthenticatorDataFlags::USER_VERIFIED;
            }
            if !outputs.is_empty() {
                flags |= AuthenticatorDataFlags::EXTENSION_DATA;
            }
            let assertion = Ctap2GetAssertionResponse {
                credential_id: Some(Ctap2PublicKeyCredentialDescriptor::new(&credential.id)),
                authenticator_data: AuthenticatorData {
                    rp_id_hash: self.rp_id_hash(&rp_id),
                    flags,
                    signature_count: 1,
                    attested_credential: None,
                    extensions: (!outputs.is_empty()).then_some(outputs),
                },
                signature: vec![0x30; 70],
                user: credential.resident.then(|| credential.user.clone()),
                credentials_count: (index == 0).then_some(count),
                user_selected: None,
                large_blob_key: None,
                unsigned_extension_outputs: None,
                residual: BTreeMap::new(),
            };
            replies.push_back(assertion.to_cbor().unwrap());
        }

        let first = replies.pop_front();
        self.pending = replies;
        Ok(first)
    }

    fn get_next_assertion(&mut self) -> Reply {
        match self.pending.pop_front() {
            Some(reply) => Ok(Some(reply)),
            None => Err(CtapError::NotAllowed.into()),
        }
    }

    fn hmac_secret(&self, input: &BTreeMap<Value, Value>) -> Result<Vec<u8>, Failure> {
        let protocol = self.protocol(int_field(input, 0x04))?;
        let shared = self.shared_secret(protocol.as_ref(), field(input, 0x01))?;
        let salt_enc = bytes_field(input, 0x02).ok_or(CtapError::MissingParameter)?;
        let salt_auth = bytes_field(input, 0x03).ok_or(CtapError::MissingParameter)?;
        if protocol.authenticate(&shared, &salt_enc).ok() != Some(salt_auth) {
            return Err(CtapError::InvalidParameter.into());
        }
        let salts = protocol
            .decrypt(&shared, &salt_enc)
            .map_err(|_| CtapError::InvalidParameter)?;
        let mut outputs = vec![];
        for salt in salts.chunks(32) {
            outputs.extend(self.crypto.hmac_sha256(&CRED_RANDOM, salt).unwrap());
        }
        protocol
            .encrypt(&shared, &outputs)
            .map_err(|_| CtapError::Other.into())
    }

    fn credential_management(&mut self, params: &BTreeMap<Value, Value>) -> Reply {
        let subcommand: Ctap2CredentialManagementSubcommand = typed_field(params, 0x01)?;
        let subcommand_params = match field(params, 0x02) {
            Some(Value::Map(map)) => Some(Ctap2CredentialManagementParams {
                rpid_hash: bytes_field(map, 0x01).map(ByteBuf::from),
                credential_id: typed_field(map, 0x02).ok(),
                user: typed_field(map, 0x03).ok(),
            }),
            _ => None,
        };
        let request = Ctap2CredentialManagementRequest {
            subcommand,
            subcommand_params: subcommand_params.clone(),
            protocol: None,
            uv_auth_param: None,
            use_legacy_preview: false,
        };
        if subcommand.requires_auth() {
            let message = request.auth_message().map_err(|_| CtapError::Other)?;
            let protocol = int_field(params, 0x03);
            let verified = self.verify_auth_param(protocol, bytes_field(params, 0x04), &message)?;
            if !verified {
                return Err(CtapError::PINRequired.into());
            }
        }

        let resident: Vec<usize> = (0..self.credentials.len())
            .filter(|&i| self.credentials[i].resident)
            .collect();
        match subcommand {
            Ctap2CredentialManagementSubcommand::GetCredsMetadata => {
                let existing = resident.len() as u32;
                encode(&Ctap2CredentialManagementResponse {
                    existing_resident_credentials_count: Some(existing),
                    max_possible_remaining_resident_credentials_count: Some(
                        MAX_RESIDENT_CREDENTIALS - existing,
                    ),
                    ..Default::default()
                })
            }
            Ctap2CredentialManagementSubcommand::EnumerateRPsBegin => {
                let mut rps: Vec<Ctap2PublicKeyCredentialRpEntity> = vec![];
                for &i in &resident {
                    let rp = &self.credentials[i].rp;
                    if !rps.iter().any(|seen| seen.id == rp.id) {
                        rps.push(rp.clone());
                    }
                }
                if rps.is_empty() {
                    return Err(CtapError::NoCredentials.into());
                }
                let total = rps.len() as u32;
                let mut replies: VecDeque<Vec<u8>> = rps
                    .into_iter()
                    .enumerate()
                    .map(|(index, rp)| {
                        Ctap2CredentialManagementResponse {
                            rp_id_hash: Some(self.rp_id_hash(&rp.id).to_vec()),
                            rp: Some(rp),
                            total_rps: (index == 0).then_some(total),
                            ..Default::default()
                        }
                        .to_cbor()
                        .unwrap()
                    })
                    .collect();
                let first = replies.pop_front();
                self.pending = replies;
                Ok(first)
            }
            Ctap2CredentialManagementSubcommand::EnumerateCredentialsBegin => {
                let rp_id_hash = subcommand_params
                    .and_then(|p| p.rpid_hash)
                    .ok_or(CtapError::MissingParameter)?;
                let matching: Vec<&StoredCredential> = resident
                    .iter()
                    .map(|&i| &self.credentials[i])
                    .filter(|c| self.rp_id_hash(&c.rp.id)[..] == rp_id_hash[..])
                    .collect();
                if matching.is_empty() {
                    return Err(CtapError::NoCredentials.into());
                }
                let total = matching.len() as u32;
                let mut replies: VecDeque<Vec<u8>> = matching
                    .iter()
                    .enumerate()
                    .map(|(index, c)| {
                        Ctap2CredentialManagementResponse {
                            user: Some(c.user.clone()),
                            credential_id: Some(Ctap2PublicKeyCredentialDescriptor::new(&c.id)),
                            public_key: Some(c.public_key.clone()),
                            total_credentials: (index == 0).then_some(total),
                            cred_protect: Some(1),
                            ..Default::default()
                        }
                        .to_cbor()
                        .unwrap()
                    })
                    .collect();
                let first = replies.pop_front();
                self.pending = replies;
                Ok(first)
            }
            Ctap2CredentialManagementSubcommand::EnumerateRPsGetNextRP
            | Ctap2CredentialManagementSubcommand::EnumerateCredentialsGetNextCredential => {
                self.get_next_assertion()
            }
            Ctap2CredentialManagementSubcommand::DeleteCredential => {
                let id = subcommand_params
                    .and_then(|p| p.credential_id)
                    .ok_or(CtapError::MissingParameter)?;
                let before = self.credentials.len();
                self.credentials.retain(|c| c.id != id.id.as_slice());
                if self.credentials.len() == before {
                    return Err(CtapError::NoCredentials.into());
                }
                Ok(None)
            }
            Ctap2CredentialManagementSubcommand::UpdateUserInformation => {
                let params = subcommand_params.ok_or(CtapError::MissingParameter)?;
                let (Some(id), Some(user)) = (params.credential_id, params.user) else {
                    return Err(CtapError::MissingParameter.into());
                };
                let credential = self
                    .credentials
                    .iter_mut()
                    .find(|c| c.id == id.id.as_slice())
                    .ok_or(CtapError::NoCredentials)?;
                credential.user = user;
                Ok(None)
            }
        }
    }

    fn rp_id_hash(&self, rp_id: &str) -> [u8; 32] {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&self.crypto.sha256(rp_id.as_bytes()));
        hash
    }
}

fn decrypt_pin(
    protocol: &dyn PinUvAuthProtocol,
    shared: &[u8],
    new_pin_enc: &[u8],
) -> Result<String, Failure> {
    let padded = protocol
        .decrypt(shared, new_pin_enc)
        .map_err(|_| CtapError::InvalidParameter)?;
    if padded.len() != 64 {
        return Err(CtapError::PINPolicyViolation.into());
    }
    let pin: Vec<u8> = padded.into_iter().take_while(|&b| b != 0).collect();
    String::from_utf8(pin).map_err(|_| CtapError::PINPolicyViolation.into())
}

fn uvm_output() -> Value {
    // Fingerprint, software key protection, TEE matcher.
    Value::Array(vec![Value::Array(vec![
        Value::Integer(2),
        Value::Integer(1),
        Value::Integer(2),
    ])])
}

struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl Display for MockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("mock authenticator")
    }
}

#[async_trait]
impl AuthenticatorDevice for MockDevice {
    async fn send(&self, message: &[u8]) -> Result<Vec<u8>, TransportError> {
        Ok(self.state.lock().unwrap().handle(message))
    }

    fn transports(&self) -> HashSet<TransportKind> {
        [TransportKind::Usb].into_iter().collect()
    }
}

/// An authenticator implemented in memory, speaking CTAP2 over [`AuthenticatorDevice`].
pub(crate) struct MockAuthenticator {
    state: Arc<Mutex<MockState>>,
}

pub(crate) struct MockAuthenticatorBuilder {
    protocols: Vec<u32>,
    pin: Option<String>,
    extensions: Vec<String>,
    confirm_cred_blob: bool,
    credential_management: bool,
    credential_management_preview: bool,
    built_in_uv: bool,
    uv_blocked: bool,
}

impl MockAuthenticatorBuilder {
    pub fn protocols(mut self, protocols: &[u32]) -> Self {
        self.protocols = protocols.to_vec();
        self
    }

    pub fn pin(mut self, pin: &str) -> Self {
        self.pin = Some(pin.to_owned());
        self
    }

    pub fn extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn confirm_cred_blob(mut self, confirm: bool) -> Self {
        self.confirm_cred_blob = confirm;
        self
    }

    pub fn credential_management(mut self, enabled: bool) -> Self {
        self.credential_management = enabled;
        self
    }

    pub fn credential_management_preview(mut self, enabled: bool) -> Self {
        self.credential_management_preview = enabled;
        self
    }

    pub fn built_in_uv(mut self, enabled: bool) -> Self {
        self.built_in_uv = enabled;
        self
    }

    pub fn uv_blocked(mut self, blocked: bool) -> Self {
        self.uv_blocked = blocked;
        self
    }

    pub fn build(self) -> MockAuthenticator {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(RustCryptoProvider::new());
        let key_agreement_key = crypto.generate_key_pair().unwrap();
        let state = MockState {
            crypto,
            key_agreement_key,
            protocols: self.protocols,
            extensions: self.extensions,
            confirm_cred_blob: self.confirm_cred_blob,
            credential_management: self.credential_management,
            credential_management_preview: self.credential_management_preview,
            built_in_uv: self.built_in_uv,
            uv_blocked: self.uv_blocked,
            pin: self.pin,
            pin_retries: DEFAULT_PIN_RETRIES,
            token: None,
            credentials: vec![],
            pending: VecDeque::new(),
            commands: vec![],
            key_agreements: 0,
            last_extensions: None,
            last_pin_uv_auth_protocol: None,
        };
        MockAuthenticator {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

impl MockAuthenticator {
    pub fn builder() -> MockAuthenticatorBuilder {
        MockAuthenticatorBuilder {
            protocols: vec![2, 1],
            pin: None,
            extensions: vec![],
            confirm_cred_blob: true,
            credential_management: false,
            credential_management_preview: false,
            built_in_uv: false,
            uv_blocked: false,
        }
    }

    pub fn device(&self) -> Arc<dyn AuthenticatorDevice> {
        Arc::new(MockDevice {
            state: self.state.clone(),
        })
    }

    pub fn pin(&self) -> Option<String> {
        self.state.lock().unwrap().pin.clone()
    }

    pub fn commands(&self) -> Vec<u8> {
        self.state.lock().unwrap().commands.clone()
    }

    /// How many getKeyAgreement commands were answered.
    pub fn key_agreements(&self) -> usize {
        self.state.lock().unwrap().key_agreements
    }

    pub fn last_extension_input(&self, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .last_extensions
            .as_ref()
            .and_then(|inputs| inputs.get(&Value::Text(name.into())).cloned())
    }

    pub fn last_pin_uv_auth_protocol(&self) -> Option<u32> {
        self.state.lock().unwrap().last_pin_uv_auth_protocol
    }

    /// A getKeyAgreement response body carrying this authenticator's key.
    pub fn key_agreement_reply(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        Ctap2ClientPinResponse {
            key_agreement: Some(state.key_agreement_key.public_key.clone()),
            ..Default::default()
        }
        .to_cbor()
        .unwrap()
    }

    /// hmac-secret output for one salt.
    pub fn hmac_output(&self, salt: &[u8; 32]) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state.crypto.hmac_sha256(&CRED_RANDOM, salt).unwrap()
    }
}
