use std::collections::BTreeMap;
use std::io::{Cursor as IOCursor, Read};

use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde_cbor::Value;
use tracing::{error, warn};

use crate::transport::error::ProtocolError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AuthenticatorDataFlags: u8 {
        const USER_PRESENT = 0x01;
        const USER_VERIFIED = 0x04;
        const BACKUP_ELIGIBLE = 0x08;
        const BACKED_UP = 0x10;
        const ATTESTED_CREDENTIALS = 0x40;
        const EXTENSION_DATA = 0x80;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttestedCredentialData {
    pub aaguid: [u8; 16],
    pub credential_id: Vec<u8>,
    /// COSE_Key, left uninterpreted.
    pub credential_public_key: Value,
}

/// https://www.w3.org/TR/webauthn/#sctn-authenticator-data
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatorData {
    pub rp_id_hash: [u8; 32],
    pub flags: AuthenticatorDataFlags,
    pub signature_count: u32,
    pub attested_credential: Option<AttestedCredentialData>,
    pub extensions: Option<BTreeMap<String, Value>>,
}

fn truncated<E>(_: E) -> ProtocolError {
    error!("Authenticator data is truncated");
    ProtocolError::InvalidAuthenticatorData("truncated")
}

/// Reads exactly one CBOR item from the front of `data`, returning it and its encoded length.
fn read_cbor_item(data: &[u8]) -> Result<(Value, usize), ProtocolError> {
    let mut stream = serde_cbor::Deserializer::from_slice(data).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Ok((value, stream.byte_offset())),
        Some(Err(err)) => {
            error!(%err, "Malformed CBOR in authenticator data");
            Err(ProtocolError::InvalidAuthenticatorData("malformed CBOR"))
        }
        None => Err(truncated(())),
    }
}

impl AuthenticatorData {
    pub fn from_slice(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = IOCursor::new(data);

        let mut rp_id_hash = [0u8; 32];
        cursor.read_exact(&mut rp_id_hash).map_err(truncated)?;
        let flags = AuthenticatorDataFlags::from_bits_retain(cursor.read_u8().map_err(truncated)?);
        let signature_count = cursor.read_u32::<BigEndian>().map_err(truncated)?;

        let attested_credential = if flags.contains(AuthenticatorDataFlags::ATTESTED_CREDENTIALS) {
            let mut aaguid = [0u8; 16];
            cursor.read_exact(&mut aaguid).map_err(truncated)?;
            let len = cursor.read_u16::<BigEndian>().map_err(truncated)? as usize;
            let mut credential_id = vec![0u8; len];
            cursor.read_exact(&mut credential_id).map_err(truncated)?;

            let offset = cursor.position() as usize;
            let (credential_public_key, consumed) = read_cbor_item(&data[offset..])?;
            cursor.set_position((offset + consumed) as u64);
            Some(AttestedCredentialData {
                aaguid,
                credential_id,
                credential_public_key,
            })
        } else {
            None
        };

        let extensions = if flags.contains(AuthenticatorDataFlags::EXTENSION_DATA) {
            let offset = cursor.position() as usize;
            let (value, consumed) = read_cbor_item(&data[offset..])?;
            cursor.set_position((offset + consumed) as u64);
            let Value::Map(entries) = value else {
                error!(?value, "Extension outputs are not a map");
                return Err(ProtocolError::InvalidAuthenticatorData("extensions are not a map"));
            };
            let mut extensions = BTreeMap::new();
            for (key, value) in entries {
                let Value::Text(name) = key else {
                    error!(?key, "Extension output with a non-text identifier");
                    return Err(ProtocolError::InvalidAuthenticatorData("non-text extension key"));
                };
                extensions.insert(name, value);
            }
            Some(extensions)
        } else {
            None
        };

        if (cursor.position() as usize) != data.len() {
            warn!(
                { parsed = cursor.position(), len = data.len() },
                "Trailing bytes after authenticator data"
            );
            return Err(ProtocolError::InvalidAuthenticatorData("trailing bytes"));
        }

        Ok(Self {
            rp_id_hash,
            flags,
            signature_count,
            attested_credential,
            extensions,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(37);
        out.extend_from_slice(&self.rp_id_hash);
        out.push(self.flags.bits());
        out.write_u32::<BigEndian>(self.signature_count)
            .map_err(|_| ProtocolError::InvalidAuthenticatorData("write failed"))?;

        if let Some(attested) = &self.attested_credential {
            let Ok(len) = u16::try_from(attested.credential_id.len()) else {
                return Err(ProtocolError::IntegerOverflow("credentialIdLength".into()));
            };
            out.extend_from_slice(&attested.aaguid);
            out.write_u16::<BigEndian>(len)
                .map_err(|_| ProtocolError::InvalidAuthenticatorData("write failed"))?;
            out.extend_from_slice(&attested.credential_id);
            out.extend(serde_cbor::to_vec(&attested.credential_public_key)?);
        }

        if let Some(extensions) = &self.extensions {
            let entries: BTreeMap<Value, Value> = extensions
                .iter()
                .map(|(name, value)| (Value::Text(name.clone()), value.clone()))
                .collect();
            out.extend(serde_cbor::to_vec(&entries)?);
        }
        Ok(out)
    }

    pub fn user_present(&self) -> bool {
        self.flags.contains(AuthenticatorDataFlags::USER_PRESENT)
    }

    pub fn user_verified(&self) -> bool {
        self.flags.contains(AuthenticatorDataFlags::USER_VERIFIED)
    }

    pub fn credential_id(&self) -> Option<&[u8]> {
        self.attested_credential
            .as_ref()
            .map(|attested| attested.credential_id.as_slice())
    }

    pub fn extension(&self, name: &str) -> Option<&Value> {
        self.extensions.as_ref()?.get(name)
    }
}
