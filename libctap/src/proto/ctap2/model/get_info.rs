use std::collections::BTreeMap;

use serde_cbor::Value;
use tracing::{debug, warn};

use super::{Ctap2CredentialType, Ctap2PinUvAuthProtocol, Ctap2UserVerificationOperation};
use crate::proto::ctap2::cbor::{
    as_array, as_bool, as_bytes, as_map, as_text, as_text_array, as_uint, as_uint_array,
    deserialize, serialize, CborMap, CborResponseModel,
};
use crate::transport::error::ProtocolError;

const DEFAULT_MIN_PIN_LENGTH: u32 = 4;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ctap2GetInfoResponse {
    /// versions (0x01)
    pub versions: Vec<String>,

    /// extensions (0x02)
    pub extensions: Option<Vec<String>>,

    /// aaguid (0x03)
    pub aaguid: Vec<u8>,

    /// options (0x04)
    pub options: Option<BTreeMap<String, bool>>,

    /// maxMsgSize (0x05)
    pub max_msg_size: Option<u32>,

    /// pinUvAuthProtocols (0x06), in the authenticator's order of preference
    pub pin_auth_protos: Option<Vec<u32>>,

    /// maxCredentialCountInList (0x07)
    pub max_credential_count: Option<u32>,

    /// maxCredentialIdLength (0x08)
    pub max_credential_id_length: Option<u32>,

    /// transports (0x09)
    pub transports: Option<Vec<String>>,

    /// algorithms (0x0A)
    pub algorithms: Option<Vec<Ctap2CredentialType>>,

    /// maxSerializedLargeBlobArray (0x0B)
    pub max_blob_array: Option<u32>,

    /// forcePINChange (0x0C)
    pub force_pin_change: Option<bool>,

    /// minPINLength (0x0D)
    pub min_pin_length: Option<u32>,

    /// firmwareVersion (0x0E)
    pub firmware_version: Option<u64>,

    /// maxCredBlobLength (0x0F)
    pub max_cred_blob_length: Option<u32>,

    /// maxRPIDsForSetMinPINLength (0x10)
    pub max_rpids_for_setminpinlength: Option<u32>,

    /// preferredPlatformUvAttempts (0x11)
    pub preferred_platform_uv_attempts: Option<u32>,

    /// uvModality (0x12)
    pub uv_modality: Option<u32>,

    /// certifications (0x13)
    pub certifications: Option<BTreeMap<String, u64>>,

    /// remainingDiscoverableCredentials (0x14)
    pub remaining_discoverable_creds: Option<u32>,

    /// vendorPrototypeConfigCommands (0x15)
    pub vendor_proto_config_cmds: Option<Vec<u64>>,

    /// Keys this implementation does not interpret, kept for re-encoding.
    pub residual: BTreeMap<Value, Value>,
}

fn as_options(value: Value, field: &str) -> Result<BTreeMap<String, bool>, ProtocolError> {
    as_map(value, field)?
        .into_iter()
        .map(|(k, v)| Ok((as_text(k, field)?, as_bool(v, field)?)))
        .collect()
}

fn as_certifications(value: Value, field: &str) -> Result<BTreeMap<String, u64>, ProtocolError> {
    as_map(value, field)?
        .into_iter()
        .map(|(k, v)| Ok((as_text(k, field)?, as_uint(v, field)?)))
        .collect()
}

/// Entries for credential types other than public-key are skipped.
fn as_algorithms(value: Value, field: &str) -> Result<Vec<Ctap2CredentialType>, ProtocolError> {
    let mut algorithms = vec![];
    for item in as_array(value, field)? {
        let entry = as_map(item, field)?;
        let public_key = Value::Text("public-key".into());
        if entry.get(&Value::Text("type".into())) != Some(&public_key) {
            debug!(?entry, "Skipping algorithm of an unknown credential type");
            continue;
        }
        algorithms.push(deserialize(Value::Map(entry), field)?);
    }
    Ok(algorithms)
}

fn text_array(items: &[String]) -> Value {
    Value::Array(items.iter().cloned().map(Value::Text).collect())
}

fn uint_array<T: Copy + Into<u64>>(items: &[T]) -> Value {
    Value::Array(
        items
            .iter()
            .map(|&item| Value::Integer(item.into() as i128))
            .collect(),
    )
}

fn uint<T: Into<u64>>(value: T) -> Value {
    Value::Integer(value.into() as i128)
}

impl CborResponseModel for Ctap2GetInfoResponse {
    fn from_cbor(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut map = CborMap::from_slice(data)?;
        Ok(Self {
            versions: map.required(0x01, "versions", as_text_array)?,
            extensions: map.optional(0x02, "extensions", as_text_array)?,
            aaguid: map.required(0x03, "aaguid", as_bytes)?,
            options: map.optional(0x04, "options", as_options)?,
            max_msg_size: map.optional(0x05, "maxMsgSize", as_uint)?,
            pin_auth_protos: map.optional(0x06, "pinUvAuthProtocols", as_uint_array)?,
            max_credential_count: map.optional(0x07, "maxCredentialCountInList", as_uint)?,
            max_credential_id_length: map.optional(0x08, "maxCredentialIdLength", as_uint)?,
            transports: map.optional(0x09, "transports", as_text_array)?,
            algorithms: map.optional(0x0A, "algorithms", as_algorithms)?,
            max_blob_array: map.optional(0x0B, "maxSerializedLargeBlobArray", as_uint)?,
            force_pin_change: map.optional(0x0C, "forcePINChange", as_bool)?,
            min_pin_length: map.optional(0x0D, "minPINLength", as_uint)?,
            firmware_version: map.optional(0x0E, "firmwareVersion", as_uint)?,
            max_cred_blob_length: map.optional(0x0F, "maxCredBlobLength", as_uint)?,
            max_rpids_for_setminpinlength: map.optional(
                0x10,
                "maxRPIDsForSetMinPINLength",
                as_uint,
            )?,
            preferred_platform_uv_attempts: map.optional(
                0x11,
                "preferredPlatformUvAttempts",
                as_uint,
            )?,
            uv_modality: map.optional(0x12, "uvModality", as_uint)?,
            certifications: map.optional(0x13, "certifications", as_certifications)?,
            remaining_discoverable_creds: map.optional(
                0x14,
                "remainingDiscoverableCredentials",
                as_uint,
            )?,
            vendor_proto_config_cmds: map.optional(
                0x15,
                "vendorPrototypeConfigCommands",
                as_uint_array,
            )?,
            residual: map.into_residual(),
        })
    }

    fn to_cbor(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut map = CborMap::new();
        map.insert(0x01, text_array(&self.versions));
        map.insert_opt(0x02, self.extensions.as_deref().map(text_array));
        map.insert(0x03, Value::Bytes(self.aaguid.clone()));
        map.insert_opt(
            0x04,
            self.options.as_ref().map(|options| {
                Value::Map(
                    options
                        .iter()
                        .map(|(k, v)| (Value::Text(k.clone()), Value::Bool(*v)))
                        .collect(),
                )
            }),
        );
        map.insert_opt(0x05, self.max_msg_size.map(uint));
        map.insert_opt(0x06, self.pin_auth_protos.as_deref().map(uint_array));
        map.insert_opt(0x07, self.max_credential_count.map(uint));
        map.insert_opt(0x08, self.max_credential_id_length.map(uint));
        map.insert_opt(0x09, self.transports.as_deref().map(text_array));
        if let Some(algorithms) = &self.algorithms {
            map.insert(0x0A, serialize(algorithms)?);
        }
        map.insert_opt(0x0B, self.max_blob_array.map(uint));
        map.insert_opt(0x0C, self.force_pin_change.map(Value::Bool));
        map.insert_opt(0x0D, self.min_pin_length.map(uint));
        map.insert_opt(0x0E, self.firmware_version.map(uint));
        map.insert_opt(0x0F, self.max_cred_blob_length.map(uint));
        map.insert_opt(0x10, self.max_rpids_for_setminpinlength.map(uint));
        map.insert_opt(0x11, self.preferred_platform_uv_attempts.map(uint));
        map.insert_opt(0x12, self.uv_modality.map(uint));
        map.insert_opt(
            0x13,
            self.certifications.as_ref().map(|certifications| {
                Value::Map(
                    certifications
                        .iter()
                        .map(|(k, v)| (Value::Text(k.clone()), uint(*v)))
                        .collect(),
                )
            }),
        );
        map.insert_opt(0x14, self.remaining_discoverable_creds.map(uint));
        map.insert_opt(0x15, self.vendor_proto_config_cmds.as_deref().map(uint_array));
        map.extend(&self.residual);
        map.to_vec()
    }
}

impl Ctap2GetInfoResponse {
    pub fn option_enabled(&self, name: &str) -> bool {
        self.options
            .as_ref()
            .map_or(false, |options| options.get(name) == Some(&true))
    }

    /// Whether the option is advertised at all, regardless of its value.
    pub fn option_present(&self, name: &str) -> bool {
        self.options
            .as_ref()
            .map_or(false, |options| options.contains_key(name))
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions
            .as_ref()
            .map_or(false, |extensions| extensions.iter().any(|e| e == name))
    }

    pub fn supports_fido_2_1(&self) -> bool {
        self.versions.iter().any(|v| v == "FIDO_2_1")
    }

    pub fn supports_credential_management(&self) -> bool {
        self.option_enabled("credMgmt") || self.option_enabled("credentialMgmtPreview")
    }

    /// Only the pre-standard preview command is available.
    pub fn uses_credential_management_preview(&self) -> bool {
        !self.option_enabled("credMgmt") && self.option_enabled("credentialMgmtPreview")
    }

    pub fn min_pin_length(&self) -> u32 {
        self.min_pin_length.unwrap_or(DEFAULT_MIN_PIN_LENGTH)
    }

    /// "Protected by some form of user verification": a PIN is set, or built-in UV is
    /// configured.
    pub fn is_uv_protected(&self) -> bool {
        self.option_enabled("uv") || self.option_enabled("clientPin")
    }

    /// First protocol in the authenticator's preference list that this library implements.
    pub fn preferred_pin_uv_auth_protocol(&self) -> Ctap2PinUvAuthProtocol {
        let Some(protocols) = &self.pin_auth_protos else {
            return Ctap2PinUvAuthProtocol::One;
        };
        protocols
            .iter()
            .find_map(|&version| match version {
                1 => Some(Ctap2PinUvAuthProtocol::One),
                2 => Some(Ctap2PinUvAuthProtocol::Two),
                _ => None,
            })
            .unwrap_or_else(|| {
                warn!(?protocols, "No supported PIN/UV auth protocol advertised, using version 1");
                Ctap2PinUvAuthProtocol::One
            })
    }

    pub fn uv_operation(&self, uv_blocked: bool) -> Option<Ctap2UserVerificationOperation> {
        if self.option_enabled("uv") && !uv_blocked {
            if self.option_enabled("pinUvAuthToken") {
                debug!("getPinUvAuthTokenUsingUvWithPermissions");
                return Some(
                    Ctap2UserVerificationOperation::GetPinUvAuthTokenUsingUvWithPermissions,
                );
            }
            debug!("Deprecated FIDO 2.0 behaviour: populating 'uv' flag");
            return Some(Ctap2UserVerificationOperation::DeprecatedUvOption);
        }

        if !self.option_enabled("clientPin") {
            debug!("No UV and no PIN (e.g. maybe UV was blocked and no PIN available)");
            return None;
        }
        if self.option_enabled("pinUvAuthToken") {
            debug!("getPinUvAuthTokenUsingPinWithPermissions");
            Some(Ctap2UserVerificationOperation::GetPinUvAuthTokenUsingPinWithPermissions)
        } else {
            debug!("getPinToken");
            Some(Ctap2UserVerificationOperation::GetPinToken)
        }
    }
}
