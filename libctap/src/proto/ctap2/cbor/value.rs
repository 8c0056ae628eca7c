use std::collections::BTreeMap;
use std::convert::TryFrom;

use serde::{de::DeserializeOwned, Serialize};
use serde_cbor::Value;
use tracing::error;

use crate::transport::error::ProtocolError;

/// A response body that is decoded field by field, keeping whatever it does not know about.
pub trait CborResponseModel: Sized {
    fn from_cbor(data: &[u8]) -> Result<Self, ProtocolError>;
    fn to_cbor(&self) -> Result<Vec<u8>, ProtocolError>;
}

/// Integer-keyed CBOR map, consumed key by key while decoding and filled key by key while
/// encoding. Whatever is left after decoding is the residual.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CborMap {
    entries: BTreeMap<Value, Value>,
}

impl CborMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_cbor::from_slice(data)?;
        Self::from_value(value, "response")
    }

    pub fn from_value(value: Value, field: &str) -> Result<Self, ProtocolError> {
        Ok(Self {
            entries: as_map(value, field)?,
        })
    }

    pub fn take(&mut self, key: i128) -> Option<Value> {
        self.entries.remove(&Value::Integer(key))
    }

    pub fn required<T, F>(&mut self, key: i128, field: &str, decode: F) -> Result<T, ProtocolError>
    where
        F: FnOnce(Value, &str) -> Result<T, ProtocolError>,
    {
        let Some(value) = self.take(key) else {
            error!({ key, field }, "Missing required field");
            return Err(ProtocolError::MissingField(field.to_owned()));
        };
        decode(value, field)
    }

    pub fn optional<T, F>(
        &mut self,
        key: i128,
        field: &str,
        decode: F,
    ) -> Result<Option<T>, ProtocolError>
    where
        F: FnOnce(Value, &str) -> Result<T, ProtocolError>,
    {
        self.take(key).map(|value| decode(value, field)).transpose()
    }

    pub fn insert(&mut self, key: i128, value: Value) {
        self.entries.insert(Value::Integer(key), value);
    }

    pub fn insert_opt(&mut self, key: i128, value: Option<Value>) {
        if let Some(value) = value {
            self.insert(key, value);
        }
    }

    pub fn extend(&mut self, residual: &BTreeMap<Value, Value>) {
        for (key, value) in residual {
            self.entries
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_residual(self) -> BTreeMap<Value, Value> {
        self.entries
    }

    pub fn into_value(self) -> Value {
        Value::Map(self.entries)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_cbor::to_vec(&self.entries)?)
    }
}

fn unexpected_type(field: &str, value: &Value) -> ProtocolError {
    error!(?value, field, "Unexpected CBOR type");
    ProtocolError::UnexpectedType(field.to_owned())
}

pub fn as_value(value: Value, _field: &str) -> Result<Value, ProtocolError> {
    Ok(value)
}

pub fn as_bytes(value: Value, field: &str) -> Result<Vec<u8>, ProtocolError> {
    match value {
        Value::Bytes(bytes) => Ok(bytes),
        other => Err(unexpected_type(field, &other)),
    }
}

pub fn as_text(value: Value, field: &str) -> Result<String, ProtocolError> {
    match value {
        Value::Text(text) => Ok(text),
        other => Err(unexpected_type(field, &other)),
    }
}

pub fn as_bool(value: Value, field: &str) -> Result<bool, ProtocolError> {
    match value {
        Value::Bool(flag) => Ok(flag),
        other => Err(unexpected_type(field, &other)),
    }
}

/// Unsigned integer that must fit `T`. Negative values are out of range too.
pub fn as_uint<T: TryFrom<u64>>(value: Value, field: &str) -> Result<T, ProtocolError> {
    let raw = match value {
        Value::Integer(raw) => raw,
        other => return Err(unexpected_type(field, &other)),
    };
    u64::try_from(raw)
        .ok()
        .and_then(|raw| T::try_from(raw).ok())
        .ok_or_else(|| {
            error!({ value = %raw, field }, "Integer out of range");
            ProtocolError::IntegerOverflow(field.to_owned())
        })
}

pub fn as_int<T: TryFrom<i128>>(value: Value, field: &str) -> Result<T, ProtocolError> {
    let raw = match value {
        Value::Integer(raw) => raw,
        other => return Err(unexpected_type(field, &other)),
    };
    T::try_from(raw).map_err(|_| {
        error!({ value = %raw, field }, "Integer out of range");
        ProtocolError::IntegerOverflow(field.to_owned())
    })
}

pub fn as_array(value: Value, field: &str) -> Result<Vec<Value>, ProtocolError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(unexpected_type(field, &other)),
    }
}

pub fn as_map(value: Value, field: &str) -> Result<BTreeMap<Value, Value>, ProtocolError> {
    match value {
        Value::Map(entries) => Ok(entries),
        other => Err(unexpected_type(field, &other)),
    }
}

pub fn as_text_array(value: Value, field: &str) -> Result<Vec<String>, ProtocolError> {
    as_array(value, field)?
        .into_iter()
        .map(|item| as_text(item, field))
        .collect()
}

pub fn as_uint_array<T: TryFrom<u64>>(value: Value, field: &str) -> Result<Vec<T>, ProtocolError> {
    as_array(value, field)?
        .into_iter()
        .map(|item| as_uint(item, field))
        .collect()
}

/// Falls back to serde for nested structures (entities, descriptors, attestation statements).
pub fn deserialize<T: DeserializeOwned>(value: Value, field: &str) -> Result<T, ProtocolError> {
    serde_cbor::value::from_value(value).map_err(|err| {
        error!(%err, field, "Failed to deserialize field");
        ProtocolError::UnexpectedType(field.to_owned())
    })
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    Ok(serde_cbor::value::to_value(value)?)
}
