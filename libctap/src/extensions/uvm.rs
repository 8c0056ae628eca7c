use serde_cbor::Value;
use tracing::error;

use super::{
    Extension, ExtensionContext, ExtensionParameter, ExtensionParameterKind,
    ExtensionRegistration,
};
use crate::transport::error::{Error, ProtocolError};

pub const NAME: &str = "uvm";

pub fn registration() -> ExtensionRegistration {
    ExtensionRegistration::new(
        NAME,
        ExtensionParameterKind::Array,
        ExtensionParameterKind::Array,
    )
}

/// One user verification method the authenticator reports having used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UvmEntry {
    pub user_verification_method: u32,
    pub key_protection_type: u16,
    pub matcher_protection_type: u16,
}

#[derive(Debug, Default, Clone)]
pub struct UvmExtension {
    entries: Vec<UvmEntry>,
    assertion_entries: Vec<Vec<UvmEntry>>,
}

impl UvmExtension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries of the created credential, or of the first assertion.
    pub fn entries(&self) -> &[UvmEntry] {
        match self.assertion_entries.first() {
            Some(first) if self.entries.is_empty() => first,
            _ => &self.entries,
        }
    }

    /// One list per assertion, in the order the authenticator returned them.
    pub fn assertion_entries(&self) -> &[Vec<UvmEntry>] {
        &self.assertion_entries
    }
}

fn read_output(output: Option<&ExtensionParameter>) -> Result<Vec<UvmEntry>, Error> {
    let Some(output) = output else {
        return Ok(vec![]);
    };
    let ExtensionParameter::Array(items) = output else {
        return Err(ProtocolError::UnexpectedExtensionValue(NAME.into()).into());
    };
    items
        .iter()
        .map(|item| parse_entry(item).map_err(Error::from))
        .collect()
}

fn integer<T: TryFrom<i128>>(value: &Value) -> Result<T, ProtocolError> {
    let Value::Integer(n) = value else {
        return Err(ProtocolError::UnexpectedExtensionValue(NAME.into()));
    };
    T::try_from(*n).map_err(|_| {
        error!(?n, "uvm entry value out of range");
        ProtocolError::IntegerOverflow(NAME.into())
    })
}

fn parse_entry(item: &Value) -> Result<UvmEntry, ProtocolError> {
    let Value::Array(fields) = item else {
        return Err(ProtocolError::UnexpectedExtensionValue(NAME.into()));
    };
    let [method, key_protection, matcher_protection] = fields.as_slice() else {
        return Err(ProtocolError::UnexpectedExtensionValue(NAME.into()));
    };
    Ok(UvmEntry {
        user_verification_method: integer(method)?,
        key_protection_type: integer(key_protection)?,
        matcher_protection_type: integer(matcher_protection)?,
    })
}

impl Extension for UvmExtension {
    fn name(&self) -> &str {
        NAME
    }

    fn make_credential_input(
        &mut self,
        _ctx: &ExtensionContext,
    ) -> Result<Option<ExtensionParameter>, Error> {
        Ok(Some(ExtensionParameter::Boolean(true)))
    }

    fn make_credential_output(
        &mut self,
        output: Option<&ExtensionParameter>,
        _ctx: &ExtensionContext,
    ) -> Result<(), Error> {
        self.entries = read_output(output)?;
        Ok(())
    }

    fn get_assertion_input(
        &mut self,
        _ctx: &ExtensionContext,
    ) -> Result<Option<ExtensionParameter>, Error> {
        self.assertion_entries.clear();
        Ok(Some(ExtensionParameter::Boolean(true)))
    }

    fn get_assertion_output(
        &mut self,
        output: Option<&ExtensionParameter>,
        _ctx: &ExtensionContext,
    ) -> Result<(), Error> {
        self.assertion_entries.push(read_output(output)?);
        Ok(())
    }
}
