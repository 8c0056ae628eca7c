//! Extension negotiation.
//!
//! An [`Extension`] contributes one entry to the extensions map of a
//! makeCredential or getAssertion request and interprets the matching entry of
//! the authenticator data it gets back. Which value shapes travel in each
//! direction is recorded in the library's [`ExtensionRegistry`].

use std::collections::{BTreeMap, HashSet};

use serde_cbor::Value;
use tracing::{debug, error, warn};

use crate::pin::{KeyAgreementPlatformKey, PinUvAuthProtocol};
use crate::proto::ctap2::Ctap2GetInfoResponse;
use crate::transport::error::{Error, PlatformError, ProtocolError};

pub mod cred_blob;
pub mod cred_protect;
pub mod hmac_secret;
pub mod registry;
pub mod uvm;

pub use cred_blob::CredBlobExtension;
pub use cred_protect::{CredProtectExtension, CredentialProtectionPolicy};
pub use hmac_secret::HmacSecretExtension;
pub use registry::{ExtensionRegistration, ExtensionRegistry};
pub use uvm::{UvmEntry, UvmExtension};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionParameterKind {
    Boolean,
    Bytes,
    Integer,
    Array,
    Map,
}

/// One extension input or output value.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionParameter {
    Boolean(bool),
    Bytes(Vec<u8>),
    Integer(i64),
    Array(Vec<Value>),
    Map(BTreeMap<Value, Value>),
}

impl ExtensionParameter {
    pub fn kind(&self) -> ExtensionParameterKind {
        match self {
            Self::Boolean(_) => ExtensionParameterKind::Boolean,
            Self::Bytes(_) => ExtensionParameterKind::Bytes,
            Self::Integer(_) => ExtensionParameterKind::Integer,
            Self::Array(_) => ExtensionParameterKind::Array,
            Self::Map(_) => ExtensionParameterKind::Map,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Boolean(b) => Value::Bool(*b),
            Self::Bytes(bytes) => Value::Bytes(bytes.clone()),
            Self::Integer(n) => Value::Integer((*n).into()),
            Self::Array(items) => Value::Array(items.clone()),
            Self::Map(entries) => Value::Map(entries.clone()),
        }
    }

    /// Decodes an authenticator-supplied value, which must have the registered shape.
    pub fn from_value(
        value: Value,
        kind: ExtensionParameterKind,
        name: &str,
    ) -> Result<Self, ProtocolError> {
        let parameter = match (kind, value) {
            (ExtensionParameterKind::Boolean, Value::Bool(b)) => Self::Boolean(b),
            (ExtensionParameterKind::Bytes, Value::Bytes(bytes)) => Self::Bytes(bytes),
            (ExtensionParameterKind::Integer, Value::Integer(n)) => {
                let Ok(n) = i64::try_from(n) else {
                    error!(%name, "Extension output does not fit a 64-bit integer");
                    return Err(ProtocolError::IntegerOverflow(name.to_owned()));
                };
                Self::Integer(n)
            }
            (ExtensionParameterKind::Array, Value::Array(items)) => Self::Array(items),
            (ExtensionParameterKind::Map, Value::Map(entries)) => Self::Map(entries),
            (kind, value) => {
                error!(%name, ?kind, ?value, "Extension output has an unexpected shape");
                return Err(ProtocolError::UnexpectedExtensionValue(name.to_owned()));
            }
        };
        Ok(parameter)
    }
}

/// Key material of the transaction, for extensions that encrypt their inputs.
#[derive(Clone, Copy, Default)]
pub struct ExtensionContext<'a> {
    pub key_agreement: Option<&'a KeyAgreementPlatformKey>,
    pub protocol: Option<&'a dyn PinUvAuthProtocol>,
}

pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    /// Only consulted once the authenticator lists the extension by name.
    fn check_support(&self, info: &Ctap2GetInfoResponse) -> bool {
        info.supports_extension(self.name())
    }

    fn requires_key_agreement(&self) -> bool {
        false
    }

    fn make_credential_input(
        &mut self,
        _ctx: &ExtensionContext,
    ) -> Result<Option<ExtensionParameter>, Error> {
        Ok(None)
    }

    fn make_credential_output(
        &mut self,
        _output: Option<&ExtensionParameter>,
        _ctx: &ExtensionContext,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn get_assertion_input(
        &mut self,
        _ctx: &ExtensionContext,
    ) -> Result<Option<ExtensionParameter>, Error> {
        Ok(None)
    }

    /// Called once per returned assertion, in authenticator order, after a
    /// single `get_assertion_input` for the request.
    fn get_assertion_output(
        &mut self,
        _output: Option<&ExtensionParameter>,
        _ctx: &ExtensionContext,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Support as the framework evaluates it: the name check comes first.
pub fn is_supported(extension: &dyn Extension, info: &Ctap2GetInfoResponse) -> bool {
    info.supports_extension(extension.name()) && extension.check_support(info)
}

/// Caller-owned extensions for one operation.
#[derive(Default)]
pub struct ExtensionSet<'a> {
    extensions: Vec<&'a mut dyn Extension>,
    required: HashSet<String>,
}

/// Outcome of negotiation: indices of the extensions in use, and the names dropped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Negotiation {
    active: Vec<usize>,
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    MakeCredential,
    GetAssertion,
}

impl<'a> ExtensionSet<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, extension: &'a mut dyn Extension) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Adds an extension that fails the operation if the authenticator lacks it.
    pub fn with_required(mut self, extension: &'a mut dyn Extension) -> Self {
        self.required.insert(extension.name().to_owned());
        self.extensions.push(extension);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub(crate) fn negotiate(
        &self,
        registry: &ExtensionRegistry,
        info: &Ctap2GetInfoResponse,
    ) -> Result<Negotiation, Error> {
        let mut negotiation = Negotiation::default();
        let mut seen = HashSet::new();
        for (index, extension) in self.extensions.iter().enumerate() {
            let name = extension.name();
            if registry.get(name).is_none() {
                error!(%name, "Extension is not registered");
                return Err(PlatformError::UnregisteredExtension(name.to_owned()).into());
            }
            if !seen.insert(name.to_owned()) {
                warn!(%name, "Dropping duplicate extension");
                negotiation.dropped.push(name.to_owned());
                continue;
            }
            if is_supported(&**extension, info) {
                negotiation.active.push(index);
            } else if self.required.contains(name) {
                error!(%name, "Required extension is not supported by the authenticator");
                return Err(Error::ExtensionUnsupported(name.to_owned()));
            } else {
                warn!(%name, "Dropping extension not supported by the authenticator");
                negotiation.dropped.push(name.to_owned());
            }
        }
        debug!(
            active = negotiation.active.len(),
            dropped = ?negotiation.dropped,
            "Negotiated extensions"
        );
        Ok(negotiation)
    }

    pub(crate) fn needs_key_agreement(&self, negotiation: &Negotiation) -> bool {
        negotiation
            .active
            .iter()
            .any(|&index| self.extensions[index].requires_key_agreement())
    }

    fn inputs(
        &mut self,
        negotiation: &Negotiation,
        ctx: &ExtensionContext,
        operation: Operation,
    ) -> Result<BTreeMap<Value, Value>, Error> {
        let mut inputs = BTreeMap::new();
        for &index in &negotiation.active {
            let extension = &mut self.extensions[index];
            let input = match operation {
                Operation::MakeCredential => extension.make_credential_input(ctx)?,
                Operation::GetAssertion => extension.get_assertion_input(ctx)?,
            };
            if let Some(input) = input {
                inputs.insert(Value::Text(extension.name().to_owned()), input.to_value());
            }
        }
        Ok(inputs)
    }

    fn outputs(
        &mut self,
        negotiation: &Negotiation,
        registry: &ExtensionRegistry,
        outputs: Option<&BTreeMap<String, Value>>,
        ctx: &ExtensionContext,
        operation: Operation,
    ) -> Result<(), Error> {
        for &index in &negotiation.active {
            let extension = &mut self.extensions[index];
            let name = extension.name().to_owned();
            let Some(registration) = registry.get(&name) else {
                return Err(PlatformError::UnregisteredExtension(name).into());
            };
            let kind = match operation {
                Operation::MakeCredential => registration.creation,
                Operation::GetAssertion => registration.assertion,
            };
            let output = outputs
                .and_then(|outputs| outputs.get(&name))
                .map(|value| ExtensionParameter::from_value(value.clone(), kind, &name))
                .transpose()?;
            match operation {
                Operation::MakeCredential => {
                    extension.make_credential_output(output.as_ref(), ctx)?
                }
                Operation::GetAssertion => extension.get_assertion_output(output.as_ref(), ctx)?,
            }
        }
        Ok(())
    }

    pub(crate) fn make_credential_inputs(
        &mut self,
        negotiation: &Negotiation,
        ctx: &ExtensionContext,
    ) -> Result<BTreeMap<Value, Value>, Error> {
        self.inputs(negotiation, ctx, Operation::MakeCredential)
    }

    pub(crate) fn get_assertion_inputs(
        &mut self,
        negotiation: &Negotiation,
        ctx: &ExtensionContext,
    ) -> Result<BTreeMap<Value, Value>, Error> {
        self.inputs(negotiation, ctx, Operation::GetAssertion)
    }

    pub(crate) fn make_credential_outputs(
        &mut self,
        negotiation: &Negotiation,
        registry: &ExtensionRegistry,
        outputs: Option<&BTreeMap<String, Value>>,
        ctx: &ExtensionContext,
    ) -> Result<(), Error> {
        self.outputs(negotiation, registry, outputs, ctx, Operation::MakeCredential)
    }

    pub(crate) fn get_assertion_outputs(
        &mut self,
        negotiation: &Negotiation,
        registry: &ExtensionRegistry,
        outputs: Option<&BTreeMap<String, Value>>,
        ctx: &ExtensionContext,
    ) -> Result<(), Error> {
        self.outputs(negotiation, registry, outputs, ctx, Operation::GetAssertion)
    }
}
