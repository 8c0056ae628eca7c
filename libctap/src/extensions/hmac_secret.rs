use std::collections::BTreeMap;

use serde_cbor::Value;
use tracing::{error, warn};

use super::{
    Extension, ExtensionContext, ExtensionParameter, ExtensionParameterKind,
    ExtensionRegistration,
};
use crate::proto::ctap2::cbor::serialize;
use crate::proto::ctap2::Ctap2PinUvAuthProtocol;
use crate::transport::error::{Error, ProtocolError};

pub const NAME: &str = "hmac-secret";

const SALT_LEN: usize = 32;

/// output1, and output2 when a second salt was sent.
pub type HmacSecretOutput = (Vec<u8>, Option<Vec<u8>>);

pub fn registration() -> ExtensionRegistration {
    ExtensionRegistration::new(
        NAME,
        ExtensionParameterKind::Boolean,
        ExtensionParameterKind::Bytes,
    )
}

/// Enables the per-credential HMAC secret on creation, and evaluates it with one
/// or two salts on assertion. Salts and outputs travel encrypted under the
/// transaction's key agreement.
#[derive(Debug, Default, Clone)]
pub struct HmacSecretExtension {
    salts: Option<([u8; SALT_LEN], Option<[u8; SALT_LEN]>)>,
    created: bool,
    outputs: Vec<Option<HmacSecretOutput>>,
}

impl HmacSecretExtension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_salts(salt1: [u8; SALT_LEN], salt2: Option<[u8; SALT_LEN]>) -> Self {
        Self {
            salts: Some((salt1, salt2)),
            ..Default::default()
        }
    }

    pub fn was_created(&self) -> bool {
        self.created
    }

    fn first(&self) -> Option<&HmacSecretOutput> {
        self.outputs.first().and_then(Option::as_ref)
    }

    /// output1 of the first assertion.
    pub fn output1(&self) -> Option<&[u8]> {
        self.first().map(|(first, _)| first.as_slice())
    }

    /// output2 of the first assertion.
    pub fn output2(&self) -> Option<&[u8]> {
        self.first().and_then(|(_, second)| second.as_deref())
    }

    /// One entry per assertion, in the order the authenticator returned them.
    pub fn outputs(&self) -> &[Option<HmacSecretOutput>] {
        &self.outputs
    }
}

impl Extension for HmacSecretExtension {
    fn name(&self) -> &str {
        NAME
    }

    fn requires_key_agreement(&self) -> bool {
        self.salts.is_some()
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
        self.created = matches!(output, Some(ExtensionParameter::Boolean(true)));
        Ok(())
    }

    fn get_assertion_input(
        &mut self,
        ctx: &ExtensionContext,
    ) -> Result<Option<ExtensionParameter>, Error> {
        self.outputs.clear();
        let Some((salt1, salt2)) = &self.salts else {
            return Ok(None);
        };
        let (Some(key_agreement), Some(protocol)) = (ctx.key_agreement, ctx.protocol) else {
            error!("hmac-secret needs a key agreement");
            return Err(ProtocolError::MissingField("keyAgreement".into()).into());
        };

        let mut salts = salt1.to_vec();
        if let Some(salt2) = salt2 {
            salts.extend_from_slice(salt2);
        }
        let salt_enc = protocol.encrypt(&key_agreement.shared_secret, &salts)?;
        let salt_auth = protocol.authenticate(&key_agreement.shared_secret, &salt_enc)?;

        let mut input = BTreeMap::new();
        input.insert(Value::Integer(1), serialize(&key_agreement.cose_key()?)?);
        input.insert(Value::Integer(2), Value::Bytes(salt_enc));
        input.insert(Value::Integer(3), Value::Bytes(salt_auth));
        if protocol.version() != Ctap2PinUvAuthProtocol::One {
            input.insert(
                Value::Integer(4),
                Value::Integer(u32::from(protocol.version()).into()),
            );
        }
        Ok(Some(ExtensionParameter::Map(input)))
    }

    fn get_assertion_output(
        &mut self,
        output: Option<&ExtensionParameter>,
        ctx: &ExtensionContext,
    ) -> Result<(), Error> {
        let Some(ExtensionParameter::Bytes(encrypted)) = output else {
            if self.salts.is_some() {
                warn!("Authenticator returned no hmac-secret output");
            }
            self.outputs.push(None);
            return Ok(());
        };
        let (Some(key_agreement), Some(protocol)) = (ctx.key_agreement, ctx.protocol) else {
            return Err(ProtocolError::MissingField("keyAgreement".into()).into());
        };
        let mut decrypted = protocol.decrypt(&key_agreement.shared_secret, encrypted)?;
        let outputs = match decrypted.len() {
            SALT_LEN => (decrypted, None),
            len if len == 2 * SALT_LEN => {
                let second = decrypted.split_off(SALT_LEN);
                (decrypted, Some(second))
            }
            len => {
                error!(len, "hmac-secret output has an unexpected length");
                return Err(ProtocolError::UnexpectedExtensionValue(NAME.into()).into());
            }
        };
        self.outputs.push(Some(outputs));
        Ok(())
    }
}
