use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::error;

use super::{
    Extension, ExtensionContext, ExtensionParameter, ExtensionParameterKind,
    ExtensionRegistration,
};
use crate::transport::error::{Error, ProtocolError};

pub const NAME: &str = "credProtect";

pub fn registration() -> ExtensionRegistration {
    ExtensionRegistration::new(
        NAME,
        ExtensionParameterKind::Integer,
        ExtensionParameterKind::Integer,
    )
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum CredentialProtectionPolicy {
    UserVerificationOptional = 0x01,
    UserVerificationOptionalWithCredentialIDList = 0x02,
    UserVerificationRequired = 0x03,
}

/// Requests a protection level for a new credential.
#[derive(Debug, Clone)]
pub struct CredProtectExtension {
    policy: CredentialProtectionPolicy,
    level: Option<CredentialProtectionPolicy>,
}

impl CredProtectExtension {
    pub fn new(policy: CredentialProtectionPolicy) -> Self {
        Self {
            policy,
            level: None,
        }
    }

    /// The level the authenticator applied, if it reported one.
    pub fn level(&self) -> Option<CredentialProtectionPolicy> {
        self.level
    }
}

impl Extension for CredProtectExtension {
    fn name(&self) -> &str {
        NAME
    }

    fn make_credential_input(
        &mut self,
        _ctx: &ExtensionContext,
    ) -> Result<Option<ExtensionParameter>, Error> {
        Ok(Some(ExtensionParameter::Integer(u8::from(self.policy).into())))
    }

    fn make_credential_output(
        &mut self,
        output: Option<&ExtensionParameter>,
        _ctx: &ExtensionContext,
    ) -> Result<(), Error> {
        self.level = match output {
            None => None,
            Some(ExtensionParameter::Integer(level)) => {
                let policy = u8::try_from(*level)
                    .ok()
                    .and_then(|level| CredentialProtectionPolicy::try_from(level).ok());
                let Some(policy) = policy else {
                    error!(level, "Unknown credProtect level");
                    return Err(ProtocolError::UnexpectedExtensionValue(NAME.into()).into());
                };
                Some(policy)
            }
            Some(_) => {
                return Err(ProtocolError::UnexpectedExtensionValue(NAME.into()).into());
            }
        };
        Ok(())
    }
}
