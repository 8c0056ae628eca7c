use std::collections::HashMap;

use tracing::{debug, error};

use super::{cred_blob, cred_protect, hmac_secret, uvm, ExtensionParameterKind};
use crate::transport::error::{Error, PlatformError};

/// The value shapes an extension produces in authenticator data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionRegistration {
    pub name: String,
    /// Output shape after makeCredential.
    pub creation: ExtensionParameterKind,
    /// Output shape after getAssertion.
    pub assertion: ExtensionParameterKind,
}

impl ExtensionRegistration {
    pub fn new(
        name: &str,
        creation: ExtensionParameterKind,
        assertion: ExtensionParameterKind,
    ) -> Self {
        Self {
            name: name.to_owned(),
            creation,
            assertion,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtensionRegistry {
    entries: HashMap<String, ExtensionRegistration>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for registration in [
            cred_blob::registration(),
            cred_protect::registration(),
            hmac_secret::registration(),
            uvm::registration(),
        ] {
            registry
                .entries
                .insert(registration.name.clone(), registration);
        }
        registry
    }

    /// Registering the same shapes twice is a no-op.
    pub fn register(&mut self, registration: ExtensionRegistration) -> Result<(), Error> {
        match self.entries.get(&registration.name) {
            Some(existing) if existing == &registration => Ok(()),
            Some(existing) => {
                error!(?existing, ?registration, "Conflicting extension registration");
                Err(PlatformError::ExtensionRegistrationConflict(registration.name).into())
            }
            None => {
                debug!(name = %registration.name, "Registering extension");
                self.entries.insert(registration.name.clone(), registration);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ExtensionRegistration> {
        self.entries.get(name)
    }
}
