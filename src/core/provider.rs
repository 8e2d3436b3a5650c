//! Interfaces of the external keypair API and secret store.

use crate::models::credential::Material;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("'{name}' already exists")]
    AlreadyExists { name: String },

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("access denied: '{action}' on '{resource}'")]
    AccessDenied { action: String, resource: String },

    #[error("service unavailable: {message}")]
    Unavailable { message: String },
}

impl ProviderError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        ProviderError::Unavailable {
            message: err.to_string(),
        }
    }
}

/// Account-level keypair registry.
pub trait KeypairApi: Send + Sync {
    /// Generate and register a keypair named `name`, returning the private
    /// half. Fails with `AlreadyExists` if the name is taken.
    fn create_key_pair(&self, name: &str) -> Result<Material, ProviderError>;

    fn key_pair_exists(&self, name: &str) -> Result<bool, ProviderError>;
}

/// Write-only secret store addressed by location.
pub trait SecretStore: Send + Sync {
    /// Fail if `location` is malformed or already holds a secret.
    fn check_location(&self, location: &str) -> Result<(), ProviderError>;

    /// Store `material` under `location`. Never overwrites.
    fn put_secret(&self, location: &str, material: &Material) -> Result<(), ProviderError>;

    fn secret_exists(&self, location: &str) -> Result<bool, ProviderError>;
}
