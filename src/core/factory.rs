//! Credential creation as run inside the provisioning function.
//!
//! Order of operations: permission preflight, secret location check,
//! keypair creation, secret write. Only the last step can leave a keypair
//! behind without its secret, and that case is reported on its own.

use crate::constants;
use crate::core::provider::{KeypairApi, ProviderError, SecretStore};
use crate::error::ProvisioningError;
use crate::models::credential::{Credential, KeypairRef};
use crate::models::invocation::{FunctionFailure, FunctionPayload, FunctionResponse, ProvisioningRequest};
use crate::models::policy::RolePolicy;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FactoryError {
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error("role '{role}' may not perform '{action}' on '{resource}'")]
    AccessDenied {
        role: String,
        action: String,
        resource: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Unavailable(String),
}

impl From<FactoryError> for FunctionFailure {
    fn from(err: FactoryError) -> Self {
        match err {
            FactoryError::Provisioning(ProvisioningError::NameCollision { name }) => {
                FunctionFailure::NameCollisionError { name }
            }
            FactoryError::Provisioning(ProvisioningError::SecretStore { location, message }) => {
                FunctionFailure::SecretStoreError { location, message }
            }
            FactoryError::Provisioning(ProvisioningError::PartialProvisioning {
                keypair_name,
                missing_secret,
                message,
            }) => FunctionFailure::PartialProvisioningError {
                keypair_name,
                missing_secret,
                message,
            },
            FactoryError::AccessDenied {
                action, resource, ..
            } => FunctionFailure::AccessDeniedError { action, resource },
            FactoryError::InvalidRequest(message) => FunctionFailure::InvalidRequestError { message },
            FactoryError::Unavailable(message) => FunctionFailure::InternalError { message },
        }
    }
}

/// Raw output of a hosted function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutput {
    pub payload: Vec<u8>,
    pub is_error: bool,
}

impl HandlerOutput {
    fn encode<T: Serialize>(body: &T, is_error: bool) -> Self {
        Self {
            payload: serde_json::to_vec(body).unwrap_or_default(),
            is_error,
        }
    }
}

/// A function body the host can run.
pub trait FunctionHandler: Send + Sync {
    fn handle(&self, payload: &[u8]) -> HandlerOutput;

    /// Settle a call that an earlier host started but never finished, by
    /// looking at what it left behind. `None` means it left nothing and the
    /// call can run from scratch.
    fn reconcile(&self, _payload: &[u8]) -> Option<HandlerOutput> {
        None
    }
}

pub struct CredentialFactory {
    keypairs: Arc<dyn KeypairApi>,
    secrets: Arc<dyn SecretStore>,
    role: RolePolicy,
}

impl CredentialFactory {
    pub fn new(keypairs: Arc<dyn KeypairApi>, secrets: Arc<dyn SecretStore>, role: RolePolicy) -> Self {
        Self {
            keypairs,
            secrets,
            role,
        }
    }

    /// Create keypair `request.requested_name` and store its private half
    /// at `request.requested_secret_location`. Returns identifiers only.
    pub fn create_credential(&self, request: &ProvisioningRequest) -> Result<KeypairRef, FactoryError> {
        let name = request.requested_name.as_str();
        let location = request.requested_secret_location.as_str();

        self.authorize(constants::ACTION_KEYPAIR_CREATE, name)?;
        self.authorize(constants::ACTION_SECRET_CREATE, location)?;

        self.secrets
            .check_location(location)
            .map_err(|err| secret_store_error(location, err))?;

        let material = match self.keypairs.create_key_pair(name) {
            Ok(material) => material,
            Err(ProviderError::AlreadyExists { .. }) => {
                return Err(ProvisioningError::NameCollision {
                    name: name.to_string(),
                }
                .into())
            }
            Err(ProviderError::AccessDenied { action, resource }) => {
                return Err(FactoryError::AccessDenied {
                    role: self.role.name.clone(),
                    action,
                    resource,
                })
            }
            Err(ProviderError::InvalidName { reason, .. }) => {
                return Err(FactoryError::InvalidRequest(format!(
                    "keypair name '{}': {}",
                    name, reason
                )))
            }
            Err(err @ ProviderError::Unavailable { .. }) => {
                return Err(FactoryError::Unavailable(format!("keypair service: {}", err)))
            }
        };
        info!(keypair = name, "keypair created");

        let credential = Credential {
            name: name.to_string(),
            location: location.to_string(),
            material,
        };
        if let Err(err) = self.secrets.put_secret(&credential.location, &credential.material) {
            warn!(
                keypair = name,
                missing_secret = location,
                error = %err,
                "keypair exists but its secret was not written"
            );
            return Err(ProvisioningError::PartialProvisioning {
                keypair_name: credential.name.clone(),
                missing_secret: credential.location.clone(),
                message: err.to_string(),
            }
            .into());
        }
        info!(keypair = name, location, "secret stored");
        Ok(credential.into_ref())
    }

    /// What an interrupted `create_credential` for `request` left behind.
    ///
    /// Both halves present is a finished credential. A keypair without its
    /// secret is partial provisioning. No keypair means nothing was created.
    pub fn inspect_credential(&self, request: &ProvisioningRequest) -> Result<Option<KeypairRef>, FactoryError> {
        let name = request.requested_name.as_str();
        let location = request.requested_secret_location.as_str();
        let keypair = self.keypairs.key_pair_exists(name).map_err(provider_unavailable)?;
        if !keypair {
            return Ok(None);
        }
        if !self.secrets.secret_exists(location).map_err(provider_unavailable)? {
            warn!(keypair = name, missing_secret = location, "interrupted call left a keypair without its secret");
            return Err(ProvisioningError::PartialProvisioning {
                keypair_name: name.to_string(),
                missing_secret: location.to_string(),
                message: "an interrupted invocation created the keypair but not its secret".to_string(),
            }
            .into());
        }
        info!(keypair = name, location, "interrupted call had completed");
        Ok(Some(KeypairRef {
            name: name.to_string(),
            location: location.to_string(),
        }))
    }

    fn authorize(&self, action: &str, resource: &str) -> Result<(), FactoryError> {
        if self.role.is_allowed(action) {
            return Ok(());
        }
        Err(FactoryError::AccessDenied {
            role: self.role.name.clone(),
            action: action.to_string(),
            resource: resource.to_string(),
        })
    }
}

fn provider_unavailable(err: ProviderError) -> FactoryError {
    match err {
        ProviderError::InvalidName { name, reason } => {
            FactoryError::InvalidRequest(format!("'{}': {}", name, reason))
        }
        other => FactoryError::Unavailable(other.to_string()),
    }
}

fn secret_store_error(location: &str, err: ProviderError) -> FactoryError {
    ProvisioningError::SecretStore {
        location: location.to_string(),
        message: err.to_string(),
    }
    .into()
}

fn encode_created(created: KeypairRef) -> HandlerOutput {
    HandlerOutput::encode(
        &FunctionResponse {
            keypair_name: created.name,
            keypair_secret_name: created.location,
        },
        false,
    )
}

impl FunctionHandler for CredentialFactory {
    fn reconcile(&self, payload: &[u8]) -> Option<HandlerOutput> {
        let request = serde_json::from_slice::<FunctionPayload>(payload).ok()?.params;
        match self.inspect_credential(&request) {
            Ok(Some(created)) => Some(encode_created(created)),
            Ok(None) => None,
            Err(err) => Some(HandlerOutput::encode(&FunctionFailure::from(err), true)),
        }
    }

    fn handle(&self, payload: &[u8]) -> HandlerOutput {
        let request = match serde_json::from_slice::<FunctionPayload>(payload) {
            Ok(body) => body.params,
            Err(err) => {
                let failure: FunctionFailure =
                    FactoryError::InvalidRequest(format!("malformed payload at column {}", err.column())).into();
                return HandlerOutput::encode(&failure, true);
            }
        };
        if request.requested_name.is_empty() || request.requested_secret_location.is_empty() {
            let failure: FunctionFailure =
                FactoryError::InvalidRequest("keypair_name and keypair_secret_name are required".into())
                    .into();
            return HandlerOutput::encode(&failure, true);
        }
        match self.create_credential(&request) {
            Ok(created) => encode_created(created),
            Err(err) => HandlerOutput::encode(&FunctionFailure::from(err), true),
        }
    }
}
