//! Error taxonomy for deployment ordering, remote invocation, and provisioning.
//!
//! Messages carry names, locations, and ids only. Credential material never
//! reaches an error value.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for deployment operations.
pub type Result<T> = std::result::Result<T, DeployError>;

/// How an error should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Graph or ordering defect. A programming error, never retried.
    Ordering,
    /// Transient failure. Safe to retry with the same physical resource id.
    Operational,
    /// Remote state needs an operator to reconcile it. Never retried silently.
    Reconciliation,
    /// Local state or filesystem failure.
    Local,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Operational)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Ordering => "ordering",
            ErrorClass::Operational => "operational",
            ErrorClass::Reconciliation => "reconciliation",
            ErrorClass::Local => "local",
        }
    }
}

/// Graph construction and output propagation defects.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("unit '{0}' is already registered")]
    DuplicateUnit(String),

    #[error("unit '{unit}' depends on unregistered unit '{dependency}'")]
    UnknownDependency { unit: String, dependency: String },

    #[error("unit filter names unregistered unit '{0}'")]
    UnknownUnit(String),

    #[error("output '{key}' from unit '{unit}' was already published by '{publisher}'")]
    KeyAlreadyPublished {
        key: String,
        unit: String,
        publisher: String,
    },

    #[error("unit '{unit}' requires output '{key}', which none of its dependencies published")]
    MissingInput { unit: String, key: String },
}

/// Failures of a single remote provisioning invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvocationError {
    #[error("invocation '{physical_resource_id}' got no response within {timeout:?}; it may still complete remotely")]
    Timeout {
        physical_resource_id: String,
        timeout: Duration,
    },

    #[error("remote function '{function}' failed: {message}")]
    Remote { function: String, message: String },

    #[error("not authorized to perform '{action}' on '{resource}'")]
    Authorization { action: String, resource: String },
}

/// Remote-state defects raised by the credential factory.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("keypair '{name}' already exists")]
    NameCollision { name: String },

    #[error("secret store rejected '{location}': {message}")]
    SecretStore { location: String, message: String },

    #[error("keypair '{keypair_name}' exists but secret '{missing_secret}' was not written: {message}")]
    PartialProvisioning {
        keypair_name: String,
        missing_secret: String,
        message: String,
    },
}

/// Any failure surfaced while applying a deployment unit.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    State(#[from] anyhow::Error),
}

impl DeployError {
    /// Stable kind name reported to the operator.
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::Graph(e) => match e {
                GraphError::Cycle { .. } => "CycleError",
                GraphError::DuplicateUnit(_) => "DuplicateUnitError",
                GraphError::UnknownDependency { .. } => "UnknownDependencyError",
                GraphError::UnknownUnit(_) => "UnknownUnitError",
                GraphError::KeyAlreadyPublished { .. } => "KeyAlreadyPublishedError",
                GraphError::MissingInput { .. } => "MissingInputError",
            },
            DeployError::Invocation(e) => match e {
                InvocationError::Timeout { .. } => "TimeoutError",
                InvocationError::Remote { .. } => "RemoteInvocationError",
                InvocationError::Authorization { .. } => "AuthorizationError",
            },
            DeployError::Provisioning(e) => match e {
                ProvisioningError::NameCollision { .. } => "NameCollisionError",
                ProvisioningError::SecretStore { .. } => "SecretStoreError",
                ProvisioningError::PartialProvisioning { .. } => "PartialProvisioningError",
            },
            DeployError::State(_) => "StateError",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            DeployError::Graph(_) => ErrorClass::Ordering,
            DeployError::Invocation(_) => ErrorClass::Operational,
            DeployError::Provisioning(_) => ErrorClass::Reconciliation,
            DeployError::State(_) => ErrorClass::Local,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}
