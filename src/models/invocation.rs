//! Provisioning requests, invocation lifecycle, and the function wire format.

use crate::models::credential::KeypairRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Names requested from the provisioning function. Generated once per
/// deployment and reused by every retry of the same physical resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    #[serde(rename = "keypair_name")]
    pub requested_name: String,
    #[serde(rename = "keypair_secret_name")]
    pub requested_secret_location: String,
}

impl ProvisioningRequest {
    pub fn new(requested_name: impl Into<String>, secret_prefix: &str) -> Self {
        let requested_name = requested_name.into();
        let requested_secret_location = secret_location(secret_prefix, &requested_name);
        Self {
            requested_name,
            requested_secret_location,
        }
    }
}

/// `<prefix>/<keypair_name>/private`
pub fn secret_location(prefix: &str, keypair_name: &str) -> String {
    format!("{}/{}/private", prefix.trim_end_matches('/'), keypair_name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Create,
    Update,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "CREATE",
            Action::Update => "UPDATE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    Pending,
    Succeeded,
    Failed,
}

impl InvocationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InvocationStatus::Pending)
    }
}

/// One attempt at the remote provisioning call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningInvocation {
    pub physical_resource_id: String,
    pub action: Action,
    pub payload: ProvisioningRequest,
    pub status: InvocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<KeypairRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub deduplicated: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProvisioningInvocation {
    pub fn pending(
        physical_resource_id: impl Into<String>,
        action: Action,
        payload: ProvisioningRequest,
    ) -> Self {
        Self {
            physical_resource_id: physical_resource_id.into(),
            action,
            payload,
            status: InvocationStatus::Pending,
            result: None,
            error_kind: None,
            deduplicated: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// PENDING -> SUCCEEDED. Returns false if the invocation already finished.
    pub fn succeed(&mut self, result: KeypairRef) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = InvocationStatus::Succeeded;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
        true
    }

    /// PENDING -> FAILED. Returns false if the invocation already finished.
    pub fn fail(&mut self, error_kind: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = InvocationStatus::Failed;
        self.error_kind = Some(error_kind.to_string());
        self.finished_at = Some(Utc::now());
        true
    }
}

/// Request body sent to the provisioning function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionPayload {
    pub params: ProvisioningRequest,
}

/// Success body returned by the provisioning function. Anything beyond the
/// two identifiers is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionResponse {
    pub keypair_name: String,
    pub keypair_secret_name: String,
}

/// Error body returned by the provisioning function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error_type")]
pub enum FunctionFailure {
    NameCollisionError {
        name: String,
    },
    SecretStoreError {
        location: String,
        message: String,
    },
    PartialProvisioningError {
        keypair_name: String,
        missing_secret: String,
        message: String,
    },
    AccessDeniedError {
        action: String,
        resource: String,
    },
    InvalidRequestError {
        message: String,
    },
    InternalError {
        message: String,
    },
}
