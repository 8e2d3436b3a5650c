//! Blocking, idempotent invocation of the provisioning function.

use crate::constants;
use crate::core::function_host::{FunctionClient, InvokeRequest, TransportError};
use crate::core::state::StateStore;
use crate::error::{DeployError, InvocationError, ProvisioningError};
use crate::models::credential::KeypairRef;
use crate::models::invocation::{
    Action, FunctionFailure, FunctionPayload, FunctionResponse, InvocationStatus, ProvisioningInvocation,
    ProvisioningRequest,
};
use anyhow::Context;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Stable idempotency key for the provisioning resource owned by `unit`.
pub fn physical_resource_id(unit: &str, function_name: &str) -> String {
    format!("{}-{}", unit, function_name)
}

pub struct ProvisioningInvoker<'a> {
    client: &'a dyn FunctionClient,
    function_name: String,
    timeout: Duration,
    history: Vec<ProvisioningInvocation>,
    observer: Option<Box<dyn FnMut(&ProvisioningInvocation) + 'a>>,
}

impl<'a> ProvisioningInvoker<'a> {
    pub fn new(client: &'a dyn FunctionClient, function_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            function_name: function_name.into(),
            timeout,
            history: Vec::new(),
            observer: None,
        }
    }

    pub fn with_default_timeout(client: &'a dyn FunctionClient, function_name: impl Into<String>) -> Self {
        Self::new(
            client,
            function_name,
            Duration::from_secs(constants::DEFAULT_INVOKE_TIMEOUT_SECS),
        )
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Called with each invocation when it starts and again when it
    /// reaches a terminal state.
    pub fn set_observer(&mut self, observer: impl FnMut(&ProvisioningInvocation) + 'a) {
        self.observer = Some(Box::new(observer));
    }

    fn notify(&mut self, invocation: &ProvisioningInvocation) {
        if let Some(observer) = self.observer.as_mut() {
            observer(invocation);
        }
    }

    /// Every invocation made through this invoker, in order.
    pub fn history(&self) -> &[ProvisioningInvocation] {
        &self.history
    }

    /// Run one invocation to a terminal state and record it in `state`.
    ///
    /// An UPDATE of an id that already succeeded with the same request is
    /// re-affirmed from state without a remote call. Every other call goes
    /// to the function with `physical_resource_id` so it can deduplicate.
    pub fn invoke(
        &mut self,
        state: &mut StateStore,
        unit: &str,
        physical_resource_id: &str,
        action: Action,
        request: &ProvisioningRequest,
    ) -> Result<KeypairRef, DeployError> {
        let mut invocation = ProvisioningInvocation::pending(physical_resource_id, action, request.clone());

        if action == Action::Update {
            let prior = state.invocation(physical_resource_id).and_then(|record| {
                let same_request = record.request == *request;
                let succeeded = record.status == InvocationStatus::Succeeded;
                record.result.clone().filter(|_| same_request && succeeded)
            });
            if let Some(result) = prior {
                info!(
                    physical_resource_id,
                    keypair = %result.name,
                    "update re-affirmed from recorded invocation"
                );
                invocation.deduplicated = true;
                invocation.succeed(result.clone());
                self.notify(&invocation);
                self.history.push(invocation);
                return Ok(result);
            }
        }

        state.begin_invocation(unit, &invocation)?;
        self.notify(&invocation);
        let started = Instant::now();
        info!(
            physical_resource_id,
            action = action.as_str(),
            function = %self.function_name,
            "invoking provisioning function"
        );

        let outcome = self.call(&mut invocation);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(result) => {
                invocation.succeed(result.clone());
                info!(
                    physical_resource_id,
                    keypair = %result.name,
                    deduplicated = invocation.deduplicated,
                    elapsed_ms,
                    "invocation succeeded"
                );
            }
            Err(err) => {
                invocation.fail(err.kind());
                warn!(
                    physical_resource_id,
                    kind = err.kind(),
                    elapsed_ms,
                    error = %err,
                    "invocation failed"
                );
            }
        }
        let recorded = state.finish_invocation(&invocation);
        self.notify(&invocation);
        self.history.push(invocation);
        recorded?;
        outcome
    }

    fn call(&self, invocation: &mut ProvisioningInvocation) -> Result<KeypairRef, DeployError> {
        let request = &invocation.payload;
        let payload = serde_json::to_vec(&FunctionPayload {
            params: request.clone(),
        })
        .context("encode provisioning payload")?;
        let response = self
            .client
            .invoke(
                &InvokeRequest {
                    function_name: self.function_name.clone(),
                    physical_resource_id: invocation.physical_resource_id.clone(),
                    payload,
                },
                self.timeout,
            )
            .map_err(|err| self.transport_error(&invocation.physical_resource_id, err))?;
        invocation.deduplicated = response.deduplicated;

        if response.function_error {
            return Err(self.function_failure(&response.payload));
        }

        let body: FunctionResponse = serde_json::from_slice(&response.payload).map_err(|err| {
            self.remote(format!(
                "malformed response ({:?} error at line {} column {})",
                err.classify(),
                err.line(),
                err.column()
            ))
        })?;
        if body.keypair_name != request.requested_name
            || body.keypair_secret_name != request.requested_secret_location
        {
            return Err(self.remote("response does not echo the requested keypair and secret names".into()));
        }
        Ok(KeypairRef {
            name: body.keypair_name,
            location: body.keypair_secret_name,
        })
    }

    fn transport_error(&self, physical_resource_id: &str, err: TransportError) -> DeployError {
        match err {
            TransportError::Timeout(timeout) => InvocationError::Timeout {
                physical_resource_id: physical_resource_id.to_string(),
                timeout,
            }
            .into(),
            TransportError::AccessDenied {
                action, resource, ..
            } => InvocationError::Authorization { action, resource }.into(),
            other => self.remote(other.to_string()),
        }
    }

    fn function_failure(&self, payload: &[u8]) -> DeployError {
        let Ok(failure) = serde_json::from_slice::<FunctionFailure>(payload) else {
            return self.remote("unrecognized error payload".into());
        };
        match failure {
            FunctionFailure::NameCollisionError { name } => ProvisioningError::NameCollision { name }.into(),
            FunctionFailure::SecretStoreError { location, message } => {
                ProvisioningError::SecretStore { location, message }.into()
            }
            FunctionFailure::PartialProvisioningError {
                keypair_name,
                missing_secret,
                message,
            } => ProvisioningError::PartialProvisioning {
                keypair_name,
                missing_secret,
                message,
            }
            .into(),
            FunctionFailure::AccessDeniedError { action, resource } => {
                InvocationError::Authorization { action, resource }.into()
            }
            FunctionFailure::InvalidRequestError { message } => {
                self.remote(format!("invalid request: {}", message))
            }
            FunctionFailure::InternalError { message } => self.remote(message),
        }
    }

    fn remote(&self, message: String) -> DeployError {
        InvocationError::Remote {
            function: self.function_name.clone(),
            message,
        }
        .into()
    }
}
