//! The credential-provisioning unit.
//!
//! On first apply it generates a request, persists it with the invocation
//! record, and invokes the provisioning function. Later attempts, in this
//! run or a later one, reuse that request under the same physical resource
//! id, so the function never sees a second name for this unit.

use super::{record_stack, resource, DeployEnv, KEYPAIR, NETWORK};
use crate::core::graph::DeploymentUnit;
use crate::core::invoker::physical_resource_id;
use crate::core::props::{Outputs, PropsView};
use crate::error::DeployError;
use crate::models::invocation::{Action, ProvisioningRequest};
use serde_json::json;
use tracing::debug;

pub const OUTPUT_KEYPAIR_NAME: &str = "keypair_name";
pub const OUTPUT_SECRET_NAME: &str = "keypair_secret_name";

pub struct KeypairUnit {
    name: String,
    deps: Vec<String>,
}

impl KeypairUnit {
    pub fn new() -> Self {
        Self {
            name: KEYPAIR.to_string(),
            deps: vec![NETWORK.to_string()],
        }
    }
}

impl Default for KeypairUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> DeploymentUnit<DeployEnv<'a>> for KeypairUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &[String] {
        &self.deps
    }

    fn apply(&mut self, env: &mut DeployEnv<'a>, _inputs: &PropsView) -> Result<Outputs, DeployError> {
        let settings = &env.config.keypair;
        let id = physical_resource_id(&self.name, &settings.function_name);

        let (request, action) = match env.state.invocation(&id) {
            Some(record) => {
                let action = if record.has_succeeded() {
                    Action::Update
                } else {
                    Action::Create
                };
                debug!(physical_resource_id = %id, keypair = %record.request.requested_name, "reusing recorded request");
                (record.request.clone(), action)
            }
            None => {
                let name = env.names.keypair_name(&settings.name_prefix);
                (ProvisioningRequest::new(name, &settings.secret_prefix), Action::Create)
            }
        };

        let created = env
            .invoker
            .invoke(&mut env.state, &self.name, &id, action, &request)?;

        let outputs = Outputs::new()
            .with(OUTPUT_KEYPAIR_NAME, created.name.clone())
            .with(OUTPUT_SECRET_NAME, created.location.clone());
        let resources = vec![resource(
            "KeypairInit",
            "custom::KeypairInit",
            &id,
            &[
                ("function", json!(env.config.keypair.function_name)),
                ("keypair_name", json!(created.name)),
                ("keypair_secret_name", json!(created.location)),
            ],
        )];
        record_stack(&mut env.state, &self.name, resources, &outputs)?;
        Ok(outputs)
    }
}
