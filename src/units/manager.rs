use super::keypair::OUTPUT_SECRET_NAME;
use super::systems::OUTPUT_ASG_NAME;
use super::{record_stack, resource, resource_id, DeployEnv, MANAGER, NETWORK, SYSTEMS};
use crate::core::graph::DeploymentUnit;
use crate::core::props::{Outputs, PropsView};
use crate::error::DeployError;
use serde_json::json;

/// Management instance that reaches the systems group with the provisioned
/// key. Only the secret's location is handed to it, never the key.
pub struct ManagerUnit {
    name: String,
    deps: Vec<String>,
}

impl ManagerUnit {
    pub fn new() -> Self {
        Self {
            name: MANAGER.to_string(),
            deps: vec![NETWORK.to_string(), SYSTEMS.to_string()],
        }
    }
}

impl Default for ManagerUnit {
    fn default() -> Self {
        Self::new()
    }
}

/// Environment lines prepended to the manager's bootstrap script.
pub fn render_bootstrap(region: &str, asg_name: &str, secret_name: &str) -> String {
    format!(
        "#!/bin/bash\nexport AWS_DEFAULT_REGION={}\nexport ASG_NAME={}\nexport KEYPAIR_SECRET_NAME={}\n",
        region, asg_name, secret_name
    )
}

impl<'a> DeploymentUnit<DeployEnv<'a>> for ManagerUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &[String] {
        &self.deps
    }

    fn apply(&mut self, env: &mut DeployEnv<'a>, inputs: &PropsView) -> Result<Outputs, DeployError> {
        let vpc_id = inputs.require_str("vpc_id")?;
        let asg_name = inputs.require_str(OUTPUT_ASG_NAME)?;
        let secret_name = inputs.require_str(OUTPUT_SECRET_NAME)?;
        let region = &env.config.deploy.region;
        let compute = &env.config.compute;

        let instance_id = resource_id("i", region, &self.name, "ManagerInstance");
        let user_data = render_bootstrap(region, asg_name, secret_name);
        let resources = vec![resource(
            "ManagerInstance",
            "compute::Instance",
            &instance_id,
            &[
                ("vpc_id", json!(vpc_id)),
                ("ami", json!(compute.ami)),
                ("instance_type", json!(compute.instance_type)),
                ("key_name", json!(compute.manager_key_name)),
                ("user_data", json!(user_data)),
            ],
        )];

        let outputs = Outputs::new().with("manager_instance_id", instance_id);
        record_stack(&mut env.state, &self.name, resources, &outputs)?;
        Ok(outputs)
    }
}
