use super::keypair::OUTPUT_KEYPAIR_NAME;
use super::{record_stack, resource, resource_id, DeployEnv, KEYPAIR, NETWORK, SYSTEMS};
use crate::core::graph::DeploymentUnit;
use crate::core::props::{Outputs, PropsView};
use crate::error::DeployError;
use serde_json::json;

pub const OUTPUT_ASG_NAME: &str = "asg_name";

/// Auto scaling group whose instances are reachable with the provisioned
/// keypair.
pub struct SystemsUnit {
    name: String,
    deps: Vec<String>,
}

impl SystemsUnit {
    pub fn new() -> Self {
        Self {
            name: SYSTEMS.to_string(),
            deps: vec![NETWORK.to_string(), KEYPAIR.to_string()],
        }
    }
}

impl Default for SystemsUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> DeploymentUnit<DeployEnv<'a>> for SystemsUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &[String] {
        &self.deps
    }

    fn apply(&mut self, env: &mut DeployEnv<'a>, inputs: &PropsView) -> Result<Outputs, DeployError> {
        let vpc_id = inputs.require_str("vpc_id")?;
        let keypair_name = inputs.require_str(OUTPUT_KEYPAIR_NAME)?;
        let region = &env.config.deploy.region;
        let compute = &env.config.compute;

        let sg_id = resource_id("sg", region, &self.name, "SystemsSecurityGroup");
        let template_id = resource_id("lt", region, &self.name, "SystemsLaunchTemplate");
        let asg_name = resource_id("systems-asg", region, &self.name, "SystemsGroup");

        let resources = vec![
            resource(
                "SystemsSecurityGroup",
                "network::SecurityGroup",
                &sg_id,
                &[("vpc_id", json!(vpc_id))],
            ),
            resource(
                "SystemsLaunchTemplate",
                "compute::LaunchTemplate",
                &template_id,
                &[
                    ("key_name", json!(keypair_name)),
                    ("ami", json!(compute.ami)),
                    ("instance_type", json!(compute.instance_type)),
                    ("security_group", json!(sg_id)),
                ],
            ),
            resource(
                "SystemsGroup",
                "compute::AutoScalingGroup",
                &asg_name,
                &[("launch_template", json!(template_id))],
            ),
        ];

        let outputs = Outputs::new().with(OUTPUT_ASG_NAME, asg_name);
        record_stack(&mut env.state, &self.name, resources, &outputs)?;
        Ok(outputs)
    }
}
