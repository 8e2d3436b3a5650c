use super::{record_stack, resource, resource_id, DeployEnv, NETWORK};
use crate::core::graph::DeploymentUnit;
use crate::core::props::{Outputs, PropsView};
use crate::error::DeployError;
use serde_json::json;

/// Virtual network with one public and one private subnet per zone.
pub struct NetworkUnit {
    name: String,
    deps: Vec<String>,
}

impl NetworkUnit {
    pub fn new() -> Self {
        Self {
            name: NETWORK.to_string(),
            deps: Vec::new(),
        }
    }
}

impl Default for NetworkUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> DeploymentUnit<DeployEnv<'a>> for NetworkUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &[String] {
        &self.deps
    }

    fn apply(&mut self, env: &mut DeployEnv<'a>, _inputs: &PropsView) -> Result<Outputs, DeployError> {
        let region = env.config.deploy.region.clone();
        let compute = &env.config.compute;

        let vpc_id = resource_id("vpc", &region, &self.name, "ExampleVPC");
        let mut resources = vec![resource(
            "ExampleVPC",
            "network::Vpc",
            &vpc_id,
            &[("cidr", json!(compute.vpc_cidr))],
        )];

        let mut subnets = Vec::new();
        let mut public_subnet_id = None;
        for zone in 0..compute.max_azs.max(1) {
            for tier in ["public", "private"] {
                let logical = format!("{}-subnet-{}", tier, zone);
                let id = resource_id("subnet", &region, &self.name, &logical);
                resources.push(resource(
                    &logical,
                    "network::Subnet",
                    &id,
                    &[("vpc_id", json!(vpc_id)), ("tier", json!(tier))],
                ));
                if tier == "public" && public_subnet_id.is_none() {
                    public_subnet_id = Some(id.clone());
                }
                subnets.push(id);
            }
        }
        let public_subnet_id = public_subnet_id.unwrap_or_default();

        let outputs = Outputs::new()
            .with("vpc_id", vpc_id)
            .with("subnets", subnets)
            .with("public_subnet_id", public_subnet_id);
        record_stack(&mut env.state, &self.name, resources, &outputs)?;
        Ok(outputs)
    }
}
