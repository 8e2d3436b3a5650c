//! The standard deployment: network, keypair, systems, manager.

pub mod keypair;
pub mod manager;
pub mod network;
pub mod systems;

use crate::core::function_host::FunctionClient;
use crate::core::graph::DeploymentGraph;
use crate::core::invoker::ProvisioningInvoker;
use crate::core::naming::NameGenerator;
use crate::core::props::Outputs;
use crate::core::state::{ResourceRecord, StackRecord, StateStore};
use crate::error::{DeployError, GraphError};
use crate::models::deploy_config::DeployFile;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

pub const NETWORK: &str = "network";
pub const KEYPAIR: &str = "keypair";
pub const SYSTEMS: &str = "systems";
pub const MANAGER: &str = "manager";

/// Everything a unit needs while applying.
pub struct DeployEnv<'a> {
    pub config: DeployFile,
    pub state: StateStore,
    pub invoker: ProvisioningInvoker<'a>,
    pub names: Box<dyn NameGenerator>,
}

impl<'a> DeployEnv<'a> {
    pub fn new(
        config: DeployFile,
        state: StateStore,
        client: &'a dyn FunctionClient,
        names: Box<dyn NameGenerator>,
        timeout: Duration,
    ) -> Self {
        let invoker = ProvisioningInvoker::new(client, config.keypair.function_name.clone(), timeout);
        Self {
            config,
            state,
            invoker,
            names,
        }
    }
}

pub type DeployGraph<'a> = DeploymentGraph<DeployEnv<'a>>;

pub fn standard_graph<'a>() -> Result<DeployGraph<'a>, GraphError> {
    let mut graph = DeploymentGraph::new();
    graph.register(Box::new(network::NetworkUnit::new()))?;
    graph.register(Box::new(keypair::KeypairUnit::new()))?;
    graph.register(Box::new(systems::SystemsUnit::new()))?;
    graph.register(Box::new(manager::ManagerUnit::new()))?;
    Ok(graph)
}

/// Deterministic resource id: `<prefix>-<16 hex>` from region, unit and
/// logical id, so re-applying a unit yields the same ids.
pub fn resource_id(prefix: &str, region: &str, unit: &str, logical_id: &str) -> String {
    let digest = Sha256::digest(format!("{}/{}/{}", region, unit, logical_id).as_bytes());
    let short: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", prefix, short)
}

pub(crate) fn resource(
    logical_id: &str,
    kind: &str,
    physical_id: &str,
    properties: &[(&str, Value)],
) -> ResourceRecord {
    ResourceRecord {
        logical_id: logical_id.to_string(),
        kind: kind.to_string(),
        physical_id: physical_id.to_string(),
        properties: properties
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    }
}

/// Persist what `unit` created and published.
pub(crate) fn record_stack(
    state: &mut StateStore,
    unit: &str,
    resources: Vec<ResourceRecord>,
    outputs: &Outputs,
) -> Result<(), DeployError> {
    let outputs: BTreeMap<String, Value> = outputs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    state.record_stack(StackRecord {
        unit: unit.to_string(),
        resources,
        outputs,
        applied_at: Utc::now(),
    })?;
    Ok(())
}
