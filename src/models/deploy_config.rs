//! Project configuration file model (`deploy.toml`).

use crate::constants;
use crate::models::policy::PolicySection;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployFile {
    #[serde(default)]
    pub deploy: DeploySection,
    #[serde(default)]
    pub keypair: KeypairSection,
    #[serde(default)]
    pub compute: ComputeSection,
    #[serde(default)]
    pub policy: PolicySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySection {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Control-plane directory; relative paths resolve against the project root.
    #[serde(default)]
    pub cloud_dir: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Attempts per unit when it fails with a retryable error.
    #[serde(default = "default_invoke_attempts")]
    pub invoke_attempts: u32,
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            version: default_version(),
            cloud_dir: None,
            region: default_region(),
            invoke_attempts: default_invoke_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeypairSection {
    #[serde(default = "default_function_name")]
    pub function_name: String,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_secret_prefix")]
    pub secret_prefix: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for KeypairSection {
    fn default() -> Self {
        Self {
            function_name: default_function_name(),
            name_prefix: default_name_prefix(),
            secret_prefix: default_secret_prefix(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeSection {
    #[serde(default = "default_ami")]
    pub ami: String,
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    /// Pre-existing keypair used to reach the manager instance itself.
    #[serde(default = "default_manager_key_name")]
    pub manager_key_name: String,
    #[serde(default = "default_vpc_cidr")]
    pub vpc_cidr: String,
    #[serde(default = "default_max_azs")]
    pub max_azs: u32,
}

impl Default for ComputeSection {
    fn default() -> Self {
        Self {
            ami: default_ami(),
            instance_type: default_instance_type(),
            manager_key_name: default_manager_key_name(),
            vpc_cidr: default_vpc_cidr(),
            max_azs: default_max_azs(),
        }
    }
}

fn default_version() -> u32 {
    1
}

fn default_region() -> String {
    constants::DEFAULT_REGION.to_string()
}

fn default_invoke_attempts() -> u32 {
    constants::DEFAULT_INVOKE_ATTEMPTS
}

fn default_function_name() -> String {
    constants::DEFAULT_FUNCTION_NAME.to_string()
}

fn default_name_prefix() -> String {
    constants::DEFAULT_KEYPAIR_PREFIX.to_string()
}

fn default_secret_prefix() -> String {
    constants::DEFAULT_SECRET_PREFIX.to_string()
}

fn default_timeout_secs() -> u64 {
    constants::DEFAULT_INVOKE_TIMEOUT_SECS
}

fn default_ami() -> String {
    "ami-0c55b159cbfafe1f0".to_string()
}

fn default_instance_type() -> String {
    "r5.xlarge".to_string()
}

fn default_manager_key_name() -> String {
    "manager-access".to_string()
}

fn default_vpc_cidr() -> String {
    "10.0.0.0/16".to_string()
}

fn default_max_azs() -> u32 {
    2
}
