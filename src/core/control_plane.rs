//! Wiring of the file-backed control plane.

use crate::constants;
use crate::core::credstore::{FileKeypairApi, FileSecretStore};
use crate::core::factory::CredentialFactory;
use crate::core::function_host::LocalFunctionHost;
use crate::core::paths::DeployPaths;
use crate::models::deploy_config::DeployFile;
use crate::util::fs as deploy_fs;
use anyhow::Result;
use std::sync::Arc;

/// Create the control-plane directories if missing.
pub fn ensure_layout(paths: &DeployPaths) -> Result<()> {
    for dir in [&paths.cloud, &paths.keypairs, &paths.secrets, &paths.functions] {
        deploy_fs::ensure_dir(dir, constants::CLOUD_DIR_MODE)?;
    }
    Ok(())
}

/// A function host with the credential factory deployed under the
/// configured function name, backed by the directories in `paths`.
pub fn local_host(paths: &DeployPaths, config: &DeployFile) -> Result<LocalFunctionHost> {
    ensure_layout(paths)?;
    let factory = CredentialFactory::new(
        Arc::new(FileKeypairApi::new(paths.keypairs.clone())),
        Arc::new(FileSecretStore::new(paths.secrets.clone())),
        config.policy.function_role(),
    );
    let function_name = &config.keypair.function_name;
    let mut host = LocalFunctionHost::new(config.policy.invoker_role());
    host.register(
        function_name,
        Arc::new(factory),
        Some(paths.function_ledger(function_name)),
    )?;
    Ok(host)
}
