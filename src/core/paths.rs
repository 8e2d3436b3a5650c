//! Project and control-plane path resolution.

use crate::constants;
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DeployPaths {
    pub root: PathBuf,
    pub config: PathBuf,
    pub cloud: PathBuf,
    pub keypairs: PathBuf,
    pub secrets: PathBuf,
    pub functions: PathBuf,
    pub state: PathBuf,
    pub state_lock: PathBuf,
    pub audit_log: PathBuf,
    pub audit_lock: PathBuf,
}

impl DeployPaths {
    /// Resolve the project root from CLI arg, env var, or auto-detection.
    pub fn resolve_root(root_arg: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(root) = root_arg {
            return Ok(root);
        }
        if let Ok(root) = env::var(constants::ROOT_ENV) {
            return Ok(PathBuf::from(root));
        }
        let cwd = env::current_dir().context("resolve current directory")?;
        for ancestor in cwd.ancestors() {
            if ancestor.join(constants::CONFIG_FILE).is_file() {
                return Ok(ancestor.to_path_buf());
            }
        }
        Ok(cwd)
    }

    /// Lay out paths under `root`. `cloud_dir` overrides the control-plane
    /// directory; relative values resolve against `root`.
    pub fn from_root(root: PathBuf, cloud_dir: Option<&str>) -> Self {
        let cloud = match cloud_dir {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => root.join(dir),
            None => root.join(constants::DEFAULT_CLOUD_DIR),
        };
        Self {
            config: root.join(constants::CONFIG_FILE),
            keypairs: cloud.join("keypairs"),
            secrets: cloud.join("secrets"),
            functions: cloud.join("functions"),
            state: cloud.join("state.json"),
            state_lock: cloud.join("state.lock"),
            audit_log: cloud.join("audit.log"),
            audit_lock: cloud.join("audit.lock"),
            cloud,
            root,
        }
    }

    /// Dedup ledger kept by the function host for `function_name`.
    pub fn function_ledger(&self, function_name: &str) -> PathBuf {
        self.functions.join(format!("{}.ledger.json", function_name))
    }
}

impl std::fmt::Display for DeployPaths {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "project@{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_root_defaults() {
        let paths = DeployPaths::from_root(PathBuf::from("/proj"), None);
        assert_eq!(paths.config, PathBuf::from("/proj/deploy.toml"));
        assert_eq!(paths.cloud, PathBuf::from("/proj/.cloud"));
        assert_eq!(paths.secrets, PathBuf::from("/proj/.cloud/secrets"));
        assert_eq!(paths.state, PathBuf::from("/proj/.cloud/state.json"));
        assert_eq!(
            paths.function_ledger("ec2-keypair-init"),
            PathBuf::from("/proj/.cloud/functions/ec2-keypair-init.ledger.json")
        );
    }

    #[test]
    fn test_cloud_dir_override() {
        let rel = DeployPaths::from_root(PathBuf::from("/proj"), Some("cp"));
        assert_eq!(rel.cloud, PathBuf::from("/proj/cp"));
        let abs = DeployPaths::from_root(PathBuf::from("/proj"), Some("/var/cp"));
        assert_eq!(abs.keypairs, PathBuf::from("/var/cp/keypairs"));
    }

    #[test]
    fn test_explicit_root_wins() {
        let root = DeployPaths::resolve_root(Some(PathBuf::from("/explicit"))).unwrap();
        assert_eq!(root, PathBuf::from("/explicit"));
    }
}
