//! Loading and saving `deploy.toml`.

use crate::models::deploy_config::DeployFile;
use crate::util::fs as deploy_fs;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

pub fn load(path: &Path) -> Result<DeployFile> {
    if !path.exists() {
        return Ok(DeployFile::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("read deploy config {}", path.display()))?;
    let mut config: DeployFile = toml::from_str(&content)
        .with_context(|| format!("parse deploy config {}", path.display()))?;
    if config.deploy.version == 0 {
        config.deploy.version = 1;
    }
    validate(&config)?;
    Ok(config)
}

pub fn save(path: &Path, config: &DeployFile) -> Result<()> {
    let content = toml::to_string_pretty(config).context("serialize deploy config")?;
    deploy_fs::write_atomic(path, content.as_bytes(), 0o644)
}

fn validate(config: &DeployFile) -> Result<()> {
    if config.deploy.invoke_attempts == 0 {
        bail!("deploy.invoke_attempts must be at least 1");
    }
    if config.keypair.timeout_secs == 0 {
        bail!("keypair.timeout_secs must be at least 1");
    }
    if !is_valid_name(&config.keypair.name_prefix) {
        bail!(
            "keypair.name_prefix '{}' must match [a-zA-Z0-9_-]+",
            config.keypair.name_prefix
        );
    }
    let prefix = config.keypair.secret_prefix.trim_end_matches('/');
    if prefix.is_empty()
        || prefix.starts_with('/')
        || prefix.split('/').any(|s| s.is_empty() || s == "." || s == "..")
    {
        bail!(
            "keypair.secret_prefix '{}' must be a relative slash-separated name",
            config.keypair.secret_prefix
        );
    }
    if config.keypair.function_name.is_empty() || !is_valid_name(&config.keypair.function_name) {
        bail!("keypair.function_name must match [a-zA-Z0-9_-]+");
    }
    Ok(())
}

fn is_valid_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load(&dir.path().join("deploy.toml")).unwrap();
        assert_eq!(config.keypair.function_name, "ec2-keypair-init");
        assert_eq!(config.keypair.secret_prefix, "ec2-ssh-key");
        assert_eq!(config.keypair.timeout_secs, 600);
        assert_eq!(config.deploy.invoke_attempts, 2);
    }

    #[test]
    fn test_partial_file_merges_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deploy.toml");
        fs::write(
            &path,
            "[keypair]\nsecret_prefix = \"ssh\"\ntimeout_secs = 30\n\n[policy]\ninvoker_actions = [\"*\"]\n",
        )
        .unwrap();
        let config = load(&path).unwrap();
        assert_eq!(config.keypair.secret_prefix, "ssh");
        assert_eq!(config.keypair.timeout_secs, 30);
        assert_eq!(config.keypair.name_prefix, "keypair");
        assert_eq!(config.policy.invoker_actions, vec!["*".to_string()]);
        assert_eq!(config.policy.function_actions.len(), 2);
    }

    #[test]
    fn test_rejects_traversal_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deploy.toml");
        fs::write(&path, "[keypair]\nsecret_prefix = \"../escape\"\n").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deploy.toml");
        fs::write(&path, "[deploy]\ninvoke_attempts = 0\n").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deploy.toml");
        let mut config = DeployFile::default();
        config.deploy.region = "eu-west-1".into();
        save(&path, &config).unwrap();
        assert_eq!(load(&path).unwrap().deploy.region, "eu-west-1");
    }
}
