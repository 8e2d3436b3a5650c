//! File-backed keypair registry and secret store under the control-plane
//! directory.

use crate::constants;
use crate::core::file_lock::FileLock;
use crate::core::provider::{KeypairApi, ProviderError, SecretStore};
use crate::models::credential::Material;
use crate::util::fs as deploy_fs;
use crate::util::path as logical_path;
use anyhow::{Context, Result};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const PUBLIC_KEY_EXTENSION: &str = ".pub";

#[derive(Debug, Clone)]
pub struct KeypairEntry {
    pub name: String,
    pub path: PathBuf,
    pub public_key: String,
    pub modified: Option<SystemTime>,
}

/// Keypairs registered in `dir`, sorted by name.
pub fn list_keypairs(dir: &Path) -> Result<Vec<KeypairEntry>> {
    let mut entries = Vec::new();
    if !dir.is_dir() {
        return Ok(entries);
    }
    let read = fs::read_dir(dir)
        .with_context(|| format!("open keypair directory {}", dir.display()))?;
    for entry in read {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let file_name = match path.file_name().and_then(|s| s.to_str()) {
            Some(name) => name,
            None => continue,
        };
        let Some(name) = file_name.strip_suffix(PUBLIC_KEY_EXTENSION) else {
            continue;
        };
        let public_key = fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?
            .trim()
            .to_string();
        let meta = fs::metadata(&path)?;
        entries.push(KeypairEntry {
            name: name.to_string(),
            path: path.clone(),
            public_key,
            modified: meta.modified().ok(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

pub fn validate_keypair_name(name: &str) -> Result<(), ProviderError> {
    let reason = if name.is_empty() || name.len() > 255 {
        Some("must be 1-255 characters")
    } else if name.starts_with('.') {
        Some("must not start with '.'")
    } else if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        Some("allowed characters are A-Z a-z 0-9 - _ .")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ProviderError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Keypair registry keeping `<name>.pub` files. Private halves are returned
/// to the caller and never written here.
pub struct FileKeypairApi {
    dir: PathBuf,
    lock: PathBuf,
}

impl FileKeypairApi {
    pub fn new(dir: PathBuf) -> Self {
        let lock = dir.with_extension("lock");
        Self { dir, lock }
    }

    fn public_key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", name, PUBLIC_KEY_EXTENSION))
    }
}

impl KeypairApi for FileKeypairApi {
    fn create_key_pair(&self, name: &str) -> Result<Material, ProviderError> {
        validate_keypair_name(name)?;
        let _lock = FileLock::exclusive(&self.lock).map_err(ProviderError::unavailable)?;
        let path = self.public_key_path(name);
        if path.exists() {
            return Err(ProviderError::AlreadyExists {
                name: name.to_string(),
            });
        }

        let signing = SigningKey::generate(&mut OsRng);
        let public_hex: String = signing
            .verifying_key()
            .to_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        let pem = signing
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(ProviderError::unavailable)?;

        deploy_fs::ensure_dir(&self.dir, constants::CLOUD_DIR_MODE)
            .map_err(ProviderError::unavailable)?;
        write_new(
            &path,
            format!("ed25519 {}\n", public_hex).as_bytes(),
            constants::PUBLIC_KEY_MODE,
            name,
        )?;
        debug!(keypair = name, "registered public key");
        Ok(Material::new(pem))
    }

    fn key_pair_exists(&self, name: &str) -> Result<bool, ProviderError> {
        validate_keypair_name(name)?;
        Ok(self.public_key_path(name).is_file())
    }
}

/// Secret store mapping each location to a file below `dir`.
pub struct FileSecretStore {
    dir: PathBuf,
    lock: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: PathBuf) -> Self {
        let lock = dir.with_extension("lock");
        Self { dir, lock }
    }

    fn resolve(&self, location: &str) -> Result<PathBuf, ProviderError> {
        logical_path::join_logical(&self.dir, location).ok_or_else(|| {
            ProviderError::InvalidName {
                name: location.to_string(),
                reason: "must be a relative path without '.' or '..' segments".to_string(),
            }
        })
    }

    /// Create every directory between the store root and `path`, mode 0700.
    fn ensure_parents(&self, path: &Path) -> Result<(), ProviderError> {
        deploy_fs::ensure_dir(&self.dir, constants::CLOUD_DIR_MODE)
            .map_err(ProviderError::unavailable)?;
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        let Ok(relative) = parent.strip_prefix(&self.dir) else {
            return Ok(());
        };
        let mut current = self.dir.clone();
        for segment in relative.components() {
            current.push(segment);
            if !current.is_dir() {
                deploy_fs::ensure_dir(&current, constants::CLOUD_DIR_MODE)
                    .map_err(ProviderError::unavailable)?;
            }
        }
        Ok(())
    }
}

impl SecretStore for FileSecretStore {
    fn check_location(&self, location: &str) -> Result<(), ProviderError> {
        let path = self.resolve(location)?;
        if path.exists() {
            return Err(ProviderError::AlreadyExists {
                name: location.to_string(),
            });
        }
        Ok(())
    }

    fn put_secret(&self, location: &str, material: &Material) -> Result<(), ProviderError> {
        let path = self.resolve(location)?;
        let _lock = FileLock::exclusive(&self.lock).map_err(ProviderError::unavailable)?;
        self.ensure_parents(&path)?;
        write_new(
            &path,
            material.expose().as_bytes(),
            constants::SECRET_FILE_MODE,
            location,
        )?;
        debug!(location, bytes = material.len(), "stored secret");
        Ok(())
    }

    fn secret_exists(&self, location: &str) -> Result<bool, ProviderError> {
        Ok(self.resolve(location)?.is_file())
    }
}

/// Write a file that must not exist yet: temp file, restrict, then link into
/// place without clobbering.
fn write_new(path: &Path, bytes: &[u8], mode: u32, name: &str) -> Result<(), ProviderError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)
        .map_err(ProviderError::unavailable)?;

    #[cfg(unix)]
    {
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(mode))
            .map_err(ProviderError::unavailable)?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    tmp.write_all(bytes).map_err(ProviderError::unavailable)?;
    tmp.as_file().sync_all().map_err(ProviderError::unavailable)?;
    tmp.persist_noclobber(path).map_err(|err| {
        if err.error.kind() == std::io::ErrorKind::AlreadyExists {
            ProviderError::AlreadyExists {
                name: name.to_string(),
            }
        } else {
            ProviderError::unavailable(err.error)
        }
    })?;
    Ok(())
}
