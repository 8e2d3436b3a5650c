//! Append-only, hash-chained trail of deploy events.
//!
//! Entries carry unit names, physical resource ids, keypair names and secret
//! locations. Never key material.

use crate::constants;
use crate::core::file_lock::FileLock;
use crate::core::paths::DeployPaths;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::warn;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const HASH_VERSION: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub actor: String,
    pub subject: String,
    #[serde(default = "default_metadata_only")]
    pub metadata_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AuditResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_version: Option<u8>,
}

fn default_metadata_only() -> bool {
    true
}

fn detect_actor() -> String {
    if let Ok(user) = std::env::var("SUDO_USER") {
        if !user.is_empty() {
            return format!("{}(sudo)", user);
        }
    }
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

/// One event to append.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub event: String,
    pub subject: String,
    pub detail: Option<String>,
    pub result: Option<AuditResult>,
}

impl AuditEvent {
    pub fn new(event: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            subject: subject.into(),
            detail: None,
            result: None,
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn succeeded(mut self) -> Self {
        self.result = Some(AuditResult {
            success: true,
            error_kind: None,
            error: None,
        });
        self
    }

    pub fn failed(mut self, kind: &str, error: impl Into<String>) -> Self {
        self.result = Some(AuditResult {
            success: false,
            error_kind: Some(kind.to_string()),
            error: Some(error.into()),
        });
        self
    }
}

/// Append `event` with the current user as actor.
pub fn log(paths: &DeployPaths, event: AuditEvent) -> Result<()> {
    log_as(paths, event, &detect_actor())
}

pub fn log_as(paths: &DeployPaths, event: AuditEvent, actor: &str) -> Result<()> {
    let _lock = FileLock::exclusive(&paths.audit_lock)?;
    let prev_hash = last_line_hash(&paths.audit_log).unwrap_or(None);

    let mut entry = AuditEntry {
        timestamp: Utc::now(),
        event: event.event,
        actor: actor.to_string(),
        subject: event.subject,
        metadata_only: true,
        prev_hash,
        detail: event.detail,
        result: event.result,
        entry_hash: None,
        hash_version: Some(HASH_VERSION),
    };
    entry.entry_hash = Some(compute_entry_hash(&entry)?);

    let line = serde_json::to_string(&entry).context("serialize audit entry")?;
    append_line(&paths.audit_log, &line)
}

/// Canonical hash of an entry, excluding its own `entry_hash`.
fn compute_entry_hash(entry: &AuditEntry) -> Result<String> {
    let mut value = serde_json::to_value(entry).context("serialize for hash")?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("entry_hash");
    }
    let canonical = canonicalize_value(&value);
    let canonical_str = serde_json::to_string(&canonical).context("serialize canonical json")?;
    let hash = Sha256::digest(canonical_str.as_bytes());
    Ok(format!("{:064x}", hash))
}

/// Recursively sort object keys.
fn canonicalize_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize_value(&map[k]));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(canonicalize_value).collect())
        }
        other => other.clone(),
    }
}

fn append_line(audit_path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = audit_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(audit_path)
        .with_context(|| format!("open audit log {}", audit_path.display()))?;
    writeln!(file, "{}", line).context("write audit entry")?;

    #[cfg(unix)]
    {
        let perm = fs::Permissions::from_mode(constants::AUDIT_LOG_MODE);
        fs::set_permissions(audit_path, perm).context("set audit log permissions")?;
    }

    Ok(())
}

fn last_line_hash(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    if len == 0 {
        return Ok(None);
    }

    const CHUNK: u64 = 8192;
    let mut offset = len;
    let mut buf = Vec::new();

    while offset > 0 {
        let read_size = std::cmp::min(CHUNK, offset);
        offset -= read_size;
        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("seek {}", path.display()))?;
        let mut tmp = vec![0u8; read_size as usize];
        file.read_exact(&mut tmp)
            .with_context(|| format!("read {}", path.display()))?;
        buf.splice(0..0, tmp);

        let trimmed_len = buf.iter().rposition(|b| !b.is_ascii_whitespace()).map(|i| i + 1);
        let Some(end) = trimmed_len else {
            continue;
        };
        let body = &buf[..end];
        let Some(start) = body.iter().rposition(|b| *b == b'\n').map(|i| i + 1) else {
            if offset == 0 {
                return Ok(hash_of_line(body));
            }
            continue;
        };
        return Ok(hash_of_line(&body[start..]));
    }

    Ok(None)
}

fn hash_of_line(line: &[u8]) -> Option<String> {
    if let Ok(entry) = serde_json::from_slice::<AuditEntry>(line) {
        if let Some(hash) = entry.entry_hash {
            return Some(hash);
        }
    }
    Some(format!("{:064x}", Sha256::digest(line)))
}

pub fn read_log(paths: &DeployPaths, limit: Option<usize>) -> Result<Vec<AuditEntry>> {
    let audit_path = &paths.audit_log;
    if !audit_path.exists() {
        return Ok(Vec::new());
    }

    let file = fs::File::open(audit_path)
        .with_context(|| format!("open audit log {}", audit_path.display()))?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut malformed = 0usize;

    for line in reader.lines() {
        let line = line.context("read audit log line")?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEntry>(trimmed) {
            Ok(entry) => entries.push(entry),
            Err(_) => malformed += 1,
        }
    }

    if malformed > 0 {
        warn!(malformed, "malformed audit entries skipped");
    }

    if let Some(limit) = limit {
        if entries.len() > limit {
            entries = entries.split_off(entries.len() - limit);
        }
    }

    Ok(entries)
}

/// Verify the hash chain. Returns (total, errors).
pub fn verify_chain(paths: &DeployPaths) -> Result<(usize, Vec<String>)> {
    let entries = read_log(paths, None)?;
    let mut errors = Vec::new();
    let mut prev_entry_hash: Option<String> = None;

    for (i, entry) in entries.iter().enumerate() {
        if i > 0 && entry.prev_hash != prev_entry_hash {
            errors.push(format!(
                "entry {}: prev_hash mismatch (expected {:?}, got {:?})",
                i + 1,
                prev_entry_hash,
                entry.prev_hash
            ));
        }

        match &entry.entry_hash {
            Some(stored) => match compute_entry_hash(entry) {
                Ok(computed) if &computed == stored => {}
                Ok(_) => errors.push(format!("entry {}: entry_hash mismatch (tampered?)", i + 1)),
                Err(e) => errors.push(format!("entry {}: cannot compute hash: {}", i + 1, e)),
            },
            None => errors.push(format!("entry {}: missing entry_hash", i + 1)),
        }

        prev_entry_hash = entry.entry_hash.clone();
    }

    Ok((entries.len(), errors))
}
