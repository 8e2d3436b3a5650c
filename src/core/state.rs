//! Control-plane stack state: per-unit resource records and invocation records.
//!
//! This is what the resource store retains between runs. Names and
//! locations only; credential material is never recorded here.

use crate::constants;
use crate::models::credential::KeypairRef;
use crate::models::invocation::{Action, InvocationStatus, ProvisioningInvocation, ProvisioningRequest};
use crate::util::fs as deploy_fs;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployState {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub stacks: BTreeMap<String, StackRecord>,
    #[serde(default)]
    pub invocations: BTreeMap<String, InvocationRecord>,
}

impl Default for DeployState {
    fn default() -> Self {
        Self {
            version: default_version(),
            stacks: BTreeMap::new(),
            invocations: BTreeMap::new(),
        }
    }
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub logical_id: String,
    pub kind: String,
    pub physical_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackRecord {
    pub unit: String,
    #[serde(default)]
    pub resources: Vec<ResourceRecord>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub physical_resource_id: String,
    pub unit: String,
    pub request: ProvisioningRequest,
    pub last_action: Action,
    pub status: InvocationStatus,
    /// Result of the most recent successful invocation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<KeypairRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl InvocationRecord {
    pub fn has_succeeded(&self) -> bool {
        self.result.is_some()
    }
}

/// Loaded state plus where to persist it. In-memory stores never touch disk.
#[derive(Debug)]
pub struct StateStore {
    path: Option<PathBuf>,
    state: DeployState,
}

impl StateStore {
    pub fn load(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("read deploy state {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parse deploy state {}", path.display()))?
        } else {
            DeployState::default()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            state,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: DeployState::default(),
        }
    }

    pub fn state(&self) -> &DeployState {
        &self.state
    }

    pub fn invocation(&self, physical_resource_id: &str) -> Option<&InvocationRecord> {
        self.state.invocations.get(physical_resource_id)
    }

    pub fn stack(&self, unit: &str) -> Option<&StackRecord> {
        self.state.stacks.get(unit)
    }

    /// Record that a new attempt for this physical resource is starting.
    /// Persisted before the remote call so a killed run reuses the request.
    pub fn begin_invocation(&mut self, unit: &str, invocation: &ProvisioningInvocation) -> Result<()> {
        let now = Utc::now();
        let record = self
            .state
            .invocations
            .entry(invocation.physical_resource_id.clone())
            .or_insert_with(|| InvocationRecord {
                physical_resource_id: invocation.physical_resource_id.clone(),
                unit: unit.to_string(),
                request: invocation.payload.clone(),
                last_action: invocation.action,
                status: InvocationStatus::Pending,
                result: None,
                error_kind: None,
                attempts: 0,
                updated_at: now,
            });
        record.request = invocation.payload.clone();
        record.last_action = invocation.action;
        record.status = InvocationStatus::Pending;
        record.error_kind = None;
        record.attempts += 1;
        record.updated_at = now;
        self.persist()
    }

    /// Record the terminal status of an attempt.
    pub fn finish_invocation(&mut self, invocation: &ProvisioningInvocation) -> Result<()> {
        if let Some(record) = self
            .state
            .invocations
            .get_mut(&invocation.physical_resource_id)
        {
            record.status = invocation.status;
            record.error_kind = invocation.error_kind.clone();
            if let Some(result) = &invocation.result {
                record.result = Some(result.clone());
            }
            record.updated_at = Utc::now();
        }
        self.persist()
    }

    pub fn record_stack(&mut self, record: StackRecord) -> Result<()> {
        self.state.stacks.insert(record.unit.clone(), record);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.state).context("serialize deploy state")?;
        deploy_fs::write_atomic(path, json.as_bytes(), constants::STATE_FILE_MODE)
    }
}
