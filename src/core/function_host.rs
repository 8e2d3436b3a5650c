//! Transport to the provisioning function, and an in-process host for it.
//!
//! The host deduplicates by physical resource id: a completed id invoked
//! again with the same payload returns the recorded response, and an id
//! whose first call is still running is joined rather than run twice.
//! Handlers keep running after a caller times out, so a later attempt can
//! pick up their result.
//!
//! A call is marked in flight on disk before its handler starts. A host that
//! loads a marker nobody settled (the process that started it died) asks the
//! handler to reconcile from remote state instead of running it again.

use crate::constants;
use crate::core::factory::{FunctionHandler, HandlerOutput};
use crate::core::file_lock::FileLock;
use crate::models::policy::RolePolicy;
use crate::util::fs as deploy_fs;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub function_name: String,
    pub physical_resource_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct InvokeResponse {
    pub payload: Vec<u8>,
    /// The function ran and reported an error body.
    pub function_error: bool,
    /// Served from the dedup ledger instead of a fresh run.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("role '{role}' may not perform '{action}' on '{resource}'")]
    AccessDenied {
        role: String,
        action: String,
        resource: String,
    },

    #[error("function '{0}' is not deployed")]
    FunctionNotFound(String),

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("{0}")]
    Internal(String),
}

/// Synchronous invocation of a named remote function.
pub trait FunctionClient {
    fn invoke(&self, request: &InvokeRequest, timeout: Duration) -> Result<InvokeResponse, TransportError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEntry {
    digest: String,
    response: Value,
    recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InFlightEntry {
    digest: String,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    entries: BTreeMap<String, LedgerEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    in_flight: BTreeMap<String, InFlightEntry>,
}

enum Slot {
    /// Running on a worker of this host.
    InFlight(InFlightEntry),
    /// Marked in flight by a host that never settled it.
    Orphaned(InFlightEntry),
    Done(LedgerEntry),
}

enum Seen {
    Recorded(Value),
    Running,
    Orphaned,
    Conflict(&'static str),
    Free,
}

struct Ledger {
    path: Option<PathBuf>,
    slots: Mutex<HashMap<String, Slot>>,
    changed: Condvar,
}

impl Ledger {
    fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut slots = HashMap::new();
        if let Some(p) = path.as_ref().filter(|p| p.exists()) {
            let content =
                fs::read_to_string(p).with_context(|| format!("read function ledger {}", p.display()))?;
            let file: LedgerFile = serde_json::from_str(&content)
                .with_context(|| format!("parse function ledger {}", p.display()))?;
            for (id, entry) in file.in_flight {
                warn!(physical_resource_id = %id, started_at = %entry.started_at, "found unsettled invocation");
                slots.insert(id, Slot::Orphaned(entry));
            }
            for (id, entry) in file.entries {
                slots.insert(id, Slot::Done(entry));
            }
        }
        Ok(Self {
            path,
            slots: Mutex::new(slots),
            changed: Condvar::new(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Slot>>, TransportError> {
        self.slots
            .lock()
            .map_err(|_| TransportError::Internal("function ledger lock poisoned".into()))
    }

    fn persist(&self, slots: &HashMap<String, Slot>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut file = LedgerFile::default();
        for (id, slot) in slots {
            match slot {
                Slot::Done(entry) => {
                    file.entries.insert(id.clone(), entry.clone());
                }
                Slot::InFlight(entry) | Slot::Orphaned(entry) => {
                    file.in_flight.insert(id.clone(), entry.clone());
                }
            }
        }
        let json = serde_json::to_string_pretty(&file).context("serialize function ledger")?;
        let _lock = FileLock::exclusive(&path.with_extension("lock"))?;
        deploy_fs::write_atomic(path, json.as_bytes(), constants::STATE_FILE_MODE)
    }

    /// Settle an in-flight slot: record a success, forget anything else.
    fn settle(&self, id: &str, digest: &str, output: &HandlerOutput) {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.settle_locked(&mut slots, id, digest, output);
        self.changed.notify_all();
    }

    fn settle_locked(&self, slots: &mut HashMap<String, Slot>, id: &str, digest: &str, output: &HandlerOutput) {
        let recorded = if output.is_error {
            None
        } else {
            serde_json::from_slice::<Value>(&output.payload).ok()
        };
        match recorded {
            Some(response) => {
                slots.insert(
                    id.to_string(),
                    Slot::Done(LedgerEntry {
                        digest: digest.to_string(),
                        response,
                        recorded_at: Utc::now(),
                    }),
                );
            }
            None => {
                slots.remove(id);
            }
        }
        if let Err(err) = self.persist(slots) {
            warn!(physical_resource_id = id, error = %err, "function ledger not persisted");
        }
    }
}

struct Hosted {
    handler: Arc<dyn FunctionHandler>,
    ledger: Arc<Ledger>,
}

/// Runs registered handlers in-process on behalf of a caller role.
pub struct LocalFunctionHost {
    caller: RolePolicy,
    functions: HashMap<String, Hosted>,
}

impl LocalFunctionHost {
    pub fn new(caller: RolePolicy) -> Self {
        Self {
            caller,
            functions: HashMap::new(),
        }
    }

    /// Deploy `handler` as `function_name`. With a ledger path, completed
    /// invocations survive across host instances.
    pub fn register(
        &mut self,
        function_name: &str,
        handler: Arc<dyn FunctionHandler>,
        ledger_path: Option<PathBuf>,
    ) -> Result<()> {
        let ledger = Arc::new(Ledger::load(ledger_path)?);
        self.functions
            .insert(function_name.to_string(), Hosted { handler, ledger });
        Ok(())
    }

    /// Physical resource ids with a recorded response.
    pub fn recorded_ids(&self, function_name: &str) -> Vec<String> {
        let Some(hosted) = self.functions.get(function_name) else {
            return Vec::new();
        };
        let Ok(slots) = hosted.ledger.lock() else {
            return Vec::new();
        };
        let mut ids: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Done(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

impl FunctionClient for LocalFunctionHost {
    fn invoke(&self, request: &InvokeRequest, timeout: Duration) -> Result<InvokeResponse, TransportError> {
        if !self.caller.is_allowed(constants::ACTION_INVOKE) {
            return Err(TransportError::AccessDenied {
                role: self.caller.name.clone(),
                action: constants::ACTION_INVOKE.to_string(),
                resource: request.function_name.clone(),
            });
        }
        let hosted = self
            .functions
            .get(&request.function_name)
            .ok_or_else(|| TransportError::FunctionNotFound(request.function_name.clone()))?;
        if request.payload.len() > constants::MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: request.payload.len(),
                limit: constants::MAX_PAYLOAD_SIZE,
            });
        }

        let id = request.physical_resource_id.clone();
        let digest = format!("{:x}", Sha256::digest(&request.payload));
        let deadline = Instant::now() + timeout;
        let ledger = &hosted.ledger;

        let mut slots = ledger.lock()?;
        loop {
            let seen = match slots.get(&id) {
                Some(Slot::Done(entry)) if entry.digest == digest => Seen::Recorded(entry.response.clone()),
                Some(Slot::Done(_)) => Seen::Conflict("was already provisioned"),
                Some(Slot::InFlight(running)) if running.digest == digest => Seen::Running,
                Some(Slot::Orphaned(running)) if running.digest == digest => Seen::Orphaned,
                Some(Slot::InFlight(_)) | Some(Slot::Orphaned(_)) => {
                    Seen::Conflict("has an in-flight invocation")
                }
                None => Seen::Free,
            };
            match seen {
                Seen::Recorded(response) => {
                    debug!(physical_resource_id = %id, "returning recorded response");
                    return Ok(InvokeResponse {
                        payload: serde_json::to_vec(&response)
                            .map_err(|e| TransportError::Internal(e.to_string()))?,
                        function_error: false,
                        deduplicated: true,
                    });
                }
                Seen::Conflict(what) => {
                    return Err(TransportError::Internal(format!(
                        "physical resource '{}' {} with a different payload",
                        id, what
                    )))
                }
                Seen::Running => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(TransportError::Timeout(timeout));
                    }
                    debug!(physical_resource_id = %id, "joining in-flight invocation");
                    let (guard, _) = ledger
                        .changed
                        .wait_timeout(slots, remaining)
                        .map_err(|_| TransportError::Internal("function ledger lock poisoned".into()))?;
                    slots = guard;
                }
                Seen::Orphaned => {
                    if let Some(output) = hosted.handler.reconcile(&request.payload) {
                        info!(physical_resource_id = %id, is_error = output.is_error, "reconciled unsettled invocation");
                        // A failed reconcile keeps the marker so the next retry inspects again.
                        if !output.is_error {
                            ledger.settle_locked(&mut slots, &id, &digest, &output);
                            ledger.changed.notify_all();
                        }
                        return Ok(InvokeResponse {
                            deduplicated: !output.is_error,
                            payload: output.payload,
                            function_error: output.is_error,
                        });
                    }
                    debug!(physical_resource_id = %id, "unsettled invocation left nothing behind, running it");
                    break;
                }
                Seen::Free => break,
            }
        }
        slots.insert(
            id.clone(),
            Slot::InFlight(InFlightEntry {
                digest: digest.clone(),
                started_at: Utc::now(),
            }),
        );
        if let Err(err) = ledger.persist(&slots) {
            slots.remove(&id);
            return Err(TransportError::Internal(format!(
                "record in-flight invocation '{}': {}",
                id, err
            )));
        }
        drop(slots);

        let (tx, rx) = mpsc::channel();
        let handler = hosted.handler.clone();
        let worker_ledger = hosted.ledger.clone();
        let payload = request.payload.clone();
        let worker_id = id.clone();
        thread::Builder::new()
            .name(format!("fn-{}", request.function_name))
            .spawn(move || {
                let output = handler.handle(&payload);
                worker_ledger.settle(&worker_id, &digest, &output);
                let _ = tx.send(output);
            })
            .map_err(|e| TransportError::Internal(format!("spawn function worker: {}", e)))?;
        info!(function = %request.function_name, physical_resource_id = %id, "function started");

        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(output) => Ok(InvokeResponse {
                payload: output.payload,
                function_error: output.is_error,
                deduplicated: false,
            }),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(physical_resource_id = %id, ?timeout, "function still running after timeout");
                Err(TransportError::Timeout(timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(TransportError::Internal("function worker exited without a result".into()))
            }
        }
    }
}
