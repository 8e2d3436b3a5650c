//! Ordered deployment of infrastructure units with idempotent keypair
//! provisioning.
//!
//! Units apply one at a time in dependency order and publish write-once
//! outputs that only their dependents can see. The keypair unit provisions
//! an SSH keypair through a remote function keyed by a stable physical
//! resource id; the private key goes straight to the secret store and only
//! its name and location come back.
//!
//! ## Modules
//! - `cli` — Command-line handlers
//! - `core` — Graph, propagation, invoker, factory, control-plane stores
//! - `models` — Data structures and wire formats
//! - `units` — The standard network, keypair, systems and manager units
//! - `util` — Filesystem and path helpers

pub mod cli;
pub mod constants;
pub mod core;
pub mod error;
pub mod models;
pub mod units;
pub mod util;
