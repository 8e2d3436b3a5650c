//! Core deploy logic: ordering, propagation, provisioning, control plane.

pub mod audit_log;
pub mod config;
pub mod control_plane;
pub mod credstore;
pub mod factory;
pub mod file_lock;
pub mod function_host;
pub mod graph;
pub mod invoker;
pub mod naming;
pub mod paths;
pub mod props;
pub mod provider;
pub mod state;
