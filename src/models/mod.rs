//! Data structures shared across core and cli.

pub mod credential;
pub mod deploy_config;
pub mod invocation;
pub mod policy;
