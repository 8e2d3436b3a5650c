//! Permission policies for the deploy-time caller and the provisioning function.

use crate::constants;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySection {
    /// Actions the deploy-time invoker may perform.
    #[serde(default = "default_invoker_actions")]
    pub invoker_actions: Vec<String>,

    /// Actions the provisioning function's role may perform.
    #[serde(default = "default_function_actions")]
    pub function_actions: Vec<String>,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            invoker_actions: default_invoker_actions(),
            function_actions: default_function_actions(),
        }
    }
}

impl PolicySection {
    pub fn invoker_role(&self) -> RolePolicy {
        RolePolicy::new("deploy-invoker", self.invoker_actions.clone())
    }

    pub fn function_role(&self) -> RolePolicy {
        RolePolicy::new("keypair-function", self.function_actions.clone())
    }
}

fn default_invoker_actions() -> Vec<String> {
    vec![constants::ACTION_INVOKE.to_string()]
}

fn default_function_actions() -> Vec<String> {
    vec![
        constants::ACTION_KEYPAIR_CREATE.to_string(),
        constants::ACTION_SECRET_CREATE.to_string(),
    ]
}

/// A named set of allowed actions. `*` allows everything, `service:*`
/// allows every action of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolePolicy {
    pub name: String,
    pub allowed_actions: Vec<String>,
}

impl RolePolicy {
    pub fn new(name: impl Into<String>, allowed_actions: Vec<String>) -> Self {
        Self {
            name: name.into(),
            allowed_actions,
        }
    }

    pub fn allow_all(name: impl Into<String>) -> Self {
        Self::new(name, vec!["*".to_string()])
    }

    pub fn is_allowed(&self, action: &str) -> bool {
        self.allowed_actions.iter().any(|granted| {
            if granted == "*" || granted == action {
                return true;
            }
            match granted.strip_suffix(":*") {
                Some(service) => action
                    .split_once(':')
                    .map(|(svc, _)| svc == service)
                    .unwrap_or(false),
                None => false,
            }
        })
    }
}
