//! Unique-name generation for provisioned credentials.

use crate::constants;
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};

/// Produces the suffix that keeps generated names unique across deployments.
pub trait NameGenerator {
    fn suffix(&mut self) -> String;

    fn keypair_name(&mut self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.suffix())
    }
}

/// Random lowercase alphanumeric suffix from the OS RNG.
#[derive(Debug, Clone)]
pub struct RandomSuffix {
    len: usize,
}

impl Default for RandomSuffix {
    fn default() -> Self {
        Self {
            len: constants::NAME_SUFFIX_LEN,
        }
    }
}

impl RandomSuffix {
    pub fn with_len(len: usize) -> Self {
        Self { len: len.max(1) }
    }
}

impl NameGenerator for RandomSuffix {
    fn suffix(&mut self) -> String {
        OsRng
            .sample_iter(&Alphanumeric)
            .take(self.len)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect()
    }
}

/// Always returns the same suffix. Used for reproducible runs and tests.
#[derive(Debug, Clone)]
pub struct FixedSuffix(pub String);

impl NameGenerator for FixedSuffix {
    fn suffix(&mut self) -> String {
        self.0.clone()
    }
}
