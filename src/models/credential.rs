//! Credential identifiers and the write-once material wrapper.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// What the orchestrator is allowed to hold about a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeypairRef {
    pub name: String,
    pub location: String,
}

/// Private key material. Wiped on drop and redacted in `Debug`.
pub struct Material(Zeroizing<String>);

impl Material {
    pub fn new(pem: Zeroizing<String>) -> Self {
        Self(pem)
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Material(<redacted {} bytes>)", self.0.len())
    }
}

/// A freshly generated credential. Only lives inside the factory.
#[derive(Debug)]
pub struct Credential {
    pub name: String,
    pub location: String,
    pub material: Material,
}

impl Credential {
    /// Drop the material and keep the identifiers.
    pub fn into_ref(self) -> KeypairRef {
        KeypairRef {
            name: self.name,
            location: self.location,
        }
    }
}
