//! Discovered-address registry
//!
//! A flat JSON object of contract addresses written by the deployment tooling.
//! The relayer only reads it, to fill addresses the environment leaves unset.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::RelayError;

pub const EVM_CORE_BRIDGE: &str = "evm_core_bridge";
pub const EVM_TOKEN_BRIDGE: &str = "evm_token_bridge";
pub const EVM_XANCHOR_BRIDGE: &str = "evm_xanchor_bridge";
pub const TERRA_TOKEN_BRIDGE: &str = "terra_token_bridge";
pub const TERRA_XANCHOR_BRIDGE: &str = "terra_xanchor_bridge";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct AddressRegistry {
    entries: HashMap<String, String>,
}

impl AddressRegistry {
    pub fn load(path: &Path) -> Result<Self, RelayError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("Failed to read registry {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, RelayError> {
        serde_json::from_str(raw)
            .map_err(|e| RelayError::Config(format!("Invalid address registry: {}", e)))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
