//! Relayer configuration
//!
//! Loaded once from the environment (and `.env` when present). Contract
//! addresses missing from the environment are taken from the optional
//! discovered-address registry at `ADDRESS_REGISTRY_PATH`.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use eyre::{eyre, Result, WrapErr};

use crate::orchestrator::{RelayRoute, RelaySettings};
use crate::registry::{self, AddressRegistry};
use crate::retry::RetryPolicy;
use crate::types::{ChainId, EmitterAddress};

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    /// Guardian REST endpoint serving signed envelopes
    pub guardian_rpc_url: String,
    pub evm: EvmConfig,
    pub terra: TerraConfig,
    pub relay: RelayConfig,
}

/// EVM (origin) configuration
#[derive(Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    /// Guardian-network id of the EVM chain (10001 for Ropsten)
    pub wormhole_chain_id: u16,
    pub core_bridge_address: String,
    pub token_bridge_address: String,
    pub xanchor_bridge_address: String,
    pub private_key: String,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for EvmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmConfig")
            .field("rpc_url", &self.rpc_url)
            .field("wormhole_chain_id", &self.wormhole_chain_id)
            .field("core_bridge_address", &self.core_bridge_address)
            .field("token_bridge_address", &self.token_bridge_address)
            .field("xanchor_bridge_address", &self.xanchor_bridge_address)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Terra (destination) configuration
#[derive(Clone)]
pub struct TerraConfig {
    pub lcd_url: String,
    pub chain_id: String,
    pub xanchor_bridge_address: String,
    pub token_bridge_address: String,
    pub mnemonic: String,
}

/// Custom Debug that redacts mnemonic to prevent accidental log leakage.
impl fmt::Debug for TerraConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerraConfig")
            .field("lcd_url", &self.lcd_url)
            .field("chain_id", &self.chain_id)
            .field("xanchor_bridge_address", &self.xanchor_bridge_address)
            .field("token_bridge_address", &self.token_bridge_address)
            .field("mnemonic", &"<redacted>")
            .finish()
    }
}

/// Timing and retry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub attestation_poll_interval_ms: u64,
    pub attestation_timeout_secs: u64,
    pub correlation_timeout_secs: u64,
    pub submit_max_retries: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            attestation_poll_interval_ms: 1000,
            attestation_timeout_secs: 600,
            correlation_timeout_secs: 600,
            submit_max_retries: 5,
        }
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} required", name))
}

/// Environment first, then the registry
fn address(name: &str, registry: &AddressRegistry, key: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => registry
            .get(key)
            .map(str::to_string)
            .ok_or_else(|| eyre!("{} required (not set in environment or address registry)", name)),
    }
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| eyre!("Invalid {}: {}", name, value)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment
    pub fn load() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded .env from {:?}", path);
        }

        let registry = match env::var("ADDRESS_REGISTRY_PATH") {
            Ok(path) => {
                let path = PathBuf::from(path);
                let registry = AddressRegistry::load(&path)
                    .wrap_err_with(|| format!("Failed to load address registry {}", path.display()))?;
                if registry.is_empty() {
                    tracing::warn!(path = %path.display(), "Address registry has no entries");
                } else {
                    tracing::debug!(entries = registry.len(), "Loaded address registry");
                }
                registry
            }
            Err(_) => AddressRegistry::default(),
        };

        let defaults = RelayConfig::default();

        let config = Self {
            guardian_rpc_url: required("GUARDIAN_RPC_URL")?,
            evm: EvmConfig {
                rpc_url: required("EVM_RPC_URL")?,
                wormhole_chain_id: parsed_or(
                    "EVM_WORMHOLE_CHAIN_ID",
                    ChainId::ETHEREUM_ROPSTEN.as_u16(),
                )?,
                core_bridge_address: address(
                    "EVM_CORE_BRIDGE_ADDRESS",
                    &registry,
                    registry::EVM_CORE_BRIDGE,
                )?,
                token_bridge_address: address(
                    "EVM_TOKEN_BRIDGE_ADDRESS",
                    &registry,
                    registry::EVM_TOKEN_BRIDGE,
                )?,
                xanchor_bridge_address: address(
                    "EVM_XANCHOR_BRIDGE_ADDRESS",
                    &registry,
                    registry::EVM_XANCHOR_BRIDGE,
                )?,
                private_key: required("EVM_PRIVATE_KEY")?,
            },
            terra: TerraConfig {
                lcd_url: required("TERRA_LCD_URL")?,
                chain_id: required("TERRA_CHAIN_ID")?,
                xanchor_bridge_address: address(
                    "TERRA_XANCHOR_BRIDGE_ADDRESS",
                    &registry,
                    registry::TERRA_XANCHOR_BRIDGE,
                )?,
                token_bridge_address: address(
                    "TERRA_TOKEN_BRIDGE_ADDRESS",
                    &registry,
                    registry::TERRA_TOKEN_BRIDGE,
                )?,
                mnemonic: required("TERRA_MNEMONIC")?,
            },
            relay: RelayConfig {
                attestation_poll_interval_ms: parsed_or(
                    "ATTESTATION_POLL_INTERVAL_MS",
                    defaults.attestation_poll_interval_ms,
                )?,
                attestation_timeout_secs: parsed_or(
                    "ATTESTATION_TIMEOUT_SECS",
                    defaults.attestation_timeout_secs,
                )?,
                correlation_timeout_secs: parsed_or(
                    "CORRELATION_TIMEOUT_SECS",
                    defaults.correlation_timeout_secs,
                )?,
                submit_max_retries: parsed_or("SUBMIT_MAX_RETRIES", defaults.submit_max_retries)?,
            },
        };

        // fail early on addresses that cannot become emitters
        config.route()?;
        Ok(config)
    }

    pub fn evm_chain(&self) -> ChainId {
        ChainId(self.evm.wormhole_chain_id)
    }

    /// EVM origin, Terra destination
    pub fn route(&self) -> Result<RelayRoute> {
        Ok(RelayRoute {
            origin_chain: self.evm_chain(),
            dest_chain: ChainId::TERRA,
            origin_instruction_emitter: EmitterAddress::from_evm(&self.evm.xanchor_bridge_address)
                .wrap_err("EVM_XANCHOR_BRIDGE_ADDRESS")?,
            origin_token_emitter: EmitterAddress::from_evm(&self.evm.token_bridge_address)
                .wrap_err("EVM_TOKEN_BRIDGE_ADDRESS")?,
            dest_instruction_emitter: EmitterAddress::from_terra(&self.terra.xanchor_bridge_address)
                .wrap_err("TERRA_XANCHOR_BRIDGE_ADDRESS")?,
            dest_token_emitter: EmitterAddress::from_terra(&self.terra.token_bridge_address)
                .wrap_err("TERRA_TOKEN_BRIDGE_ADDRESS")?,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.relay.attestation_poll_interval_ms)
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            attestation_timeout: Duration::from_secs(self.relay.attestation_timeout_secs),
            correlation_timeout: Duration::from_secs(self.relay.correlation_timeout_secs),
            submit_policy: RetryPolicy {
                max_retries: Some(self.relay.submit_max_retries),
                ..RetryPolicy::default()
            },
        }
    }

    /// Correlator backoff: starts at the poll interval, capped at 30s
    pub fn correlation_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: None,
            initial_backoff: self.poll_interval(),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 1.5,
        }
    }
}
