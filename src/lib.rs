//! Cross Anchor Relayer - Library interface
//!
//! Relays guardian-signed messages between an EVM chain and Terra Classic:
//! fetches attestations, decodes envelopes, correlates reply sequences and
//! drives one-way and round-trip legs to completion.
//!
//! Re-exports internal modules for use in integration tests.

pub mod cancel;
pub mod config;
pub mod correlator;
pub mod envelope;
pub mod error;
pub mod evm;
pub mod fetcher;
pub mod guardian;
pub mod instruction;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod submit;
pub mod terra;
pub mod types;

pub use cancel::{CancelHandle, Cancellation};
pub use error::RelayError;
pub use orchestrator::{RelayOrchestrator, RelayRequest, RelayState};
pub use types::{ChainId, EmitterAddress, Sequence, SignedEnvelope, TransferLeg};
