//! Relay error taxonomy

use thiserror::Error;

use crate::types::{ChainId, EmitterAddress, Sequence};

/// Errors produced by the relay core and its chain adapters
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Envelope buffer too short or internally inconsistent
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Payload too short for the field being read
    #[error("Malformed payload: need {needed} bytes, got {actual}")]
    MalformedPayload { needed: usize, actual: usize },

    #[error("Attestation not available for {chain}/{emitter}/{sequence} before deadline")]
    AttestationTimeout {
        chain: ChainId,
        emitter: EmitterAddress,
        sequence: Sequence,
    },

    #[error("Reply sequence for incoming sequence {incoming} from chain {chain} not assigned before deadline")]
    CorrelationTimeout { chain: ChainId, incoming: Sequence },

    /// Reply payload points at a different instruction than the one correlated on
    #[error("Reply correlates to instruction {actual}, expected {expected}")]
    CorrelationMismatch { expected: Sequence, actual: Sequence },

    #[error("Operation cancelled")]
    Cancelled,

    /// Network failure, timeout or not-found; safe to retry
    #[error("Transport error: {0}")]
    Transport(String),

    /// The destination program refused the submission; reason kept verbatim
    #[error("Submission rejected: {reason}")]
    Rejected { reason: String },

    /// Any other chain adapter failure (bad response shape, signing, encoding)
    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        RelayError::Transport(err.to_string())
    }

    pub fn chain(err: impl std::fmt::Display) -> Self {
        RelayError::Chain(err.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RelayError::Chain(format!("Failed to parse response: {}", err))
        } else {
            RelayError::Transport(err.to_string())
        }
    }
}
