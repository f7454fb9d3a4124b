//! Common types for attestation relaying
//!
//! Chain identifiers, emitter addresses, sequences and the transfer legs the
//! orchestrator drives between the EVM side and Terra.

use bech32::FromBase32;
use serde::{Deserialize, Serialize};
use std::fmt;
use tiny_keccak::{Hasher, Keccak};

use crate::envelope::{self, DecodedEnvelope};
use crate::error::RelayError;

/// Per-emitter message counter assigned by the emitting chain
pub type Sequence = u64;

// ============================================================================
// Chain ID
// ============================================================================

/// Guardian-network chain identifier (2 bytes on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainId(pub u16);

impl ChainId {
    pub const ETHEREUM: ChainId = ChainId(2);
    pub const TERRA: ChainId = ChainId(3);
    pub const ETHEREUM_ROPSTEN: ChainId = ChainId(10001);

    /// Get the raw value
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Human readable chain name for logs and metric labels
    pub fn name(&self) -> &'static str {
        match *self {
            ChainId::ETHEREUM => "ethereum",
            ChainId::TERRA => "terra",
            ChainId::ETHEREUM_ROPSTEN => "ethereum_ropsten",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for ChainId {
    fn from(id: u16) -> Self {
        ChainId(id)
    }
}

// ============================================================================
// Emitter Address
// ============================================================================

/// 32-byte, left zero-padded address of the program that emitted a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmitterAddress(pub [u8; 32]);

impl EmitterAddress {
    /// Derive from a 0x-prefixed 20-byte EVM contract address
    pub fn from_evm(addr: &str) -> Result<Self, RelayError> {
        let hex_str = addr.strip_prefix("0x").unwrap_or(addr);
        if hex_str.len() != 40 {
            return Err(RelayError::Config(format!(
                "Invalid EVM address length: expected 40 hex chars, got {}",
                hex_str.len()
            )));
        }
        let bytes = hex::decode(hex_str)
            .map_err(|e| RelayError::Config(format!("Invalid EVM address {}: {}", addr, e)))?;
        Ok(Self::from_slice_padded(&bytes))
    }

    /// Derive from a bech32 Terra contract address (canonical bytes, left-padded)
    pub fn from_terra(addr: &str) -> Result<Self, RelayError> {
        let (_hrp, data, _variant) = bech32::decode(addr)
            .map_err(|e| RelayError::Config(format!("Invalid bech32 address {}: {}", addr, e)))?;
        let bytes = Vec::<u8>::from_base32(&data)
            .map_err(|e| RelayError::Config(format!("Invalid base32 data: {}", e)))?;
        if bytes.len() != 20 && bytes.len() != 32 {
            return Err(RelayError::Config(format!(
                "Invalid address length: expected 20 or 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self::from_slice_padded(&bytes))
    }

    /// Left-pad up to 32 bytes. Callers guarantee `bytes.len() <= 32`.
    fn from_slice_padded(bytes: &[u8]) -> Self {
        let mut out = [0u8; 32];
        out[32 - bytes.len()..].copy_from_slice(bytes);
        EmitterAddress(out)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex without prefix, the form the guardian REST API expects
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for EmitterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ============================================================================
// Signed Envelope
// ============================================================================

/// Raw guardian-signed envelope bytes, exactly as returned by the guardian network
#[derive(Clone, PartialEq, Eq)]
pub struct SignedEnvelope(Vec<u8>);

impl SignedEnvelope {
    pub fn new(bytes: Vec<u8>) -> Self {
        SignedEnvelope(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decode the fixed layout; no signature verification
    pub fn decode(&self) -> Result<DecodedEnvelope<'_>, RelayError> {
        envelope::decode(&self.0)
    }

    /// Double keccak256 of the body; the identity guardians sign over
    pub fn digest(&self) -> Result<[u8; 32], RelayError> {
        let decoded = self.decode()?;
        Ok(keccak256(&keccak256(decoded.body)))
    }
}

impl fmt::Debug for SignedEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignedEnvelope({} bytes)", self.0.len())
    }
}

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

// ============================================================================
// Transfer Legs
// ============================================================================

/// What a single origin submission emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegKind {
    /// A single instruction message
    MessageOnly,
    /// An instruction plus the token transfer it accounts for
    MessageWithTokenTransfer { token_sequence: Sequence },
}

/// One directed hop of a transfer. The sequence is never altered after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLeg {
    pub origin_chain: ChainId,
    pub dest_chain: ChainId,
    /// Sequence of the instruction message
    pub sequence: Sequence,
    pub kind: LegKind,
}

/// Message published by the origin chain's core bridge for one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedMessage {
    pub sender: EmitterAddress,
    pub sequence: Sequence,
}

impl TransferLeg {
    pub fn message_only(origin_chain: ChainId, dest_chain: ChainId, sequence: Sequence) -> Self {
        Self {
            origin_chain,
            dest_chain,
            sequence,
            kind: LegKind::MessageOnly,
        }
    }

    pub fn with_token_transfer(
        origin_chain: ChainId,
        dest_chain: ChainId,
        sequence: Sequence,
        token_sequence: Sequence,
    ) -> Self {
        Self {
            origin_chain,
            dest_chain,
            sequence,
            kind: LegKind::MessageWithTokenTransfer { token_sequence },
        }
    }

    /// Build a leg from the messages one origin submission published.
    ///
    /// Exactly one message must come from `instruction_emitter`; at most one
    /// from `token_emitter`. Anything else is rejected rather than guessed.
    pub fn from_published(
        origin_chain: ChainId,
        dest_chain: ChainId,
        messages: &[PublishedMessage],
        instruction_emitter: &EmitterAddress,
        token_emitter: &EmitterAddress,
    ) -> Result<Self, RelayError> {
        let mut instruction = None;
        let mut token = None;

        for message in messages {
            let slot = if message.sender == *instruction_emitter {
                &mut instruction
            } else if message.sender == *token_emitter {
                &mut token
            } else {
                return Err(RelayError::Chain(format!(
                    "unexpected message sender {} (sequence {})",
                    message.sender, message.sequence
                )));
            };
            if slot.replace(message.sequence).is_some() {
                return Err(RelayError::Chain(format!(
                    "submission published more than one message from {}",
                    message.sender
                )));
            }
        }

        let sequence = instruction.ok_or_else(|| {
            RelayError::Chain("submission published no instruction message".to_string())
        })?;

        Ok(match token {
            Some(token_sequence) => {
                Self::with_token_transfer(origin_chain, dest_chain, sequence, token_sequence)
            }
            None => Self::message_only(origin_chain, dest_chain, sequence),
        })
    }

    pub fn token_sequence(&self) -> Option<Sequence> {
        match self.kind {
            LegKind::MessageOnly => None,
            LegKind::MessageWithTokenTransfer { token_sequence } => Some(token_sequence),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitter(byte: u8) -> EmitterAddress {
        EmitterAddress([byte; 32])
    }

    #[test]
    fn test_emitter_from_evm_pads_left() {
        let addr = EmitterAddress::from_evm("0xdead00000000000000000000000000000000beef").unwrap();
        assert_eq!(&addr.0[..12], &[0u8; 12]);
        assert_eq!(addr.0[12], 0xde);
        assert_eq!(addr.0[31], 0xef);
    }

    #[test]
    fn test_emitter_from_evm_rejects_bad_length() {
        assert!(EmitterAddress::from_evm("0xdead").is_err());
    }

    #[test]
    fn test_emitter_from_terra() {
        use bech32::{ToBase32, Variant};
        let raw = [7u8; 20];
        let addr = bech32::encode("terra", raw.to_base32(), Variant::Bech32).unwrap();
        let emitter = EmitterAddress::from_terra(&addr).unwrap();
        assert_eq!(&emitter.0[..12], &[0u8; 12]);
        assert_eq!(&emitter.0[12..], &raw);
    }

    #[test]
    fn test_chain_id_names() {
        assert_eq!(ChainId::TERRA.name(), "terra");
        assert_eq!(ChainId(9999).name(), "unknown");
        assert_eq!(format!("{}", ChainId::ETHEREUM_ROPSTEN), "10001");
    }

    #[test]
    fn test_leg_from_published_pair() {
        let messages = [
            PublishedMessage {
                sender: emitter(2),
                sequence: 685,
            },
            PublishedMessage {
                sender: emitter(1),
                sequence: 46,
            },
        ];
        let leg = TransferLeg::from_published(
            ChainId::ETHEREUM_ROPSTEN,
            ChainId::TERRA,
            &messages,
            &emitter(1),
            &emitter(2),
        )
        .unwrap();
        assert_eq!(leg.sequence, 46);
        assert_eq!(leg.token_sequence(), Some(685));
    }

    #[test]
    fn test_leg_from_published_single() {
        let messages = [PublishedMessage {
            sender: emitter(1),
            sequence: 12,
        }];
        let leg = TransferLeg::from_published(
            ChainId::ETHEREUM_ROPSTEN,
            ChainId::TERRA,
            &messages,
            &emitter(1),
            &emitter(2),
        )
        .unwrap();
        assert_eq!(leg.kind, LegKind::MessageOnly);
    }

    #[test]
    fn test_leg_from_published_rejects_missing_instruction() {
        let messages = [PublishedMessage {
            sender: emitter(2),
            sequence: 685,
        }];
        let result = TransferLeg::from_published(
            ChainId::ETHEREUM_ROPSTEN,
            ChainId::TERRA,
            &messages,
            &emitter(1),
            &emitter(2),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_leg_from_published_rejects_unknown_sender() {
        let messages = [
            PublishedMessage {
                sender: emitter(1),
                sequence: 1,
            },
            PublishedMessage {
                sender: emitter(9),
                sequence: 2,
            },
        ];
        let result = TransferLeg::from_published(
            ChainId::ETHEREUM_ROPSTEN,
            ChainId::TERRA,
            &messages,
            &emitter(1),
            &emitter(2),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_keccak256_empty() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }
}
