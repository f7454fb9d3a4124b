//! Cross Anchor payload layouts
//!
//! Instruction payload (origin -> destination):
//! `op_code (1) | sender (32) | op-specific...`, where ops flagged with an
//! incoming transfer carry the paired token transfer sequence at offset 33.
//!
//! Reply payload (destination -> origin):
//! `chain id (2) | recipient (32) | token transfer sequence (8) | instruction sequence (8)`.

use crate::envelope::{self, read_u64};
use crate::error::RelayError;
use crate::types::{ChainId, Sequence};

pub const FLAG_INCOMING_TRANSFER: u8 = 0b1000_0000;
pub const FLAG_OUTGOING_TRANSFER: u8 = 0b0100_0000;

const SENDER_INDEX: usize = 1;
const OP_SPECIFIC_INDEX: usize = 33;
const INSTRUCTION_SEQUENCE_INDEX: usize = 42;
const REPLY_LEN: usize = 50;

/// Parsed header of an instruction payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op_code: u8,
    pub sender: [u8; 32],
    /// Token transfer sequence the destination will require, for incoming-transfer ops
    pub expected_token_sequence: Option<Sequence>,
}

impl Instruction {
    pub fn parse(payload: &[u8]) -> Result<Self, RelayError> {
        if payload.len() < OP_SPECIFIC_INDEX {
            return Err(RelayError::MalformedPayload {
                needed: OP_SPECIFIC_INDEX,
                actual: payload.len(),
            });
        }

        let op_code = payload[0];
        let mut sender = [0u8; 32];
        sender.copy_from_slice(&payload[SENDER_INDEX..OP_SPECIFIC_INDEX]);

        let expected_token_sequence = if op_code & FLAG_INCOMING_TRANSFER != 0 {
            Some(read_u64(payload, OP_SPECIFIC_INDEX)?)
        } else {
            None
        };

        Ok(Self {
            op_code,
            sender,
            expected_token_sequence,
        })
    }

    pub fn has_incoming_transfer(&self) -> bool {
        self.op_code & FLAG_INCOMING_TRANSFER != 0
    }

    /// Whether the destination program will emit a reply message
    pub fn expects_reply(&self) -> bool {
        self.op_code & FLAG_OUTGOING_TRANSFER != 0
    }
}

/// Reply emitted by the destination program after processing an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyInfo {
    pub chain_id: ChainId,
    pub recipient: [u8; 32],
    /// Correlation sequence of the accompanying token transfer, if any
    pub token_sequence: Option<Sequence>,
    /// Incoming instruction this reply answers, when present in the payload
    pub instruction_sequence: Option<Sequence>,
}

impl ReplyInfo {
    pub fn parse(payload: &[u8]) -> Result<Self, RelayError> {
        if payload.len() < envelope::CORRELATION_SEQUENCE_OFFSET {
            return Err(RelayError::MalformedPayload {
                needed: envelope::CORRELATION_SEQUENCE_OFFSET,
                actual: payload.len(),
            });
        }

        let chain_id = ChainId(u16::from_be_bytes([payload[0], payload[1]]));
        let mut recipient = [0u8; 32];
        recipient.copy_from_slice(&payload[2..envelope::CORRELATION_SEQUENCE_OFFSET]);

        let token_sequence = if payload.len() >= INSTRUCTION_SEQUENCE_INDEX {
            Some(envelope::extract_correlation_sequence(payload)?)
        } else {
            None
        };
        let instruction_sequence = if payload.len() >= REPLY_LEN {
            Some(read_u64(payload, INSTRUCTION_SEQUENCE_INDEX)?)
        } else {
            None
        };

        Ok(Self {
            chain_id,
            recipient,
            token_sequence,
            instruction_sequence,
        })
    }
}
