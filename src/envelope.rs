//! Signed envelope codec
//!
//! Wire layout (big-endian):
//!
//! ```text
//! | version (1) | guardian set index (4) | signature count N (1) |
//! | N x signature record (66)                                   |
//! | body: timestamp (4) | nonce (4) | emitter chain (2) |
//! |       emitter address (32) | sequence (8) | consistency (1) |
//! |       payload (rest)                                        |
//! ```
//!
//! Decoding never verifies guardian signatures.

use crate::error::RelayError;
use crate::types::{ChainId, EmitterAddress, Sequence};

pub const HEADER_LEN: usize = 6;
pub const SIGNATURE_LEN: usize = 66;
/// Offset of the payload relative to the body start
pub const PAYLOAD_OFFSET: usize = 51;
/// Offset of the correlation sequence inside a reply payload
pub const CORRELATION_SEQUENCE_OFFSET: usize = 34;

const SIGNATURE_COUNT_INDEX: usize = 5;

/// Borrowed view of a decoded envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedEnvelope<'a> {
    pub signature_count: u8,
    pub body: &'a [u8],
    pub payload: &'a [u8],
}

/// Decode the fixed header and locate body and payload
pub fn decode(bytes: &[u8]) -> Result<DecodedEnvelope<'_>, RelayError> {
    if bytes.len() < HEADER_LEN {
        return Err(RelayError::MalformedEnvelope(format!(
            "header needs {} bytes, got {}",
            HEADER_LEN,
            bytes.len()
        )));
    }

    let signature_count = bytes[SIGNATURE_COUNT_INDEX];
    let body_offset = HEADER_LEN + signature_count as usize * SIGNATURE_LEN;
    let min_len = body_offset + PAYLOAD_OFFSET;
    if bytes.len() < min_len {
        return Err(RelayError::MalformedEnvelope(format!(
            "{} signatures need at least {} bytes, got {}",
            signature_count,
            min_len,
            bytes.len()
        )));
    }

    let body = &bytes[body_offset..];
    Ok(DecodedEnvelope {
        signature_count,
        body,
        payload: &body[PAYLOAD_OFFSET..],
    })
}

/// Read the big-endian u64 correlation sequence at offset 34 of a payload
pub fn extract_correlation_sequence(payload: &[u8]) -> Result<Sequence, RelayError> {
    read_u64(payload, CORRELATION_SEQUENCE_OFFSET)
}

pub(crate) fn read_u64(data: &[u8], offset: usize) -> Result<u64, RelayError> {
    let end = offset + 8;
    let slice = data.get(offset..end).ok_or(RelayError::MalformedPayload {
        needed: end,
        actual: data.len(),
    })?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(slice);
    Ok(u64::from_be_bytes(buf))
}

/// Fixed body fields. Decoding skips these; callers that need them parse the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeBody {
    pub timestamp: u32,
    pub nonce: u32,
    pub emitter_chain: ChainId,
    pub emitter_address: EmitterAddress,
    pub sequence: Sequence,
    pub consistency_level: u8,
}

impl EnvelopeBody {
    pub fn parse(body: &[u8]) -> Result<Self, RelayError> {
        if body.len() < PAYLOAD_OFFSET {
            return Err(RelayError::MalformedEnvelope(format!(
                "body needs {} bytes, got {}",
                PAYLOAD_OFFSET,
                body.len()
            )));
        }

        let mut emitter_address = [0u8; 32];
        emitter_address.copy_from_slice(&body[10..42]);

        Ok(Self {
            timestamp: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            nonce: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            emitter_chain: ChainId(u16::from_be_bytes([body[8], body[9]])),
            emitter_address: EmitterAddress(emitter_address),
            sequence: read_u64(body, 42)?,
            consistency_level: body[50],
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.emitter_chain.as_u16().to_be_bytes());
        out.extend_from_slice(self.emitter_address.as_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.push(self.consistency_level);
    }
}

/// Encode an envelope. Signature records are written as given.
pub fn encode(
    version: u8,
    guardian_set_index: u32,
    signatures: &[[u8; SIGNATURE_LEN]],
    body: &EnvelopeBody,
    payload: &[u8],
) -> Result<Vec<u8>, RelayError> {
    let count = u8::try_from(signatures.len()).map_err(|_| {
        RelayError::MalformedEnvelope(format!("too many signatures: {}", signatures.len()))
    })?;

    let mut out = Vec::with_capacity(
        HEADER_LEN + signatures.len() * SIGNATURE_LEN + PAYLOAD_OFFSET + payload.len(),
    );
    out.push(version);
    out.extend_from_slice(&guardian_set_index.to_be_bytes());
    out.push(count);
    for signature in signatures {
        out.extend_from_slice(signature);
    }
    body.write(&mut out);
    out.extend_from_slice(payload);
    Ok(out)
}
