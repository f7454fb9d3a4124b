//! Sequence Correlator
//!
//! Reads the destination program's record of which outgoing sequence it
//! assigned while processing an incoming instruction. The mapping is written
//! once by the destination program; this module only reads it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::Cancellation;
use crate::error::RelayError;
use crate::metrics;
use crate::retry::{classify, pause, ErrorClass, RetryPolicy};
use crate::types::{ChainId, Sequence};

/// Destination program's record for one incoming instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceInfo {
    /// False when processing the instruction never produces a reply
    pub outgoing_sequence_expected: bool,
    pub outgoing_sequence: Option<Sequence>,
}

/// Read-only `sequence_info` query against a destination program
#[async_trait]
pub trait SequenceInfoSource: Send + Sync {
    /// `Ok(None)` when the incoming sequence has not been processed yet
    async fn sequence_info(
        &self,
        origin_chain: ChainId,
        incoming: Sequence,
    ) -> Result<Option<SequenceInfo>, RelayError>;
}

/// Outcome of waiting for a reply assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySequence {
    Assigned(Sequence),
    /// The instruction was processed and no reply will be emitted
    NotExpected,
}

pub struct SequenceCorrelator {
    source: Arc<dyn SequenceInfoSource>,
    policy: RetryPolicy,
}

impl SequenceCorrelator {
    /// `policy` shapes the poll backoff; the deadline passed to
    /// [`wait_for_reply_sequence`](Self::wait_for_reply_sequence) bounds it
    pub fn new(source: Arc<dyn SequenceInfoSource>, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    /// Single non-blocking query: the reply sequence assigned for `incoming`, if any
    pub async fn query_reply_sequence(
        &self,
        origin_chain: ChainId,
        incoming: Sequence,
    ) -> Result<Option<Sequence>, RelayError> {
        let info = self.source.sequence_info(origin_chain, incoming).await?;
        Ok(info.and_then(|i| i.outgoing_sequence))
    }

    /// Poll until the destination reports the reply sequence for `incoming`.
    ///
    /// Never derives a sequence on its own: it either returns what the
    /// destination recorded or fails with `CorrelationTimeout`.
    pub async fn wait_for_reply_sequence(
        &self,
        origin_chain: ChainId,
        incoming: Sequence,
        deadline: Instant,
        cancel: &Cancellation,
    ) -> Result<ReplySequence, RelayError> {
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }

            match self.source.sequence_info(origin_chain, incoming).await {
                Ok(Some(SequenceInfo {
                    outgoing_sequence_expected: false,
                    ..
                })) => {
                    metrics::record_correlator_poll(origin_chain.name(), true);
                    info!(incoming = incoming, "Destination expects no reply");
                    return Ok(ReplySequence::NotExpected);
                }
                Ok(Some(SequenceInfo {
                    outgoing_sequence: Some(reply),
                    ..
                })) => {
                    metrics::record_correlator_poll(origin_chain.name(), true);
                    info!(incoming = incoming, reply = reply, attempt = attempt, "Reply sequence assigned");
                    return Ok(ReplySequence::Assigned(reply));
                }
                Ok(_) => {
                    metrics::record_correlator_poll(origin_chain.name(), false);
                    debug!(incoming = incoming, attempt = attempt, "Reply sequence not assigned yet");
                }
                Err(e) if classify(&e) == ErrorClass::Transient => {
                    metrics::record_correlator_poll(origin_chain.name(), false);
                    warn!(incoming = incoming, attempt = attempt, error = %e, "sequence_info query failed");
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(RelayError::CorrelationTimeout {
                    chain: origin_chain,
                    incoming,
                });
            }
            pause(self.policy.backoff_for_attempt(attempt), Some(deadline), cancel).await?;
            attempt = attempt.saturating_add(1);
        }
    }
}
