//! Attestation Fetcher
//!
//! Polls an attestation source at a fixed interval until the guardian network
//! has signed the requested message or the deadline passes.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cancel::Cancellation;
use crate::envelope::EnvelopeBody;
use crate::error::RelayError;
use crate::metrics;
use crate::retry::pause;
use crate::types::{ChainId, EmitterAddress, Sequence, SignedEnvelope};

/// Default poll interval between attestation lookups
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Source of guardian-signed envelopes
#[async_trait]
pub trait AttestationSource: Send + Sync {
    /// Look up the signed envelope for a message.
    ///
    /// `Ok(None)` means the guardians have not signed it yet.
    async fn signed_envelope(
        &self,
        chain: ChainId,
        emitter: &EmitterAddress,
        sequence: Sequence,
    ) -> Result<Option<Vec<u8>>, RelayError>;
}

/// Polling fetcher over an [`AttestationSource`]. No caching: each call polls.
#[derive(Clone)]
pub struct AttestationFetcher {
    source: Arc<dyn AttestationSource>,
    poll_interval: Duration,
}

impl AttestationFetcher {
    pub fn new(source: Arc<dyn AttestationSource>) -> Self {
        Self {
            source,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Poll until the envelope for `(chain, emitter, sequence)` is available.
    ///
    /// Every lookup failure is retried until `deadline`. A returned envelope
    /// that does not decode, or names a different message, fails immediately.
    pub async fn fetch(
        &self,
        chain: ChainId,
        emitter: &EmitterAddress,
        sequence: Sequence,
        deadline: Instant,
        cancel: &Cancellation,
    ) -> Result<SignedEnvelope, RelayError> {
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            attempt += 1;

            match self.source.signed_envelope(chain, emitter, sequence).await {
                Ok(Some(bytes)) => {
                    metrics::record_fetch_attempt(chain.name(), true);
                    let envelope = SignedEnvelope::new(bytes);
                    verify_identity(&envelope, chain, emitter, sequence)?;
                    info!(
                        chain = %chain,
                        emitter = %emitter,
                        sequence = sequence,
                        attempt = attempt,
                        "Attestation available"
                    );
                    return Ok(envelope);
                }
                Ok(None) => {
                    metrics::record_fetch_attempt(chain.name(), false);
                    debug!(chain = %chain, sequence = sequence, attempt = attempt, "Attestation not signed yet");
                }
                Err(e) => {
                    metrics::record_fetch_attempt(chain.name(), false);
                    debug!(chain = %chain, sequence = sequence, attempt = attempt, error = %e, "Attestation lookup failed");
                }
            }

            if Instant::now() >= deadline {
                return Err(RelayError::AttestationTimeout {
                    chain,
                    emitter: *emitter,
                    sequence,
                });
            }
            pause(self.poll_interval, Some(deadline), cancel).await?;
        }
    }
}

/// The body must name exactly the message that was asked for
fn verify_identity(
    envelope: &SignedEnvelope,
    chain: ChainId,
    emitter: &EmitterAddress,
    sequence: Sequence,
) -> Result<(), RelayError> {
    let decoded = envelope.decode()?;
    let body = EnvelopeBody::parse(decoded.body)?;
    if body.emitter_chain != chain
        || body.emitter_address != *emitter
        || body.sequence != sequence
    {
        return Err(RelayError::MalformedEnvelope(format!(
            "requested {}/{}/{}, envelope carries {}/{}/{}",
            chain, emitter, sequence, body.emitter_chain, body.emitter_address, body.sequence
        )));
    }
    Ok(())
}
