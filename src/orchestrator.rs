//! Relay Orchestrator
//!
//! Drives a [`RelayRequest`] through attestation, submission and, for round
//! trips, reply correlation:
//!
//! ```text
//! Pending -> AwaitingAttestation -> AttestationReady -> Submitting
//!         -> [AwaitingReply -> AwaitingAttestation -> ... -> Submitting]
//!         -> Applied | AlreadyApplied | Failed
//! ```
//!
//! Legs that reached `Applied` or `AlreadyApplied` are never resubmitted, so a
//! failed request can be run again and resumes at its first incomplete leg.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cancel::Cancellation;
use crate::correlator::{ReplySequence, SequenceCorrelator};
use crate::error::RelayError;
use crate::fetcher::AttestationFetcher;
use crate::instruction::{Instruction, ReplyInfo};
use crate::metrics;
use crate::retry::{classify, with_retry, ErrorClass, RetryPolicy};
use crate::submit::Submitter;
use crate::types::{ChainId, EmitterAddress, LegKind, Sequence, SignedEnvelope, TransferLeg};

// ============================================================================
// Request State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayShape {
    OneWay,
    RoundTrip,
}

/// Cumulative state of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayState {
    Pending,
    AwaitingAttestation { chain: ChainId, sequence: Sequence },
    AttestationReady,
    Submitting,
    AwaitingReply { incoming: Sequence },
    Applied,
    AlreadyApplied,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegStatus {
    Pending,
    Applied,
    AlreadyApplied,
    Failed(String),
}

impl LegStatus {
    /// Accepted by the destination, one way or the other
    pub fn is_done(&self) -> bool {
        matches!(self, LegStatus::Applied | LegStatus::AlreadyApplied)
    }
}

/// Progress of one leg
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegRecord {
    pub leg: TransferLeg,
    pub status: LegStatus,
    /// Digest of the instruction envelope last submitted for this leg
    pub digest: Option<[u8; 32]>,
    pub updated_at: DateTime<Utc>,
}

impl LegRecord {
    fn new(leg: TransferLeg) -> Self {
        Self {
            leg,
            status: LegStatus::Pending,
            digest: None,
            updated_at: Utc::now(),
        }
    }

    fn set_status(&mut self, status: LegStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Unit of work owned by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    shape: RelayShape,
    legs: Vec<LegRecord>,
    state: RelayState,
}

impl RelayRequest {
    pub fn one_way(leg: TransferLeg) -> Self {
        Self::new(RelayShape::OneWay, leg)
    }

    /// The reply leg is discovered and appended while running
    pub fn round_trip(leg: TransferLeg) -> Self {
        Self::new(RelayShape::RoundTrip, leg)
    }

    fn new(shape: RelayShape, leg: TransferLeg) -> Self {
        Self {
            shape,
            legs: vec![LegRecord::new(leg)],
            state: RelayState::Pending,
        }
    }

    pub fn shape(&self) -> RelayShape {
        self.shape
    }

    pub fn legs(&self) -> &[LegRecord] {
        &self.legs
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Chains and emitters of one bridge deployment pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayRoute {
    pub origin_chain: ChainId,
    pub dest_chain: ChainId,
    /// Cross Anchor bridge on the origin chain
    pub origin_instruction_emitter: EmitterAddress,
    /// Token bridge on the origin chain
    pub origin_token_emitter: EmitterAddress,
    /// Cross Anchor bridge on the destination chain; emits replies
    pub dest_instruction_emitter: EmitterAddress,
    /// Token bridge on the destination chain
    pub dest_token_emitter: EmitterAddress,
}

impl RelayRoute {
    /// (instruction emitter, token emitter) for messages emitted on `chain`
    fn emitters_on(&self, chain: ChainId) -> Result<(EmitterAddress, EmitterAddress), RelayError> {
        if chain == self.origin_chain {
            Ok((self.origin_instruction_emitter, self.origin_token_emitter))
        } else if chain == self.dest_chain {
            Ok((self.dest_instruction_emitter, self.dest_token_emitter))
        } else {
            Err(RelayError::Config(format!("chain {} is not on this route", chain)))
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub attestation_timeout: Duration,
    pub correlation_timeout: Duration,
    pub submit_policy: RetryPolicy,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            attestation_timeout: Duration::from_secs(600),
            correlation_timeout: Duration::from_secs(600),
            submit_policy: RetryPolicy::default(),
        }
    }
}

pub struct RelayOrchestrator {
    fetcher: AttestationFetcher,
    correlator: SequenceCorrelator,
    /// Submits to `route.dest_chain`
    dest_submitter: Arc<dyn Submitter>,
    /// Submits replies back to `route.origin_chain`
    origin_submitter: Arc<dyn Submitter>,
    route: RelayRoute,
    settings: RelaySettings,
}

impl RelayOrchestrator {
    /// Fails if a submitter targets a chain other than its side of `route`
    pub fn new(
        fetcher: AttestationFetcher,
        correlator: SequenceCorrelator,
        dest_submitter: Arc<dyn Submitter>,
        origin_submitter: Arc<dyn Submitter>,
        route: RelayRoute,
        settings: RelaySettings,
    ) -> Result<Self, RelayError> {
        if dest_submitter.chain() != route.dest_chain {
            return Err(RelayError::Config(format!(
                "destination submitter targets {}, route destination is {}",
                dest_submitter.chain(),
                route.dest_chain
            )));
        }
        if origin_submitter.chain() != route.origin_chain {
            return Err(RelayError::Config(format!(
                "origin submitter targets {}, route origin is {}",
                origin_submitter.chain(),
                route.origin_chain
            )));
        }

        Ok(Self {
            fetcher,
            correlator,
            dest_submitter,
            origin_submitter,
            route,
            settings,
        })
    }

    /// Run `request` to a terminal state.
    ///
    /// Returns the terminal success state, or the error that moved the request
    /// to `Failed`. A finished request is returned as-is.
    pub async fn run(
        &self,
        request: &mut RelayRequest,
        cancel: &Cancellation,
    ) -> Result<RelayState, RelayError> {
        if matches!(request.state, RelayState::Applied | RelayState::AlreadyApplied) {
            return Ok(request.state.clone());
        }
        request.state = RelayState::Pending;

        match self.drive(request, cancel).await {
            Ok(()) => {
                let all_duplicates = request
                    .legs
                    .iter()
                    .all(|record| record.status == LegStatus::AlreadyApplied);
                request.state = if all_duplicates {
                    RelayState::AlreadyApplied
                } else {
                    RelayState::Applied
                };
                info!(
                    shape = ?request.shape,
                    legs = request.legs.len(),
                    state = ?request.state,
                    "Relay request complete"
                );
                Ok(request.state.clone())
            }
            Err(e) => {
                error!(error = %e, state = ?request.state, "Relay request failed");
                request.state = RelayState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn drive(&self, request: &mut RelayRequest, cancel: &Cancellation) -> Result<(), RelayError> {
        if !request.legs[0].status.is_done() {
            self.relay_leg(request, 0, None, cancel).await?;
        }

        if request.shape == RelayShape::OneWay {
            return Ok(());
        }

        if request.legs.len() < 2 {
            let outbound = request.legs[0].leg;
            match self.discover_reply(request, &outbound, cancel).await? {
                Some((reply_leg, envelope)) => {
                    request.legs.push(LegRecord::new(reply_leg));
                    self.relay_leg(request, 1, Some(envelope), cancel).await?;
                }
                None => return Ok(()),
            }
        } else if !request.legs[1].status.is_done() {
            self.relay_leg(request, 1, None, cancel).await?;
        }

        Ok(())
    }

    /// Wait for the destination to assign the reply sequence, then fetch the
    /// reply and build the leg that carries it back.
    ///
    /// `None` when the destination reports that no reply will be emitted.
    async fn discover_reply(
        &self,
        request: &mut RelayRequest,
        outbound: &TransferLeg,
        cancel: &Cancellation,
    ) -> Result<Option<(TransferLeg, SignedEnvelope)>, RelayError> {
        request.state = RelayState::AwaitingReply {
            incoming: outbound.sequence,
        };
        let deadline = Instant::now() + self.settings.correlation_timeout;
        let reply_sequence = match self
            .correlator
            .wait_for_reply_sequence(outbound.origin_chain, outbound.sequence, deadline, cancel)
            .await?
        {
            ReplySequence::Assigned(sequence) => sequence,
            ReplySequence::NotExpected => {
                info!(incoming = outbound.sequence, "No reply expected; round trip ends here");
                return Ok(None);
            }
        };

        let reply_chain = outbound.dest_chain;
        let (reply_emitter, _) = self.route.emitters_on(reply_chain)?;
        request.state = RelayState::AwaitingAttestation {
            chain: reply_chain,
            sequence: reply_sequence,
        };
        let envelope = self
            .fetcher
            .fetch(
                reply_chain,
                &reply_emitter,
                reply_sequence,
                Instant::now() + self.settings.attestation_timeout,
                cancel,
            )
            .await?;

        let reply = ReplyInfo::parse(envelope.decode()?.payload)?;
        if let Some(actual) = reply.instruction_sequence {
            if actual != outbound.sequence {
                return Err(RelayError::CorrelationMismatch {
                    expected: outbound.sequence,
                    actual,
                });
            }
        }

        let leg = match reply.token_sequence {
            Some(token_sequence) => TransferLeg::with_token_transfer(
                reply_chain,
                outbound.origin_chain,
                reply_sequence,
                token_sequence,
            ),
            None => TransferLeg::message_only(reply_chain, outbound.origin_chain, reply_sequence),
        };
        debug!(reply = reply_sequence, token_sequence = ?reply.token_sequence, "Reply leg discovered");
        Ok(Some((leg, envelope)))
    }

    /// Fetch, check and submit one leg, recording the outcome on its record
    async fn relay_leg(
        &self,
        request: &mut RelayRequest,
        index: usize,
        prefetched: Option<SignedEnvelope>,
        cancel: &Cancellation,
    ) -> Result<(), RelayError> {
        let leg = request.legs[index].leg;
        let result = self.deliver(request, index, prefetched, cancel).await;

        let record = &mut request.legs[index];
        match result {
            Ok(()) => Ok(()),
            Err(e) if classify(&e) == ErrorClass::AlreadyApplied => {
                info!(
                    dest_chain = %leg.dest_chain,
                    sequence = leg.sequence,
                    reason = %e,
                    "Leg already applied at destination"
                );
                metrics::record_leg_already_applied(leg.dest_chain.name());
                record.set_status(LegStatus::AlreadyApplied);
                Ok(())
            }
            Err(e) => {
                metrics::record_leg_failed(leg.dest_chain.name());
                record.set_status(LegStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn deliver(
        &self,
        request: &mut RelayRequest,
        index: usize,
        prefetched: Option<SignedEnvelope>,
        cancel: &Cancellation,
    ) -> Result<(), RelayError> {
        let leg = request.legs[index].leg;
        let (instruction_emitter, token_emitter) = self.route.emitters_on(leg.origin_chain)?;
        let deadline = Instant::now() + self.settings.attestation_timeout;

        request.state = RelayState::AwaitingAttestation {
            chain: leg.origin_chain,
            sequence: leg.sequence,
        };
        let fetcher = &self.fetcher;
        let fetch_instruction = async move {
            match prefetched {
                Some(envelope) => Ok(envelope),
                None => {
                    fetcher
                        .fetch(leg.origin_chain, &instruction_emitter, leg.sequence, deadline, cancel)
                        .await
                }
            }
        };
        let (instruction, token_transfer) = match leg.kind {
            LegKind::MessageOnly => (fetch_instruction.await?, None),
            LegKind::MessageWithTokenTransfer { token_sequence } => {
                let fetch_token = self.fetcher.fetch(
                    leg.origin_chain,
                    &token_emitter,
                    token_sequence,
                    deadline,
                    cancel,
                );
                let (instruction, token) = try_join(fetch_instruction, fetch_token).await?;
                (instruction, Some(token))
            }
        };
        request.state = RelayState::AttestationReady;

        if leg.origin_chain == self.route.origin_chain {
            check_instruction_pairing(&leg, &instruction)?;
        }

        let digest = instruction.digest()?;
        request.legs[index].digest = Some(digest);

        request.state = RelayState::Submitting;
        let submitter: &dyn Submitter = if leg.dest_chain == self.route.dest_chain {
            self.dest_submitter.as_ref()
        } else {
            self.origin_submitter.as_ref()
        };
        let instruction_bytes = instruction.as_bytes();
        let token_bytes = token_transfer.as_ref().map(|t| t.as_bytes());

        info!(
            dest_chain = %leg.dest_chain,
            sequence = leg.sequence,
            token_sequence = ?leg.token_sequence(),
            digest = %hex::encode(digest),
            "Submitting leg"
        );
        let receipt = with_retry(&self.settings.submit_policy, None, cancel, move |attempt| {
            if attempt > 0 {
                warn!(attempt = attempt, sequence = leg.sequence, "Resubmitting leg");
            }
            submitter.submit(instruction_bytes, token_bytes)
        })
        .await?;

        info!(
            dest_chain = %leg.dest_chain,
            sequence = leg.sequence,
            tx_hash = %receipt.tx_hash,
            "Leg applied"
        );
        metrics::record_leg_applied(leg.dest_chain.name());
        request.legs[index].set_status(LegStatus::Applied);
        Ok(())
    }
}

/// An incoming-transfer instruction names the token transfer it must be paired with
fn check_instruction_pairing(leg: &TransferLeg, instruction: &SignedEnvelope) -> Result<(), RelayError> {
    let Some(token_sequence) = leg.token_sequence() else {
        return Ok(());
    };
    let parsed = Instruction::parse(instruction.decode()?.payload)?;
    match parsed.expected_token_sequence {
        Some(expected) if expected != token_sequence => Err(RelayError::CorrelationMismatch {
            expected,
            actual: token_sequence,
        }),
        _ => Ok(()),
    }
}
