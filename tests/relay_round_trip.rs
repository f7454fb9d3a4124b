//! End-to-end relay tests
//!
//! The stubbed tests drive a full EVM -> Terra -> EVM round trip through the
//! public library API against an in-memory network: the Terra stub processes
//! each delivered instruction, assigns a reply sequence and has the guardians
//! sign the reply, exactly as the live destination program would.
//!
//! The live test needs a guardian REST endpoint:
//! cargo test --test relay_round_trip -- --ignored --nocapture
//!
//! Environment for the live test:
//! - GUARDIAN_RPC_URL (default: http://localhost:7071)
//! - LIVE_EMITTER_CHAIN, LIVE_EMITTER_ADDRESS, LIVE_SEQUENCE (required)

use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_test::assert_ok;

use xanchor_relayer::correlator::{SequenceCorrelator, SequenceInfo, SequenceInfoSource};
use xanchor_relayer::envelope::{self, EnvelopeBody, SIGNATURE_LEN};
use xanchor_relayer::fetcher::{AttestationFetcher, AttestationSource};
use xanchor_relayer::guardian::GuardianRestClient;
use xanchor_relayer::orchestrator::{LegStatus, RelayRoute, RelaySettings};
use xanchor_relayer::retry::RetryPolicy;
use xanchor_relayer::submit::{SubmitReceipt, Submitter};
use xanchor_relayer::{
    Cancellation, ChainId, EmitterAddress, RelayError, RelayOrchestrator, RelayRequest,
    RelayState, Sequence, SignedEnvelope, TransferLeg,
};

const EVM: ChainId = ChainId::ETHEREUM_ROPSTEN;
const TERRA: ChainId = ChainId::TERRA;

const INSTRUCTION_SEQUENCE: Sequence = 46;
const TOKEN_SEQUENCE: Sequence = 685;
const REPLY_SEQUENCE: Sequence = 901;
const REPLY_TOKEN_SEQUENCE: Sequence = 1200;

/// Deposit op with an incoming token transfer whose result is sent back
const OP_DEPOSIT_STABLE: u8 = 0x80 | 0x40 | 0x01;

fn route() -> RelayRoute {
    RelayRoute {
        origin_chain: EVM,
        dest_chain: TERRA,
        origin_instruction_emitter: EmitterAddress([0x11; 32]),
        origin_token_emitter: EmitterAddress([0x22; 32]),
        dest_instruction_emitter: EmitterAddress([0x33; 32]),
        dest_token_emitter: EmitterAddress([0x44; 32]),
    }
}

fn sign(chain: ChainId, emitter: EmitterAddress, sequence: Sequence, payload: &[u8]) -> Vec<u8> {
    let body = EnvelopeBody {
        timestamp: 1_650_000_000,
        nonce: 0,
        emitter_chain: chain,
        emitter_address: emitter,
        sequence,
        consistency_level: 15,
    };
    envelope::encode(1, 2, &[[0xab; SIGNATURE_LEN], [0xcd; SIGNATURE_LEN]], &body, payload)
        .unwrap()
}

fn deposit_instruction() -> Vec<u8> {
    [
        vec![OP_DEPOSIT_STABLE],
        vec![0x99; 32],
        TOKEN_SEQUENCE.to_be_bytes().to_vec(),
    ]
    .concat()
}

fn reply_payload(instruction_sequence: Sequence) -> Vec<u8> {
    [
        EVM.as_u16().to_be_bytes().to_vec(),
        vec![0x99; 32],
        REPLY_TOKEN_SEQUENCE.to_be_bytes().to_vec(),
        instruction_sequence.to_be_bytes().to_vec(),
    ]
    .concat()
}

// ============================================================================
// In-memory network
// ============================================================================

#[derive(Default)]
struct Network {
    signed: Mutex<HashMap<(ChainId, EmitterAddress, Sequence), Vec<u8>>>,
    sequence_info: Mutex<HashMap<Sequence, SequenceInfo>>,
    sequence_info_polls: AtomicUsize,
}

impl Network {
    fn publish(&self, chain: ChainId, emitter: EmitterAddress, sequence: Sequence, payload: &[u8]) {
        self.signed
            .lock()
            .unwrap()
            .insert((chain, emitter, sequence), sign(chain, emitter, sequence, payload));
    }

    fn signed(&self, chain: ChainId, emitter: EmitterAddress, sequence: Sequence) -> Vec<u8> {
        self.signed.lock().unwrap()[&(chain, emitter, sequence)].clone()
    }

    /// Origin submission: token transfer first, then the instruction
    fn origin_deposit(&self) {
        self.publish(EVM, route().origin_token_emitter, TOKEN_SEQUENCE, &[0xee; 133]);
        self.publish(EVM, route().origin_instruction_emitter, INSTRUCTION_SEQUENCE, &deposit_instruction());
    }
}

#[async_trait]
impl AttestationSource for Network {
    async fn signed_envelope(
        &self,
        chain: ChainId,
        emitter: &EmitterAddress,
        sequence: Sequence,
    ) -> Result<Option<Vec<u8>>, RelayError> {
        Ok(self.signed.lock().unwrap().get(&(chain, *emitter, sequence)).cloned())
    }
}

#[async_trait]
impl SequenceInfoSource for Network {
    async fn sequence_info(
        &self,
        _origin_chain: ChainId,
        incoming: Sequence,
    ) -> Result<Option<SequenceInfo>, RelayError> {
        self.sequence_info_polls.fetch_add(1, Ordering::SeqCst);
        Ok(self.sequence_info.lock().unwrap().get(&incoming).copied())
    }
}

/// Terra bridge: processes delivered instructions and emits replies
struct TerraStub {
    network: Arc<Network>,
    emits_replies: bool,
    delivered: Mutex<Vec<Sequence>>,
}

#[async_trait]
impl Submitter for TerraStub {
    fn chain(&self) -> ChainId {
        TERRA
    }

    async fn submit(
        &self,
        instruction: &[u8],
        token_transfer: Option<&[u8]>,
    ) -> Result<SubmitReceipt, RelayError> {
        assert!(token_transfer.is_some(), "deposit must carry its token transfer");
        let decoded = envelope::decode(instruction)?;
        let incoming = EnvelopeBody::parse(decoded.body)?.sequence;
        self.delivered.lock().unwrap().push(incoming);

        if self.emits_replies {
            self.network.publish(TERRA, route().dest_token_emitter, REPLY_TOKEN_SEQUENCE, &[0xdd; 133]);
            self.network.publish(
                TERRA,
                route().dest_instruction_emitter,
                REPLY_SEQUENCE,
                &reply_payload(incoming),
            );
            // the reply becomes queryable a little after the tx lands
            let network = self.network.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                network.sequence_info.lock().unwrap().insert(
                    incoming,
                    SequenceInfo {
                        outgoing_sequence_expected: true,
                        outgoing_sequence: Some(REPLY_SEQUENCE),
                    },
                );
            });
        }

        Ok(SubmitReceipt {
            tx_hash: format!("{:064X}", incoming),
        })
    }
}

/// EVM bridge: answers with a scripted outcome and records what it got
struct EvmStub {
    outcome: Mutex<Option<RelayError>>,
    calls: Mutex<Vec<(Vec<u8>, Option<Vec<u8>>)>>,
}

impl EvmStub {
    fn accepting() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn rejecting(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(Some(RelayError::Rejected {
                reason: reason.to_string(),
            })),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Submitter for EvmStub {
    fn chain(&self) -> ChainId {
        EVM
    }

    async fn submit(
        &self,
        instruction: &[u8],
        token_transfer: Option<&[u8]>,
    ) -> Result<SubmitReceipt, RelayError> {
        self.calls
            .lock()
            .unwrap()
            .push((instruction.to_vec(), token_transfer.map(<[u8]>::to_vec)));
        match self.outcome.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(SubmitReceipt {
                tx_hash: "0xfeed".to_string(),
            }),
        }
    }
}

fn settings() -> RelaySettings {
    RelaySettings {
        attestation_timeout: Duration::from_secs(2),
        correlation_timeout: Duration::from_secs(2),
        submit_policy: RetryPolicy {
            max_retries: Some(2),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        },
    }
}

fn orchestrator(network: &Arc<Network>, terra: Arc<TerraStub>, evm: Arc<EvmStub>) -> RelayOrchestrator {
    assert_ok!(RelayOrchestrator::new(
        AttestationFetcher::new(network.clone()).with_poll_interval(Duration::from_millis(2)),
        SequenceCorrelator::new(
            network.clone(),
            RetryPolicy::fixed_interval(Duration::from_millis(5)),
        ),
        terra,
        evm,
        route(),
        settings(),
    ))
}

fn terra_stub(network: &Arc<Network>, emits_replies: bool) -> Arc<TerraStub> {
    Arc::new(TerraStub {
        network: network.clone(),
        emits_replies,
        delivered: Mutex::new(Vec::new()),
    })
}

/// The leg the binary builds from the origin receipt
fn origin_leg() -> TransferLeg {
    use xanchor_relayer::types::PublishedMessage;

    let messages = [
        PublishedMessage {
            sender: route().origin_token_emitter,
            sequence: TOKEN_SEQUENCE,
        },
        PublishedMessage {
            sender: route().origin_instruction_emitter,
            sequence: INSTRUCTION_SEQUENCE,
        },
    ];
    TransferLeg::from_published(
        EVM,
        TERRA,
        &messages,
        &route().origin_instruction_emitter,
        &route().origin_token_emitter,
    )
    .unwrap()
}

// ============================================================================
// Stubbed round trips
// ============================================================================

#[tokio::test]
async fn test_deposit_round_trip_reaches_applied() {
    let network = Arc::new(Network::default());
    network.origin_deposit();
    let terra = terra_stub(&network, true);
    let evm = EvmStub::accepting();
    let orchestrator = orchestrator(&network, terra.clone(), evm.clone());

    let mut request = RelayRequest::round_trip(origin_leg());
    let state = assert_ok!(orchestrator.run(&mut request, &Cancellation::never()).await);

    assert_eq!(state, RelayState::Applied);
    assert_eq!(request.state(), &RelayState::Applied);
    assert_eq!(*terra.delivered.lock().unwrap(), vec![INSTRUCTION_SEQUENCE]);
    // the correlator had to wait for the destination to assign the reply
    assert!(network.sequence_info_polls.load(Ordering::SeqCst) > 1);

    let legs = request.legs();
    assert_eq!(legs.len(), 2);
    assert_eq!(legs[0].status, LegStatus::Applied);
    assert_eq!(legs[1].status, LegStatus::Applied);
    assert_eq!(
        legs[1].leg,
        TransferLeg::with_token_transfer(TERRA, EVM, REPLY_SEQUENCE, REPLY_TOKEN_SEQUENCE)
    );

    let calls = evm.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let reply = network.signed(TERRA, route().dest_instruction_emitter, REPLY_SEQUENCE);
    assert_eq!(calls[0].0, reply);
    assert_eq!(
        calls[0].1,
        Some(network.signed(TERRA, route().dest_token_emitter, REPLY_TOKEN_SEQUENCE))
    );
    assert_eq!(
        legs[1].digest,
        Some(SignedEnvelope::new(reply).digest().unwrap())
    );
}

#[tokio::test]
async fn test_already_processed_reply_is_success_without_resubmission() {
    let network = Arc::new(Network::default());
    network.origin_deposit();
    let evm = EvmStub::rejecting("execution reverted: transfer info already processed");
    let orchestrator = orchestrator(&network, terra_stub(&network, true), evm.clone());

    let mut request = RelayRequest::round_trip(origin_leg());
    let state = orchestrator
        .run(&mut request, &Cancellation::never())
        .await
        .unwrap();

    assert_eq!(state, RelayState::Applied);
    assert_eq!(request.legs()[1].status, LegStatus::AlreadyApplied);
    assert_eq!(request.legs()[1].leg.sequence, REPLY_SEQUENCE);
    assert_eq!(evm.call_count(), 1);

    // a finished request is not driven again
    let again = orchestrator
        .run(&mut request, &Cancellation::never())
        .await
        .unwrap();
    assert_eq!(again, RelayState::Applied);
    assert_eq!(evm.call_count(), 1);
}

#[tokio::test]
async fn test_cancel_while_awaiting_reply() {
    let network = Arc::new(Network::default());
    network.origin_deposit();
    let evm = EvmStub::accepting();
    let orchestrator = orchestrator(&network, terra_stub(&network, false), evm.clone());

    let (handle, cancellation) = Cancellation::new();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });

    let started = Instant::now();
    let mut request = RelayRequest::round_trip(origin_leg());
    let result = orchestrator.run(&mut request, &cancellation).await;

    assert!(matches!(result, Err(RelayError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(request.state(), RelayState::Failed(_)));
    assert_eq!(request.legs()[0].status, LegStatus::Applied);
    assert_eq!(evm.call_count(), 0);
}

#[tokio::test]
async fn test_reply_never_assigned_times_out() {
    let network = Arc::new(Network::default());
    network.origin_deposit();
    let orchestrator = assert_ok!(RelayOrchestrator::new(
        AttestationFetcher::new(network.clone()).with_poll_interval(Duration::from_millis(2)),
        SequenceCorrelator::new(network.clone(), RetryPolicy::fixed_interval(Duration::from_millis(5))),
        terra_stub(&network, false),
        EvmStub::accepting(),
        route(),
        RelaySettings {
            correlation_timeout: Duration::from_millis(60),
            ..settings()
        },
    ));

    let mut request = RelayRequest::round_trip(origin_leg());
    let result = orchestrator.run(&mut request, &Cancellation::never()).await;

    assert!(matches!(
        result,
        Err(RelayError::CorrelationTimeout {
            incoming: INSTRUCTION_SEQUENCE,
            ..
        })
    ));
}

// ============================================================================
// Live guardian
// ============================================================================

#[tokio::test]
#[ignore = "requires a guardian REST endpoint"]
async fn test_live_guardian_fetch() {
    let url = env::var("GUARDIAN_RPC_URL").unwrap_or_else(|_| "http://localhost:7071".to_string());
    let chain: u16 = env::var("LIVE_EMITTER_CHAIN")
        .expect("LIVE_EMITTER_CHAIN must be set")
        .parse()
        .expect("LIVE_EMITTER_CHAIN must be a chain id");
    let emitter_raw = env::var("LIVE_EMITTER_ADDRESS").expect("LIVE_EMITTER_ADDRESS must be set");
    let emitter = if emitter_raw.starts_with("terra") {
        EmitterAddress::from_terra(&emitter_raw).unwrap()
    } else {
        EmitterAddress::from_evm(&emitter_raw).unwrap()
    };
    let sequence: Sequence = env::var("LIVE_SEQUENCE")
        .expect("LIVE_SEQUENCE must be set")
        .parse()
        .expect("LIVE_SEQUENCE must be a number");

    let fetcher = AttestationFetcher::new(Arc::new(GuardianRestClient::new(&url).unwrap()));
    let envelope = fetcher
        .fetch(
            ChainId(chain),
            &emitter,
            sequence,
            Instant::now() + Duration::from_secs(60),
            &Cancellation::never(),
        )
        .await
        .unwrap();

    let decoded = envelope.decode().unwrap();
    let body = EnvelopeBody::parse(decoded.body).unwrap();
    println!(
        "Fetched sequence {} from {} with {} signatures, payload {} bytes",
        body.sequence,
        body.emitter_address,
        decoded.signature_count,
        decoded.payload.len()
    );
    assert_eq!(body.sequence, sequence);
    assert_eq!(body.emitter_chain, ChainId(chain));
}
