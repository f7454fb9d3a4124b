//! EVM adapter for the Cross Anchor bridge
//!
//! Reads `LogMessagePublished` events out of an origin transaction receipt and
//! submits instruction/token transfer envelope pairs to
//! `processTokenTransferInstruction`.

use std::str::FromStr;
use std::time::Duration;

use alloy::eips::BlockId;
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy::transports::http::reqwest::Url;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::Cancellation;
use crate::error::RelayError;
use crate::retry::pause;
use crate::submit::{SubmitReceipt, Submitter};
use crate::types::{ChainId, EmitterAddress, PublishedMessage};

sol! {
    /// Core bridge message event
    event LogMessagePublished(address indexed sender, uint64 sequence, uint32 nonce, bytes payload, uint8 consistencyLevel);

    /// Cross Anchor bridge entrypoint for replies relayed back from Terra
    #[sol(rpc)]
    contract CrossAnchorBridge {
        function processTokenTransferInstruction(bytes instructionVAA, bytes tokenTransferVAA) external;
    }
}

/// Messages the core bridge at `core_bridge` published, in emission order
pub fn published_messages<'a>(
    logs: impl IntoIterator<Item = &'a alloy::primitives::Log>,
    core_bridge: Address,
) -> Result<Vec<PublishedMessage>, RelayError> {
    logs.into_iter()
        .filter(|log| log.address == core_bridge)
        .filter(|log| log.topics().first() == Some(&LogMessagePublished::SIGNATURE_HASH))
        .map(|log| {
            let event = LogMessagePublished::decode_log(log, true).map_err(|e| {
                RelayError::Chain(format!("Failed to decode LogMessagePublished: {}", e))
            })?;
            let mut sender = [0u8; 32];
            sender[12..].copy_from_slice(event.data.sender.as_slice());
            Ok(PublishedMessage {
                sender: EmitterAddress(sender),
                sequence: event.data.sequence,
            })
        })
        .collect()
}

/// How long a sent transaction's receipt is looked up after the watcher fails
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Revert message carried by a node's JSON-RPC error response
fn revert_reason(err: &alloy::contract::Error) -> Option<String> {
    match err {
        alloy::contract::Error::TransportError(rpc) => rpc
            .as_error_resp()
            .filter(|payload| payload.message.contains("revert"))
            .map(|payload| payload.message.to_string()),
        _ => None,
    }
}

/// Map a contract call failure onto the relay taxonomy
fn send_failure(err: alloy::contract::Error) -> RelayError {
    if let Some(reason) = revert_reason(&err) {
        return RelayError::Rejected { reason };
    }
    match err {
        alloy::contract::Error::TransportError(rpc) => RelayError::Transport(rpc.to_string()),
        other => RelayError::Chain(other.to_string()),
    }
}

/// Failure for a mined transaction with status 0.
///
/// `reason` is the message from replaying the call at the receipt's block; a
/// replay that succeeds or fails without a revert message leaves it empty.
fn reverted_failure(reason: Option<String>) -> RelayError {
    RelayError::Rejected {
        reason: reason.unwrap_or_else(|| "transaction reverted".into()),
    }
}

/// Origin-side EVM client: receipt parsing and reply submission
pub struct EvmBridgeClient {
    rpc_url: Url,
    chain: ChainId,
    core_bridge: Address,
    xanchor_bridge: Address,
    signer: PrivateKeySigner,
    cancel: Cancellation,
}

impl EvmBridgeClient {
    pub fn new(
        rpc_url: &str,
        chain: ChainId,
        core_bridge: &str,
        xanchor_bridge: &str,
        private_key: &str,
    ) -> Result<Self, RelayError> {
        let rpc_url: Url = rpc_url
            .parse()
            .map_err(|e| RelayError::Config(format!("Invalid RPC URL: {}", e)))?;
        let core_bridge = Address::from_str(core_bridge)
            .map_err(|e| RelayError::Config(format!("Invalid core bridge address: {}", e)))?;
        let xanchor_bridge = Address::from_str(xanchor_bridge)
            .map_err(|e| RelayError::Config(format!("Invalid xanchor bridge address: {}", e)))?;
        let signer: PrivateKeySigner = private_key
            .parse()
            .map_err(|e| RelayError::Config(format!("Invalid private key: {}", e)))?;

        info!(
            relayer_address = %signer.address(),
            chain = %chain,
            xanchor_bridge = %xanchor_bridge,
            "EVM client initialized"
        );

        Ok(Self {
            rpc_url,
            chain,
            core_bridge,
            xanchor_bridge,
            signer,
            cancel: Cancellation::never(),
        })
    }

    /// Stop waiting on receipts once `cancel` fires
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Look up the receipt of an already sent transaction until it is mined.
    ///
    /// Never resends; a receipt that is still missing at the deadline is a
    /// transport failure.
    async fn poll_receipt(
        &self,
        tx_hash: B256,
    ) -> Result<alloy::rpc::types::TransactionReceipt, RelayError> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let deadline = Instant::now() + RECEIPT_TIMEOUT;
        loop {
            match provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => debug!(tx_hash = %tx_hash, "Receipt not available yet"),
                Err(e) => warn!(tx_hash = %tx_hash, error = %e, "Receipt lookup failed"),
            }
            if Instant::now() >= deadline {
                return Err(RelayError::Transport(format!(
                    "Receipt for {} not found within {:?}",
                    tx_hash, RECEIPT_TIMEOUT
                )));
            }
            pause(RECEIPT_POLL_INTERVAL, Some(deadline), &self.cancel).await?;
        }
    }

    /// Sequences published by the core bridge in the given origin transaction
    pub async fn sequences_from_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Vec<PublishedMessage>, RelayError> {
        let hash = B256::from_str(tx_hash)
            .map_err(|e| RelayError::Config(format!("Invalid transaction hash {}: {}", tx_hash, e)))?;
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());

        let receipt = provider
            .get_transaction_receipt(hash)
            .await
            .map_err(RelayError::transport)?
            .ok_or_else(|| RelayError::Transport(format!("Receipt for {} not found", tx_hash)))?;
        if !receipt.status() {
            return Err(RelayError::Chain(format!("Origin transaction {} reverted", tx_hash)));
        }

        let messages =
            published_messages(receipt.inner.logs().iter().map(|l| &l.inner), self.core_bridge)?;
        debug!(tx_hash = %tx_hash, count = messages.len(), "Parsed published messages");
        Ok(messages)
    }
}

#[async_trait]
impl Submitter for EvmBridgeClient {
    fn chain(&self) -> ChainId {
        self.chain
    }

    async fn submit(
        &self,
        instruction: &[u8],
        token_transfer: Option<&[u8]>,
    ) -> Result<SubmitReceipt, RelayError> {
        let token_transfer = token_transfer.ok_or_else(|| {
            RelayError::Chain("processTokenTransferInstruction requires a token transfer envelope".into())
        })?;

        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.clone());
        let contract = CrossAnchorBridge::new(self.xanchor_bridge, &provider);

        let call = contract.processTokenTransferInstruction(
            Bytes::copy_from_slice(instruction),
            Bytes::copy_from_slice(token_transfer),
        );
        let pending_tx = call.send().await.map_err(send_failure)?;

        let tx_hash = *pending_tx.tx_hash();
        info!(tx_hash = %tx_hash, "Transaction sent, waiting for confirmation");

        let watched = tokio::select! {
            _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
            receipt = pending_tx.get_receipt() => receipt,
        };
        let receipt = match watched {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(tx_hash = %tx_hash, error = %e, "Receipt watcher failed, looking up receipt");
                self.poll_receipt(tx_hash).await?
            }
        };

        if !receipt.status() {
            let mut replay = call.from(self.signer.address());
            if let Some(block) = receipt.block_number {
                replay = replay.block(BlockId::number(block));
            }
            let reason = match replay.call().await {
                Ok(_) => None,
                Err(e) => revert_reason(&e),
            };
            warn!(tx_hash = %tx_hash, reason = ?reason, "Transaction reverted");
            return Err(reverted_failure(reason));
        }

        Ok(SubmitReceipt {
            tx_hash: format!("{:?}", tx_hash),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{classify, ErrorClass};
    use alloy::primitives::{address, U256};

    const CORE: Address = address!("706abc4e45d419950511e474c7b9ed348a4a716c");
    const TOKEN_BRIDGE: Address = address!("f890982f9310df57d00f659cf4fd87e65aded8d7");
    const XANCHOR: Address = address!("0000000000000000000000000000000000c0ffee");

    fn published(sender: Address, sequence: u64) -> alloy::primitives::Log {
        let event = LogMessagePublished {
            sender,
            sequence,
            nonce: 0,
            payload: Bytes::from_static(b"payload"),
            consistencyLevel: 15,
        };
        alloy::primitives::Log {
            address: CORE,
            data: event.encode_log_data(),
        }
    }

    #[test]
    fn test_published_messages_in_emission_order() {
        let unrelated = alloy::primitives::Log::new_unchecked(
            TOKEN_BRIDGE,
            vec![B256::ZERO],
            Bytes::from(U256::from(1).to_be_bytes_vec()),
        );
        let logs = vec![published(TOKEN_BRIDGE, 685), unrelated, published(XANCHOR, 46)];

        let messages = published_messages(&logs, CORE).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sequence, 685);
        assert_eq!(messages[1].sequence, 46);
        assert_eq!(
            messages[1].sender,
            EmitterAddress::from_evm("0x0000000000000000000000000000000000c0ffee").unwrap()
        );
    }

    #[test]
    fn test_published_messages_ignores_other_emitters() {
        let mut log = published(XANCHOR, 46);
        log.address = TOKEN_BRIDGE;
        assert!(published_messages(&[log], CORE).unwrap().is_empty());
    }

    #[test]
    fn test_client_rejects_bad_config() {
        let key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
        assert!(EvmBridgeClient::new("http://localhost:8545", ChainId::ETHEREUM_ROPSTEN, "0x1", "0x2", key).is_err());
        assert!(EvmBridgeClient::new(
            "http://localhost:8545",
            ChainId::ETHEREUM_ROPSTEN,
            "0x706abc4E45D419950511e474C7B9Ed348A4a716c",
            "0x0000000000000000000000000000000000c0ffee",
            key
        )
        .is_ok());
    }

    #[test]
    fn test_reverted_receipt_keeps_replayed_reason() {
        let duplicate = reverted_failure(Some(crate::retry::EVM_ALREADY_PROCESSED.to_string()));
        assert_eq!(classify(&duplicate), ErrorClass::AlreadyApplied);

        let other = reverted_failure(Some("execution reverted: insufficient allowance".into()));
        assert_eq!(classify(&other), ErrorClass::Fatal);
    }

    #[test]
    fn test_reverted_receipt_without_reason_is_fatal() {
        match reverted_failure(None) {
            RelayError::Rejected { reason } => assert_eq!(reason, "transaction reverted"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(classify(&reverted_failure(None)), ErrorClass::Fatal);
    }

    #[test]
    fn test_revert_reason_ignores_non_rpc_errors() {
        let err = alloy::contract::Error::ContractNotDeployed;
        assert!(revert_reason(&err).is_none());
        assert!(matches!(send_failure(err), RelayError::Chain(_)));
    }

    #[tokio::test]
    async fn test_submit_requires_token_transfer() {
        let client = EvmBridgeClient::new(
            "http://localhost:8545",
            ChainId::ETHEREUM_ROPSTEN,
            "0x706abc4E45D419950511e474C7B9Ed348A4a716c",
            "0x0000000000000000000000000000000000c0ffee",
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        )
        .unwrap();
        let result = client.submit(b"instruction", None).await;
        assert!(matches!(result, Err(RelayError::Chain(_))));
    }
}
