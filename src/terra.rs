//! Terra Classic adapter for the Cross Anchor bridge contract
//!
//! - `sequence_info` smart query backing the Sequence Correlator
//! - `process_anchor_message` execution, signed with cosmrs and broadcast
//!   through the LCD REST API

use std::time::Duration;

use async_trait::async_trait;
use bip39::Mnemonic;
use cosmrs::{
    bip32::DerivationPath,
    crypto::secp256k1::SigningKey,
    tx::{self, Fee, Msg, SignDoc, SignerInfo},
    AccountId, Coin,
};
use cosmwasm_std::Binary;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::Cancellation;
use crate::correlator::{SequenceInfo, SequenceInfoSource};
use crate::error::RelayError;
use crate::retry::pause;
use crate::submit::{SubmitReceipt, Submitter};
use crate::types::{ChainId, Sequence};

/// Terra derivation path (BIP44 coin type 330)
pub const TERRA_DERIVATION_PATH: &str = "m/44'/330'/0'/0/0";

/// Gas limit for `process_anchor_message`; the contract fans out to the
/// token bridge and Anchor, so it needs more than a plain execute
pub const DEFAULT_GAS_LIMIT: u64 = 1_500_000;

/// Default gas price in uluna
pub const DEFAULT_GAS_PRICE: f64 = 0.015;

/// Cosmos SDK error code for an account sequence mismatch
const CODE_SEQUENCE_MISMATCH: u64 = 32;

const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Contract Messages
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
enum QueryMsg {
    SequenceInfo { chain_id: u16, sequence: u64 },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
enum ExecuteMsg {
    ProcessAnchorMessage {
        instruction_vaa: Binary,
        option_token_transfer_vaa: Option<Binary>,
    },
}

/// Account info from LCD
#[derive(Debug, Clone, Copy)]
struct AccountInfo {
    sequence: u64,
    account_number: u64,
}

/// `tx_response` fields shared by the broadcast and tx lookup endpoints
#[derive(Debug, Clone, Deserialize)]
struct TxResponse {
    #[serde(default)]
    txhash: String,
    #[serde(default)]
    code: u64,
    #[serde(default)]
    raw_log: String,
    #[serde(default)]
    height: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TxEnvelope {
    tx_response: TxResponse,
}

/// Map a non-zero tx result code onto the relay taxonomy
fn tx_failure(code: u64, raw_log: &str) -> RelayError {
    if code == CODE_SEQUENCE_MISMATCH {
        RelayError::Transport(format!("account sequence mismatch: {}", raw_log))
    } else {
        RelayError::Rejected {
            reason: raw_log.to_string(),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// LCD client bound to one Cross Anchor bridge contract
pub struct TerraBridgeClient {
    lcd_url: String,
    chain_id: String,
    bridge_address: String,
    signing_key: SigningKey,
    address: AccountId,
    gas_limit: u64,
    client: Client,
    cancel: Cancellation,
}

impl TerraBridgeClient {
    pub fn new(
        lcd_url: &str,
        chain_id: &str,
        bridge_address: &str,
        mnemonic: &str,
    ) -> Result<Self, RelayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let mnemonic = Mnemonic::parse(mnemonic)
            .map_err(|e| RelayError::Config(format!("Invalid mnemonic: {}", e)))?;
        let seed = mnemonic.to_seed("");
        let path: DerivationPath = TERRA_DERIVATION_PATH
            .parse()
            .map_err(|e| RelayError::Config(format!("Invalid derivation path: {:?}", e)))?;
        let signing_key = SigningKey::derive_from_path(seed, &path)
            .map_err(|e| RelayError::Config(format!("Failed to derive signing key: {}", e)))?;
        let address = signing_key
            .public_key()
            .account_id("terra")
            .map_err(|e| RelayError::Config(format!("Failed to get account ID: {}", e)))?;

        info!(address = %address, chain_id = chain_id, "Terra client initialized");

        Ok(Self {
            lcd_url: lcd_url.trim_end_matches('/').to_string(),
            chain_id: chain_id.to_string(),
            bridge_address: bridge_address.to_string(),
            signing_key,
            address,
            gas_limit: DEFAULT_GAS_LIMIT,
            client,
            cancel: Cancellation::never(),
        })
    }

    /// Stop waiting on inclusion once `cancel` fires
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Relayer account address
    pub fn address(&self) -> &AccountId {
        &self.address
    }

    fn smart_query_url(&self, query: &QueryMsg) -> Result<String, RelayError> {
        let query_json = serde_json::to_string(query).map_err(RelayError::chain)?;
        let query_b64 =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, query_json);
        Ok(format!(
            "{}/cosmwasm/wasm/v1/contract/{}/smart/{}",
            self.lcd_url, self.bridge_address, query_b64
        ))
    }

    async fn account_info(&self) -> Result<AccountInfo, RelayError> {
        let url = format!(
            "{}/cosmos/auth/v1beta1/accounts/{}",
            self.lcd_url, self.address
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(RelayError::Transport(format!(
                "Account query failed: {} - {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )));
        }

        let data: serde_json::Value = response.json().await?;
        let account = data
            .get("account")
            .ok_or_else(|| RelayError::Chain("Missing 'account' field in response".into()))?;

        let field = |name: &str| -> u64 {
            account
                .get(name)
                .or_else(|| account.get("base_account").and_then(|b| b.get(name)))
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)
        };

        Ok(AccountInfo {
            sequence: field("sequence"),
            account_number: field("account_number"),
        })
    }

    fn sign_execute(
        &self,
        msg: &ExecuteMsg,
        account: AccountInfo,
    ) -> Result<Vec<u8>, RelayError> {
        let execute_msg = cosmrs::cosmwasm::MsgExecuteContract {
            sender: self.address.clone(),
            contract: self
                .bridge_address
                .parse()
                .map_err(|e| RelayError::Config(format!("Invalid contract address: {:?}", e)))?,
            msg: serde_json::to_vec(msg).map_err(RelayError::chain)?,
            funds: vec![],
        };

        let body = tx::Body::new(
            vec![execute_msg
                .to_any()
                .map_err(|e| RelayError::Chain(format!("Failed to convert message: {}", e)))?],
            "",
            0u32,
        );

        let fee_amount = ((self.gas_limit as f64) * DEFAULT_GAS_PRICE).ceil() as u128;
        let fee = Fee::from_amount_and_gas(
            Coin {
                denom: "uluna"
                    .parse()
                    .map_err(|e| RelayError::Chain(format!("Invalid denom: {}", e)))?,
                amount: fee_amount,
            },
            self.gas_limit,
        );
        let auth_info =
            SignerInfo::single_direct(Some(self.signing_key.public_key()), account.sequence)
                .auth_info(fee);

        let chain_id = self
            .chain_id
            .parse()
            .map_err(|_| RelayError::Config(format!("Invalid chain ID: {}", self.chain_id)))?;
        let sign_doc = SignDoc::new(&body, &auth_info, &chain_id, account.account_number)
            .map_err(|e| RelayError::Chain(format!("Failed to create sign doc: {}", e)))?;

        sign_doc
            .sign(&self.signing_key)
            .map_err(|e| RelayError::Chain(format!("Failed to sign transaction: {}", e)))?
            .to_bytes()
            .map_err(|e| RelayError::Chain(format!("Failed to serialize transaction: {}", e)))
    }

    /// Broadcast in sync mode; CheckTx failures come back immediately
    async fn broadcast(&self, tx_bytes: &[u8]) -> Result<String, RelayError> {
        let request = serde_json::json!({
            "tx_bytes": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, tx_bytes),
            "mode": "BROADCAST_MODE_SYNC"
        });
        let url = format!("{}/cosmos/tx/v1beta1/txs", self.lcd_url);
        debug!(url = %url, tx_bytes_len = tx_bytes.len(), "Broadcasting transaction");

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Transport(format!(
                "Broadcast failed: {} - {}",
                status,
                response.text().await.unwrap_or_default()
            )));
        }

        let envelope: TxEnvelope = response.json().await?;
        let tx = envelope.tx_response;
        if tx.code != 0 {
            return Err(tx_failure(tx.code, &tx.raw_log));
        }
        Ok(tx.txhash)
    }

    /// Poll the tx endpoint until the transaction lands in a block
    async fn wait_for_inclusion(&self, txhash: &str) -> Result<(), RelayError> {
        let url = format!("{}/cosmos/tx/v1beta1/txs/{}", self.lcd_url, txhash);
        let start = Instant::now();
        let deadline = start + CONFIRMATION_TIMEOUT;
        let mut delay = Duration::from_millis(500);

        while Instant::now() < deadline {
            pause(delay, Some(deadline), &self.cancel).await?;

            match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    let envelope: TxEnvelope = response.json().await?;
                    let tx = envelope.tx_response;
                    if tx.code != 0 {
                        return Err(tx_failure(tx.code, &tx.raw_log));
                    }
                    debug!(
                        txhash = %txhash,
                        height = %tx.height.as_deref().unwrap_or("unknown"),
                        "Transaction confirmed"
                    );
                    return Ok(());
                }
                Ok(response) => {
                    debug!(
                        txhash = %txhash,
                        status = %response.status(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Transaction not yet in block"
                    );
                }
                Err(e) => {
                    warn!(txhash = %txhash, error = %e, "Error querying transaction status");
                }
            }

            delay = std::cmp::min(delay * 2, Duration::from_secs(3));
        }

        Err(RelayError::Transport(format!(
            "Timeout waiting for transaction {} to be confirmed",
            txhash
        )))
    }
}

#[async_trait]
impl SequenceInfoSource for TerraBridgeClient {
    async fn sequence_info(
        &self,
        origin_chain: ChainId,
        incoming: Sequence,
    ) -> Result<Option<SequenceInfo>, RelayError> {
        let url = self.smart_query_url(&QueryMsg::SequenceInfo {
            chain_id: origin_chain.as_u16(),
            sequence: incoming,
        })?;

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // a missing storage entry surfaces as a query error mentioning "not found"
            if body.contains("not found") {
                return Ok(None);
            }
            return Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                RelayError::Transport(format!("sequence_info query failed: {} - {}", status, body))
            } else {
                RelayError::Chain(format!("sequence_info query failed: {} - {}", status, body))
            });
        }

        let data: serde_json::Value = response.json().await?;
        let info = data
            .get("data")
            .cloned()
            .ok_or_else(|| RelayError::Chain("Missing 'data' field in response".into()))?;
        serde_json::from_value(info)
            .map(Some)
            .map_err(|e| RelayError::Chain(format!("Failed to parse sequence_info: {}", e)))
    }
}

#[async_trait]
impl Submitter for TerraBridgeClient {
    fn chain(&self) -> ChainId {
        ChainId::TERRA
    }

    async fn submit(
        &self,
        instruction: &[u8],
        token_transfer: Option<&[u8]>,
    ) -> Result<SubmitReceipt, RelayError> {
        let msg = ExecuteMsg::ProcessAnchorMessage {
            instruction_vaa: Binary::from(instruction),
            option_token_transfer_vaa: token_transfer.map(Binary::from),
        };

        let account = self.account_info().await?;
        let tx_bytes = self.sign_execute(&msg, account)?;
        let txhash = self.broadcast(&tx_bytes).await?;
        info!(txhash = %txhash, "process_anchor_message broadcast, waiting for inclusion");

        self.wait_for_inclusion(&txhash).await?;
        Ok(SubmitReceipt { tx_hash: txhash })
    }
}
