//! Guardian REST attestation source
//!
//! `GET {url}/v1/signed_vaa/{chain}/{emitter_hex}/{sequence}` returns
//! `{"vaaBytes": "<base64>"}` once the guardians have signed the message and
//! 404 before that.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::RelayError;
use crate::fetcher::AttestationSource;
use crate::types::{ChainId, EmitterAddress, Sequence};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedVaaResponse {
    vaa_bytes: String,
}

/// HTTP client for a guardian node's public REST API
pub struct GuardianRestClient {
    base_url: String,
    client: Client,
}

impl GuardianRestClient {
    pub fn new(base_url: &str) -> Result<Self, RelayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn signed_vaa_url(&self, chain: ChainId, emitter: &EmitterAddress, sequence: Sequence) -> String {
        format!(
            "{}/v1/signed_vaa/{}/{}/{}",
            self.base_url,
            chain.as_u16(),
            emitter.to_hex(),
            sequence
        )
    }
}

#[async_trait]
impl AttestationSource for GuardianRestClient {
    async fn signed_envelope(
        &self,
        chain: ChainId,
        emitter: &EmitterAddress,
        sequence: Sequence,
    ) -> Result<Option<Vec<u8>>, RelayError> {
        let url = self.signed_vaa_url(chain, emitter, sequence);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(url = %url, "Signed VAA not found yet");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(RelayError::Transport(format!(
                "Guardian query failed: {} - {}",
                status,
                response.text().await.unwrap_or_default()
            )));
        }

        let body: SignedVaaResponse = response.json().await?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(body.vaa_bytes.as_bytes())
            .map_err(|e| RelayError::Chain(format!("Invalid base64 in vaaBytes: {}", e)))?;
        Ok(Some(bytes))
    }
}
