//! Destination submission interface

use async_trait::async_trait;

use crate::error::RelayError;
use crate::types::ChainId;

/// Accepted destination transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub tx_hash: String,
}

/// Delivers signed envelopes to a destination program.
///
/// Implementations map a refusal by the program to `RelayError::Rejected`
/// with the chain's reason kept verbatim, and network failures to
/// `RelayError::Transport`.
#[async_trait]
pub trait Submitter: Send + Sync {
    /// Chain this submitter delivers to
    fn chain(&self) -> ChainId;

    async fn submit(
        &self,
        instruction: &[u8],
        token_transfer: Option<&[u8]>,
    ) -> Result<SubmitReceipt, RelayError>;
}
