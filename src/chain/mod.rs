//! Network/RPC service collaborator
//!
//! This module provides:
//! - The [`RpcService`] trait, the only boundary that performs node I/O
//! - An account-ledger adapter over `ethers` HTTP providers with failover
//! - JSON-RPC adapters for UTXO and blockhash nodes

pub mod node;
pub mod provider;

pub use node::{BlockhashNode, NodeClient, UtxoNode};
pub use provider::EvmProvider;

use crate::types::Utxo;

use async_trait::async_trait;
use ethers::providers::{ProviderError, RpcError as _};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Node-level failure, wrapped with context by the calling component
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("{0} is not served by this node")]
    Unsupported(&'static str),
}

impl From<ProviderError> for RpcError {
    fn from(e: ProviderError) -> Self {
        match e.as_error_response() {
            Some(resp) => RpcError::Node {
                code: resp.code,
                message: resp.message.clone(),
            },
            None => RpcError::Transport(e.to_string()),
        }
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

/// What the node knows about a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainState {
    /// Known to the node but not in a block yet
    Pending,
    Included,
    /// Included but reverted/errored
    Failed,
    /// Unknown to the node
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    pub state: ChainState,
    pub confirmations: u64,
}

impl ChainStatus {
    pub fn pending() -> Self {
        Self {
            state: ChainState::Pending,
            confirmations: 0,
        }
    }

    pub fn included(confirmations: u64) -> Self {
        Self {
            state: ChainState::Included,
            confirmations,
        }
    }
}

/// Base fee of the latest block plus a priority-fee sample, wei per gas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountFeeData {
    pub base_fee: U256,
    pub priority_fee: U256,
}

/// Node queries used by the pipeline. One instance serves one ledger; queries
/// a ledger does not have return [`RpcError::Unsupported`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RpcService: Send + Sync {
    /// Latest block height or slot
    async fn latest_block(&self) -> RpcResult<u64>;

    /// Confirmed transaction count of an account
    async fn transaction_count(&self, address: &str) -> RpcResult<u64>;

    async fn unspent_outputs(&self, address: &str) -> RpcResult<Vec<Utxo>>;

    async fn account_fee_data(&self) -> RpcResult<AccountFeeData>;

    /// Fee rate for a confirmation target, satoshi per virtual byte
    async fn fee_rate(&self, target_blocks: u16) -> RpcResult<u64>;

    /// Fee rate observed in the block at `height`
    async fn block_fee_rate(&self, height: u64) -> RpcResult<u128>;

    async fn recent_block_reference(&self) -> RpcResult<String>;

    async fn submit_transaction(&self, raw: &[u8]) -> RpcResult<String>;

    async fn transaction_status(&self, hash: &str) -> RpcResult<ChainStatus>;
}

/// Narrow a node-reported quantity to `u128`
pub(crate) fn to_u128(value: U256) -> RpcResult<u128> {
    if value > U256::from(u128::MAX) {
        return Err(RpcError::Decode(format!("{} overflows u128", value)));
    }
    Ok(value.as_u128())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_u128_bounds() {
        assert_eq!(to_u128(U256::from(42u64)).unwrap(), 42);
        assert!(to_u128(U256::MAX).is_err());
    }
}
