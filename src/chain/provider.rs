//! Account-ledger node adapter with multi-RPC support and automatic failover

use super::{to_u128, AccountFeeData, ChainStatus, RpcError, RpcResult, RpcService};
use crate::error::{PipelineError, PipelineResult};
use crate::types::Utxo;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Priority fee used when the node has no `eth_maxPriorityFeePerGas`
const DEFAULT_PRIORITY_FEE_WEI: u64 = 2_000_000_000;

/// Multi-provider wrapper with automatic failover
pub struct EvmProvider {
    chain_id: u64,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl EvmProvider {
    pub fn new(chain_id: u64, rpc_urls: &[String]) -> PipelineResult<Self> {
        let mut http_providers = Vec::new();

        for url in rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(PipelineError::Config(format!(
                "no valid RPC providers for chain {}",
                chain_id
            )));
        }

        Ok(Self {
            chain_id,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn parse_address(address: &str) -> RpcResult<Address> {
        address
            .parse()
            .map_err(|e| RpcError::Decode(format!("invalid address {}: {}", address, e)))
    }

    fn parse_hash(hash: &str) -> RpcResult<H256> {
        hash.parse()
            .map_err(|e| RpcError::Decode(format!("invalid hash {}: {}", hash, e)))
    }
}

#[async_trait]
impl RpcService for EvmProvider {
    async fn latest_block(&self) -> RpcResult<u64> {
        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.chain_id, e
                    );
                    last_error = Some(RpcError::from(e));
                    self.failover();
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RpcError::Transport("all providers failed".to_string())))
    }

    async fn transaction_count(&self, address: &str) -> RpcResult<u64> {
        let address = Self::parse_address(address)?;
        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction_count(address, None).await {
                Ok(count) => return Ok(count.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get transaction count from chain {}: {}",
                        self.chain_id, e
                    );
                    last_error = Some(RpcError::from(e));
                    self.failover();
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RpcError::Transport("all providers failed".to_string())))
    }

    async fn unspent_outputs(&self, _address: &str) -> RpcResult<Vec<Utxo>> {
        Err(RpcError::Unsupported("unspent_outputs"))
    }

    async fn account_fee_data(&self) -> RpcResult<AccountFeeData> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await?
            .ok_or_else(|| RpcError::Decode("latest block missing".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| RpcError::Decode("no base fee in block".to_string()))?;

        let priority_fee = match self
            .http()
            .request::<_, U256>("eth_maxPriorityFeePerGas", ())
            .await
        {
            Ok(fee) => fee,
            Err(e) => {
                debug!(
                    "Chain {} has no priority fee oracle ({}), using default",
                    self.chain_id, e
                );
                U256::from(DEFAULT_PRIORITY_FEE_WEI)
            }
        };

        Ok(AccountFeeData {
            base_fee,
            priority_fee,
        })
    }

    async fn fee_rate(&self, _target_blocks: u16) -> RpcResult<u64> {
        Err(RpcError::Unsupported("fee_rate"))
    }

    async fn block_fee_rate(&self, height: u64) -> RpcResult<u128> {
        let block = self
            .http()
            .get_block(BlockNumber::Number(height.into()))
            .await?
            .ok_or_else(|| RpcError::Decode(format!("block {} missing", height)))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| RpcError::Decode(format!("no base fee in block {}", height)))?;
        to_u128(base_fee)
    }

    async fn recent_block_reference(&self) -> RpcResult<String> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await?
            .ok_or_else(|| RpcError::Decode("latest block missing".to_string()))?;
        block
            .hash
            .map(|h| format!("{:?}", h))
            .ok_or_else(|| RpcError::Decode("latest block has no hash".to_string()))
    }

    async fn submit_transaction(&self, raw: &[u8]) -> RpcResult<String> {
        let pending = self
            .http()
            .send_raw_transaction(Bytes::from(raw.to_vec()))
            .await?;
        Ok(format!("{:?}", pending.tx_hash()))
    }

    async fn transaction_status(&self, hash: &str) -> RpcResult<ChainStatus> {
        let tx_hash = Self::parse_hash(hash)?;

        let receipt = match self.http().get_transaction_receipt(tx_hash).await? {
            Some(receipt) => receipt,
            None => {
                // No receipt: still in the mempool, or gone
                let known = self.http().get_transaction(tx_hash).await?.is_some();
                return Ok(if known {
                    ChainStatus::pending()
                } else {
                    ChainStatus {
                        state: super::ChainState::Dropped,
                        confirmations: 0,
                    }
                });
            }
        };

        let Some(block_number) = receipt.block_number else {
            return Ok(ChainStatus::pending());
        };

        if receipt.status == Some(0.into()) {
            return Ok(ChainStatus {
                state: super::ChainState::Failed,
                confirmations: 0,
            });
        }

        let tip = self.latest_block().await?;
        let confirmations = tip.saturating_sub(block_number.as_u64()) + 1;
        Ok(ChainStatus::included(confirmations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_a_provider() {
        let err = EvmProvider::new(1, &[]).err().unwrap();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_failover_rotates() {
        let urls = vec![
            "http://127.0.0.1:8545".to_string(),
            "http://127.0.0.1:8546".to_string(),
        ];
        let provider = EvmProvider::new(1, &urls).unwrap();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 0);
        provider.failover();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 1);
        provider.failover();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_utxo_queries_unsupported() {
        let provider = EvmProvider::new(1, &["http://127.0.0.1:8545".to_string()]).unwrap();
        assert_eq!(
            provider.unspent_outputs("0x00").await.unwrap_err(),
            RpcError::Unsupported("unspent_outputs")
        );
    }
}
