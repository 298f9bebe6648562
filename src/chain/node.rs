//! JSON-RPC adapters for UTXO and blockhash ledger nodes

use super::{AccountFeeData, ChainState, ChainStatus, RpcError, RpcResult, RpcService};
use crate::error::{PipelineError, PipelineResult};
use crate::ledger::{script_type_for, Ledger};
use crate::types::{ScriptType, Utxo};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ethers::providers::{Http, Provider};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

const SATS_PER_COIN: f64 = 100_000_000.0;
/// bitcoind "No such mempool or blockchain transaction"
const TX_NOT_FOUND: i64 = -5;

/// Raw JSON-RPC transport with failover across node URLs
pub struct NodeClient {
    ledger: Ledger,
    providers: Vec<Provider<Http>>,
    current: AtomicUsize,
}

impl NodeClient {
    pub fn new(ledger: Ledger, rpc_urls: &[String]) -> PipelineResult<Self> {
        let mut providers = Vec::new();
        for url in rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    debug!("Added node for ledger {}: {}", ledger, url);
                    providers.push(provider);
                }
                Err(e) => warn!("Failed to create node client for {}: {}", url, e),
            }
        }

        if providers.is_empty() {
            return Err(PipelineError::Config(format!(
                "no valid RPC nodes for ledger {}",
                ledger
            )));
        }

        Ok(Self {
            ledger,
            providers,
            current: AtomicUsize::new(0),
        })
    }

    /// Issue a call, failing over on transport errors. A node that answers
    /// with an error is authoritative and is not retried elsewhere.
    pub async fn call(&self, method: &str, params: Value) -> RpcResult<Value> {
        let mut last_error = None;
        for _ in 0..self.providers.len() {
            let idx = self.current.load(Ordering::Relaxed) % self.providers.len();
            match self.providers[idx]
                .request::<_, Value>(method, params.clone())
                .await
                .map_err(RpcError::from)
            {
                Ok(value) => return Ok(value),
                Err(e @ RpcError::Node { .. }) => return Err(e),
                Err(e) => {
                    warn!("{} call {} failed: {}", self.ledger, method, e);
                    last_error = Some(e);
                    self.current.store((idx + 1) % self.providers.len(), Ordering::Relaxed);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RpcError::Transport("all nodes failed".to_string())))
    }

    async fn call_as<T: for<'de> Deserialize<'de>>(&self, method: &str, params: Value) -> RpcResult<T> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| RpcError::Decode(format!("{}: {}", method, e)))
    }
}

#[derive(Debug, Deserialize)]
struct UnspentEntry {
    txid: String,
    vout: u32,
    amount: f64,
    address: Option<String>,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: String,
}

#[derive(Debug, Deserialize)]
struct SmartFee {
    feerate: Option<f64>,
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BlockStats {
    avgfeerate: u64,
}

#[derive(Debug, Deserialize)]
struct RawTransactionInfo {
    #[serde(default)]
    confirmations: u64,
}

/// Satoshi-denominated UTXO node (bitcoind-compatible JSON-RPC)
pub struct UtxoNode {
    client: NodeClient,
}

impl UtxoNode {
    pub fn new(rpc_urls: &[String]) -> PipelineResult<Self> {
        Ok(Self {
            client: NodeClient::new(Ledger::Utxo, rpc_urls)?,
        })
    }
}

/// BTC per kvB to sat per vB, never below 1
fn btc_per_kvb_to_sat_per_vb(feerate: f64) -> u64 {
    ((feerate * SATS_PER_COIN / 1000.0).ceil() as u64).max(1)
}

#[async_trait]
impl RpcService for UtxoNode {
    async fn latest_block(&self) -> RpcResult<u64> {
        self.client.call_as("getblockcount", json!([])).await
    }

    async fn transaction_count(&self, _address: &str) -> RpcResult<u64> {
        Err(RpcError::Unsupported("transaction_count"))
    }

    async fn unspent_outputs(&self, address: &str) -> RpcResult<Vec<Utxo>> {
        let entries: Vec<UnspentEntry> = self
            .client
            .call_as("listunspent", json!([0, 9_999_999, [address]]))
            .await?;

        Ok(entries
            .into_iter()
            .map(|e| {
                let owner = e.address.unwrap_or_else(|| address.to_string());
                // P2WPKH scripts start with OP_0 PUSH20
                let script_type = if e.script_pub_key.starts_with("0014") {
                    ScriptType::Witness
                } else {
                    script_type_for(&owner)
                };
                Utxo {
                    txid: e.txid,
                    vout: e.vout,
                    amount: (e.amount * SATS_PER_COIN).round() as u64,
                    address: owner,
                    script_type,
                    spent: false,
                }
            })
            .collect())
    }

    async fn account_fee_data(&self) -> RpcResult<AccountFeeData> {
        Err(RpcError::Unsupported("account_fee_data"))
    }

    async fn fee_rate(&self, target_blocks: u16) -> RpcResult<u64> {
        let estimate: SmartFee = self
            .client
            .call_as("estimatesmartfee", json!([target_blocks]))
            .await?;

        match estimate.feerate {
            Some(rate) => Ok(btc_per_kvb_to_sat_per_vb(rate)),
            None => Err(RpcError::Decode(format!(
                "no fee estimate for {} blocks: {}",
                target_blocks,
                estimate.errors.join("; ")
            ))),
        }
    }

    async fn block_fee_rate(&self, height: u64) -> RpcResult<u128> {
        let stats: BlockStats = self
            .client
            .call_as("getblockstats", json!([height, ["avgfeerate"]]))
            .await?;
        Ok(u128::from(stats.avgfeerate))
    }

    async fn recent_block_reference(&self) -> RpcResult<String> {
        self.client.call_as("getbestblockhash", json!([])).await
    }

    async fn submit_transaction(&self, raw: &[u8]) -> RpcResult<String> {
        self.client
            .call_as("sendrawtransaction", json!([hex::encode(raw)]))
            .await
    }

    async fn transaction_status(&self, hash: &str) -> RpcResult<ChainStatus> {
        match self
            .client
            .call_as::<RawTransactionInfo>("getrawtransaction", json!([hash, true]))
            .await
        {
            Ok(info) if info.confirmations == 0 => Ok(ChainStatus::pending()),
            Ok(info) => Ok(ChainStatus::included(info.confirmations)),
            Err(RpcError::Node { code, .. }) if code == TX_NOT_FOUND => Ok(ChainStatus {
                state: ChainState::Dropped,
                confirmations: 0,
            }),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Contextual<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct LatestBlockhash {
    blockhash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureStatus {
    confirmations: Option<u64>,
    err: Option<Value>,
    confirmation_status: Option<String>,
}

/// Slot/blockhash ledger node (getLatestBlockhash style JSON-RPC)
pub struct BlockhashNode {
    client: NodeClient,
}

impl BlockhashNode {
    pub fn new(rpc_urls: &[String]) -> PipelineResult<Self> {
        Ok(Self {
            client: NodeClient::new(Ledger::Blockhash, rpc_urls)?,
        })
    }
}

fn signature_status(status: Option<SignatureStatus>) -> ChainStatus {
    let Some(status) = status else {
        return ChainStatus::pending();
    };

    if status.err.as_ref().is_some_and(|e| !e.is_null()) {
        return ChainStatus {
            state: ChainState::Failed,
            confirmations: 0,
        };
    }

    match (status.confirmations, status.confirmation_status.as_deref()) {
        // Rooted slots no longer report a count
        (None, Some("finalized")) => {
            ChainStatus::included(Ledger::Blockhash.confirmation_threshold())
        }
        (Some(0), _) | (None, _) => ChainStatus::pending(),
        (Some(n), _) => ChainStatus::included(n),
    }
}

#[async_trait]
impl RpcService for BlockhashNode {
    async fn latest_block(&self) -> RpcResult<u64> {
        self.client.call_as("getSlot", json!([])).await
    }

    async fn transaction_count(&self, _address: &str) -> RpcResult<u64> {
        Err(RpcError::Unsupported("transaction_count"))
    }

    async fn unspent_outputs(&self, _address: &str) -> RpcResult<Vec<Utxo>> {
        Err(RpcError::Unsupported("unspent_outputs"))
    }

    async fn account_fee_data(&self) -> RpcResult<AccountFeeData> {
        Err(RpcError::Unsupported("account_fee_data"))
    }

    async fn fee_rate(&self, _target_blocks: u16) -> RpcResult<u64> {
        Err(RpcError::Unsupported("fee_rate"))
    }

    async fn block_fee_rate(&self, _height: u64) -> RpcResult<u128> {
        Err(RpcError::Unsupported("block_fee_rate"))
    }

    async fn recent_block_reference(&self) -> RpcResult<String> {
        let latest: Contextual<LatestBlockhash> = self
            .client
            .call_as("getLatestBlockhash", json!([{ "commitment": "finalized" }]))
            .await?;
        Ok(latest.value.blockhash)
    }

    async fn submit_transaction(&self, raw: &[u8]) -> RpcResult<String> {
        self.client
            .call_as(
                "sendTransaction",
                json!([STANDARD.encode(raw), { "encoding": "base64" }]),
            )
            .await
    }

    async fn transaction_status(&self, hash: &str) -> RpcResult<ChainStatus> {
        let statuses: Contextual<Vec<Option<SignatureStatus>>> = self
            .client
            .call_as(
                "getSignatureStatuses",
                json!([[hash], { "searchTransactionHistory": true }]),
            )
            .await?;
        Ok(signature_status(statuses.value.into_iter().next().flatten()))
    }
}
