//! Process-wide pipeline, constructed once at startup and shared by handle
//!
//! Every upward operation takes an explicit ledger tag (or a transaction that
//! carries one) and is routed through the [`LedgerRegistry`].

use crate::chain::{BlockhashNode, EvmProvider, RpcService, UtxoNode};
use crate::config::Settings;
use crate::error::PipelineResult;
use crate::ledger::{
    AccountLedger, AccountLedgerConfig, BlockhashLedger, BlockhashLedgerConfig, Ledger,
    LedgerRegistry, UtxoLedger, UtxoLedgerConfig,
};
use crate::signer::TransactionSigner;
use crate::tx::{
    BroadcasterConfig, FeeOracle, FeeOracleConfig, FeeStatistics, MonitoringTask,
    NonceAllocator, OptimalFee, TransactionBroadcaster, TransactionMonitor, TransferRequest,
    UtxoSelector,
};
use crate::types::{
    BroadcastResult, FeeEstimate, OutPoint, Priority, SignedTransaction, UnsignedTransaction,
    Utxo,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct TransactionPipeline {
    registry: Arc<LedgerRegistry>,
    nonces: Arc<NonceAllocator>,
    utxos: Arc<UtxoSelector>,
    fees: Arc<FeeOracle>,
    broadcaster: Arc<TransactionBroadcaster>,
}

impl TransactionPipeline {
    /// Connect node adapters for every enabled ledger
    pub fn from_settings(settings: &Settings) -> PipelineResult<Self> {
        let mut rpcs: HashMap<Ledger, Arc<dyn RpcService>> = HashMap::new();

        if let Some(account) = settings.ledgers.account.as_ref().filter(|c| c.enabled) {
            rpcs.insert(
                Ledger::Account,
                Arc::new(EvmProvider::new(account.chain_id, &account.rpc_urls)?),
            );
        }
        if let Some(utxo) = settings.ledgers.utxo.as_ref().filter(|c| c.enabled) {
            rpcs.insert(Ledger::Utxo, Arc::new(UtxoNode::new(&utxo.rpc_urls)?));
        }
        if let Some(blockhash) = settings.ledgers.blockhash.as_ref().filter(|c| c.enabled) {
            rpcs.insert(
                Ledger::Blockhash,
                Arc::new(BlockhashNode::new(&blockhash.rpc_urls)?),
            );
        }

        Ok(Self::with_rpcs(settings, rpcs))
    }

    /// Wire the pipeline over the given node collaborators, one per ledger
    pub fn with_rpcs(settings: &Settings, rpcs: HashMap<Ledger, Arc<dyn RpcService>>) -> Self {
        let pipeline = &settings.pipeline;
        let ledgers = &settings.ledgers;

        let fees = Arc::new(FeeOracle::new(
            FeeOracleConfig {
                ttl: pipeline.fee_cache_ttl(),
                fixed_fee: ledgers
                    .blockhash
                    .as_ref()
                    .map(|c| u128::from(c.fee_per_signature))
                    .unwrap_or(5_000),
                max_fee_per_gas: ledgers.account.as_ref().and_then(|c| c.max_fee_per_gas()),
                history_concurrency: pipeline.fee_history_concurrency,
                ..Default::default()
            },
            rpcs.clone(),
        ));
        let nonces = Arc::new(NonceAllocator::new());
        let utxos = Arc::new(UtxoSelector::new());
        let registry = Arc::new(LedgerRegistry::new());

        for (ledger, rpc) in rpcs {
            match ledger {
                Ledger::Account => {
                    let mut config = AccountLedgerConfig {
                        min_bump_percent: pipeline.replacement_min_bump_percent,
                        cancel_bump_percent: pipeline.cancel_bump_percent,
                        ..Default::default()
                    };
                    if let Some(account) = &ledgers.account {
                        config.chain_id = account.chain_id;
                        config.default_gas_limit = account.default_gas_limit;
                        config.dust_threshold = account.dust_threshold;
                    }
                    registry.insert(Arc::new(AccountLedger::new(
                        config,
                        rpc,
                        nonces.clone(),
                        fees.clone(),
                    )));
                }
                Ledger::Utxo => {
                    let mut config = UtxoLedgerConfig::default();
                    if let Some(utxo) = &ledgers.utxo {
                        config.dust_threshold = utxo.dust_threshold;
                    }
                    registry.insert(Arc::new(UtxoLedger::new(
                        config,
                        rpc,
                        utxos.clone(),
                        fees.clone(),
                    )));
                }
                Ledger::Blockhash => {
                    let mut config = BlockhashLedgerConfig::default();
                    if let Some(blockhash) = &ledgers.blockhash {
                        config.dust_threshold = blockhash.dust_threshold;
                    }
                    registry.insert(Arc::new(BlockhashLedger::new(config, rpc, fees.clone())));
                }
            }
        }

        let monitor = Arc::new(TransactionMonitor::new(pipeline.monitor_poll_interval()));
        let broadcaster = Arc::new(TransactionBroadcaster::new(
            BroadcasterConfig {
                batch_concurrency: pipeline.batch_concurrency,
                settled_cache_size: pipeline.settled_cache_size,
            },
            registry.clone(),
            monitor,
        ));

        info!("Pipeline ready for ledgers {:?}", registry.ledgers());
        Self {
            registry,
            nonces,
            utxos,
            fees,
            broadcaster,
        }
    }

    pub fn ledgers(&self) -> Vec<Ledger> {
        self.registry.ledgers()
    }

    pub async fn build(
        &self,
        ledger: Ledger,
        request: &TransferRequest,
    ) -> PipelineResult<UnsignedTransaction> {
        self.registry.get(ledger)?.build(request).await
    }

    pub async fn estimate_fee(&self, ledger: Ledger, priority: Priority) -> PipelineResult<FeeEstimate> {
        self.registry.get(ledger)?.estimate_fee(priority).await
    }

    pub async fn calculate_optimal_fee(
        &self,
        transaction: &UnsignedTransaction,
        target: Duration,
    ) -> PipelineResult<OptimalFee> {
        self.registry.get(transaction.ledger())?;
        self.fees.calculate_optimal_fee(transaction, target).await
    }

    /// Statistics over one fee sample per block for the last `window` blocks
    pub async fn fee_history(&self, ledger: Ledger, window: u64) -> PipelineResult<FeeStatistics> {
        self.registry.get(ledger)?;
        self.fees.historical_statistics(ledger, window).await
    }

    pub async fn broadcast(&self, transaction: SignedTransaction) -> PipelineResult<BroadcastResult> {
        self.broadcaster.broadcast(transaction).await
    }

    pub async fn broadcast_batch(
        &self,
        transactions: Vec<SignedTransaction>,
    ) -> Vec<PipelineResult<BroadcastResult>> {
        self.broadcaster.broadcast_batch(transactions).await
    }

    pub async fn get_status(&self, hash: &str) -> PipelineResult<BroadcastResult> {
        self.broadcaster.get_status(hash).await
    }

    pub async fn replace_transaction(
        &self,
        hash: &str,
        new_fee: u128,
        signer: &dyn TransactionSigner,
    ) -> PipelineResult<BroadcastResult> {
        self.broadcaster
            .replace_transaction(hash, new_fee, signer)
            .await
    }

    pub async fn cancel_transaction(
        &self,
        hash: &str,
        signer: &dyn TransactionSigner,
    ) -> PipelineResult<BroadcastResult> {
        self.broadcaster.cancel_transaction(hash, signer).await
    }

    pub fn start_monitoring(&self, hash: &str) -> PipelineResult<bool> {
        self.broadcaster.start_monitoring(hash)
    }

    pub fn stop_monitoring(&self, hash: &str) -> bool {
        self.broadcaster.stop_monitoring(hash)
    }

    pub fn monitoring_tasks(&self) -> Vec<MonitoringTask> {
        self.broadcaster.monitor().tasks()
    }

    pub fn in_flight(&self) -> Vec<BroadcastResult> {
        self.broadcaster.in_flight()
    }

    /// Cached outputs for an address, loading them on first access
    pub async fn utxos(&self, address: &str) -> PipelineResult<Vec<Utxo>> {
        let rpc = self.registry.get(Ledger::Utxo)?.rpc();
        self.utxos.get_utxos(address, rpc.as_ref()).await
    }

    /// Forget the nonce reservation so the next build re-reads the network count
    pub fn reset_nonce(&self, address: &str, ledger: Ledger) -> bool {
        self.nonces.reset(address, ledger)
    }

    /// Flag outputs consumed by a transaction built outside this pipeline
    pub async fn mark_utxos_spent(&self, address: &str, outpoints: &[OutPoint]) -> usize {
        self.utxos.mark_spent(address, outpoints).await
    }

    pub fn clear_utxo_cache(&self, address: &str) -> bool {
        self.utxos.clear_cache(address)
    }

    pub async fn health_check(&self) -> Vec<(Ledger, bool)> {
        self.registry.health_check().await
    }
}
