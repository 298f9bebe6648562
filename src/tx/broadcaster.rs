//! Submission, in-flight tracking and replace/cancel flows
//!
//! A result is `pending` until the node accepts the submission, `broadcasted`
//! once it returns an identifier, and only the monitor moves it to
//! `confirmed` or `failed`.

use crate::chain::{ChainState, ChainStatus};
use crate::error::{PipelineError, PipelineResult};
use crate::ledger::{LedgerBackend, LedgerRegistry};
use crate::signer::{sign_transaction, TransactionSigner};
use crate::tx::builder::committed_fee;
use crate::tx::monitor::{StatusSource, TransactionMonitor};
use crate::types::{BroadcastResult, SignedTransaction, TxStatus, UnsignedTransaction};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::{stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub batch_concurrency: usize,
    /// Terminal results kept for status lookups
    pub settled_cache_size: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            batch_concurrency: 8,
            settled_cache_size: 1024,
        }
    }
}

struct InFlight {
    result: BroadcastResult,
    transaction: SignedTransaction,
}

pub struct TransactionBroadcaster {
    config: BroadcasterConfig,
    registry: Arc<LedgerRegistry>,
    monitor: Arc<TransactionMonitor>,
    in_flight: DashMap<String, InFlight>,
    settled: DashMap<String, BroadcastResult>,
}

impl TransactionBroadcaster {
    pub fn new(
        config: BroadcasterConfig,
        registry: Arc<LedgerRegistry>,
        monitor: Arc<TransactionMonitor>,
    ) -> Self {
        Self {
            config,
            registry,
            monitor,
            in_flight: DashMap::new(),
            settled: DashMap::new(),
        }
    }

    pub fn monitor(&self) -> &Arc<TransactionMonitor> {
        &self.monitor
    }

    /// Submit a signed transaction and start tracking it
    pub async fn broadcast(
        self: &Arc<Self>,
        transaction: SignedTransaction,
    ) -> PipelineResult<BroadcastResult> {
        let ledger = transaction.ledger();
        let backend = self.registry.get(ledger)?;
        let pending = BroadcastResult::pending(ledger);
        debug!("Broadcast {} pending on {}", pending.request_id, ledger);

        let unsigned = transaction.transaction.clone();
        match self.submit(backend.as_ref(), transaction, pending).await {
            Ok(result) => Ok(result),
            Err(e) => {
                backend.abandon(&unsigned).await;
                Err(e)
            }
        }
    }

    async fn submit(
        self: &Arc<Self>,
        backend: &dyn LedgerBackend,
        transaction: SignedTransaction,
        mut result: BroadcastResult,
    ) -> PipelineResult<BroadcastResult> {
        let ledger = backend.ledger();

        let hash = match backend.submit(&transaction).await {
            Ok(hash) => hash,
            Err(e) => {
                error!("Submission {} on {} rejected: {}", result.request_id, ledger, e);
                crate::metrics::record_tx_submit_failed(ledger);
                return Err(e);
            }
        };

        result.hash = hash.clone();
        result.status = TxStatus::Broadcasted;
        result.timestamp = Utc::now();

        self.in_flight.insert(
            hash.clone(),
            InFlight {
                result: result.clone(),
                transaction,
            },
        );
        crate::metrics::record_tx_submitted(ledger);
        info!("Broadcast {} on {} as {}", result.request_id, ledger, hash);

        let source: Arc<dyn StatusSource> = self.clone();
        self.monitor.start_monitoring(&hash, ledger, source);
        Ok(result)
    }

    /// Broadcast every transaction with bounded concurrency. Results keep the
    /// input order and one failure does not abort the rest.
    pub async fn broadcast_batch(
        self: &Arc<Self>,
        transactions: Vec<SignedTransaction>,
    ) -> Vec<PipelineResult<BroadcastResult>> {
        let total = transactions.len();
        let results: Vec<_> = stream::iter(transactions)
            .map(|tx| self.broadcast(tx))
            .buffered(self.config.batch_concurrency.max(1))
            .collect()
            .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!("Batch broadcast: {} of {} failed", failed, total);
        }
        results
    }

    /// Query the node for an in-flight transaction and record the confirmation count
    async fn refresh(&self, hash: &str) -> PipelineResult<ChainStatus> {
        let ledger = self
            .in_flight
            .get(hash)
            .map(|e| e.result.ledger)
            .ok_or_else(|| PipelineError::TransactionNotFound {
                hash: hash.to_string(),
            })?;

        let status = self.registry.get(ledger)?.status(hash).await?;
        if let Some(mut entry) = self.in_flight.get_mut(hash) {
            entry.result.confirmations = status.confirmations;
        }
        Ok(status)
    }

    /// Current result for a hash: refreshed from the node while in flight,
    /// served from the settled cache once terminal
    pub async fn get_status(&self, hash: &str) -> PipelineResult<BroadcastResult> {
        if self.in_flight.contains_key(hash) {
            self.refresh(hash).await?;
            if let Some(entry) = self.in_flight.get(hash) {
                return Ok(entry.result.clone());
            }
        }

        self.settled
            .get(hash)
            .map(|r| r.clone())
            .ok_or_else(|| PipelineError::TransactionNotFound {
                hash: hash.to_string(),
            })
    }

    /// Known result without a network round trip
    pub fn cached_status(&self, hash: &str) -> Option<BroadcastResult> {
        self.in_flight
            .get(hash)
            .map(|e| e.result.clone())
            .or_else(|| self.settled.get(hash).map(|r| r.clone()))
    }

    pub fn in_flight(&self) -> Vec<BroadcastResult> {
        let mut results: Vec<_> = self.in_flight.iter().map(|e| e.result.clone()).collect();
        results.sort_by_key(|r| r.timestamp);
        results
    }

    fn original(&self, hash: &str) -> PipelineResult<UnsignedTransaction> {
        self.in_flight
            .get(hash)
            .map(|e| e.transaction.transaction.clone())
            .ok_or_else(|| PipelineError::TransactionNotFound {
                hash: hash.to_string(),
            })
    }

    /// Re-broadcast at a higher fee with the same nonce
    pub async fn replace_transaction(
        self: &Arc<Self>,
        hash: &str,
        new_fee: u128,
        signer: &dyn TransactionSigner,
    ) -> PipelineResult<BroadcastResult> {
        let original = self.original(hash)?;
        let backend = self.registry.get(original.ledger())?;

        let replacement = backend.replacement(hash, &original, new_fee)?;
        let result = self.supersede(hash, backend.as_ref(), replacement, signer).await?;
        crate::metrics::record_tx_replaced(original.ledger(), "replace");
        Ok(result)
    }

    /// Zero-value self transfer at the same nonce and a bumped fee
    pub async fn cancel_transaction(
        self: &Arc<Self>,
        hash: &str,
        signer: &dyn TransactionSigner,
    ) -> PipelineResult<BroadcastResult> {
        let original = self.original(hash)?;
        let backend = self.registry.get(original.ledger())?;

        let cancellation = backend.cancellation(hash, &original)?;
        let result = self.supersede(hash, backend.as_ref(), cancellation, signer).await?;
        crate::metrics::record_tx_replaced(original.ledger(), "cancel");
        Ok(result)
    }

    async fn supersede(
        self: &Arc<Self>,
        hash: &str,
        backend: &dyn LedgerBackend,
        transaction: UnsignedTransaction,
        signer: &dyn TransactionSigner,
    ) -> PipelineResult<BroadcastResult> {
        let fee = committed_fee(&transaction);
        let signed = sign_transaction(signer, transaction).await?;
        let result = self
            .submit(backend, signed, BroadcastResult::pending(backend.ledger()))
            .await?;

        // The original can no longer confirm once its slot is taken
        self.monitor.stop_monitoring(hash);
        if let Some((_, entry)) = self.in_flight.remove(hash) {
            info!(
                "{} (fee up to {}) superseded by {} (fee up to {})",
                hash,
                committed_fee(&entry.transaction.transaction),
                result.hash,
                fee
            );
            let mut retired = entry.result;
            retired.status = TxStatus::Failed;
            retired.timestamp = Utc::now();
            self.remember(hash.to_string(), retired);
        }
        Ok(result)
    }

    /// Restart polling for an in-flight transaction
    pub fn start_monitoring(self: &Arc<Self>, hash: &str) -> PipelineResult<bool> {
        let ledger = self
            .in_flight
            .get(hash)
            .map(|e| e.result.ledger)
            .ok_or_else(|| PipelineError::TransactionNotFound {
                hash: hash.to_string(),
            })?;
        let source: Arc<dyn StatusSource> = self.clone();
        Ok(self.monitor.start_monitoring(hash, ledger, source))
    }

    pub fn stop_monitoring(&self, hash: &str) -> bool {
        self.monitor.stop_monitoring(hash)
    }

    fn remember(&self, hash: String, result: BroadcastResult) {
        self.settled.insert(hash, result);

        while self.settled.len() > self.config.settled_cache_size {
            let oldest = self
                .settled
                .iter()
                .min_by_key(|e| e.value().timestamp)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.settled.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl StatusSource for TransactionBroadcaster {
    async fn poll_status(&self, hash: &str) -> PipelineResult<ChainStatus> {
        self.refresh(hash).await
    }

    async fn settle(&self, hash: &str, outcome: ChainState, confirmations: u64) {
        let Some((_, entry)) = self.in_flight.remove(hash) else {
            return;
        };
        let ledger = entry.result.ledger;

        let mut result = entry.result;
        result.confirmations = confirmations;
        result.timestamp = Utc::now();
        result.status = if outcome == ChainState::Included {
            crate::metrics::record_tx_confirmed(ledger);
            TxStatus::Confirmed
        } else {
            crate::metrics::record_tx_failed(ledger);
            TxStatus::Failed
        };

        if let Ok(backend) = self.registry.get(ledger) {
            backend.settle(&entry.transaction.transaction, outcome).await;
        }
        info!("{} on {} is {:?}", hash, ledger, result.status);
        self.remember(hash.to_string(), result);
    }
}
