//! Recent-blockhash ledger: fixed per-signature fee, no replacement

use super::{Ledger, LedgerBackend};
use crate::chain::{ChainStatus, RpcService};
use crate::error::{PipelineError, PipelineResult};
use crate::tx::builder::{self, TransferRequest};
use crate::tx::fees::FeeOracle;
use crate::types::{FeeEstimate, Priority, SignedTransaction, UnsignedTransaction};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BlockhashLedgerConfig {
    /// Rent-exempt minimum for a fresh account
    pub dust_threshold: u64,
}

impl Default for BlockhashLedgerConfig {
    fn default() -> Self {
        Self {
            dust_threshold: 890_880,
        }
    }
}

pub struct BlockhashLedger {
    config: BlockhashLedgerConfig,
    rpc: Arc<dyn RpcService>,
    fees: Arc<FeeOracle>,
}

impl BlockhashLedger {
    pub fn new(config: BlockhashLedgerConfig, rpc: Arc<dyn RpcService>, fees: Arc<FeeOracle>) -> Self {
        Self { config, rpc, fees }
    }
}

#[async_trait]
impl LedgerBackend for BlockhashLedger {
    fn ledger(&self) -> Ledger {
        Ledger::Blockhash
    }

    fn rpc(&self) -> Arc<dyn RpcService> {
        self.rpc.clone()
    }

    async fn build(&self, request: &TransferRequest) -> PipelineResult<UnsignedTransaction> {
        builder::validate_request(Ledger::Blockhash, request)?;

        let fee = self
            .fees
            .estimate(Ledger::Blockhash, request.priority)
            .await?
            .rate();
        let recent_blockhash =
            self.rpc
                .recent_block_reference()
                .await
                .map_err(|e| PipelineError::BlockReference {
                    ledger: Ledger::Blockhash,
                    message: e.to_string(),
                })?;

        let tx = UnsignedTransaction::Blockhash(builder::assemble_blockhash(
            request,
            recent_blockhash,
            u64::try_from(fee).unwrap_or(u64::MAX),
        )?);
        builder::validate(&tx, self.config.dust_threshold)?;

        debug!("Built blockhash transfer {} -> {}", request.from, request.to);
        crate::metrics::record_tx_built(Ledger::Blockhash);
        Ok(tx)
    }

    async fn estimate_fee(&self, priority: Priority) -> PipelineResult<FeeEstimate> {
        self.fees.estimate(Ledger::Blockhash, priority).await
    }

    async fn submit(&self, transaction: &SignedTransaction) -> PipelineResult<String> {
        self.rpc
            .submit_transaction(&transaction.raw)
            .await
            .map_err(|e| PipelineError::Submission {
                ledger: Ledger::Blockhash,
                message: e.to_string(),
            })
    }

    async fn status(&self, hash: &str) -> PipelineResult<ChainStatus> {
        self.rpc
            .transaction_status(hash)
            .await
            .map_err(|e| PipelineError::StatusQuery {
                ledger: Ledger::Blockhash,
                hash: hash.to_string(),
                message: e.to_string(),
            })
    }
}
