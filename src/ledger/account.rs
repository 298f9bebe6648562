//! Account/nonce ledger: EIP-1559 fee fields, nonce allocation, replace-by-fee

use super::{Ledger, LedgerBackend};
use crate::chain::{to_u128, ChainState, ChainStatus, RpcService};
use crate::error::{PipelineError, PipelineResult};
use crate::tx::builder::{self, TransferRequest, BASE_TRANSFER_GAS};
use crate::tx::fees::FeeOracle;
use crate::tx::nonce::NonceAllocator;
use crate::types::{
    AccountFee, AccountTransaction, FeeEstimate, Priority, SignedTransaction, UnsignedTransaction,
};

use async_trait::async_trait;
use ethers::types::U256;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct AccountLedgerConfig {
    pub chain_id: u64,
    pub default_gas_limit: u64,
    pub dust_threshold: u64,
    /// Minimum fee increase of a replacement, percent
    pub min_bump_percent: u64,
    /// Fee increase of a cancellation, percent
    pub cancel_bump_percent: u64,
}

impl Default for AccountLedgerConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            default_gas_limit: BASE_TRANSFER_GAS,
            dust_threshold: 0,
            min_bump_percent: 10,
            cancel_bump_percent: 20,
        }
    }
}

/// Raise `value` by `percent`, rounding up
fn bump(value: u128, percent: u64) -> u128 {
    value
        .saturating_mul(100 + u128::from(percent))
        .saturating_add(99)
        / 100
}

pub struct AccountLedger {
    config: AccountLedgerConfig,
    rpc: Arc<dyn RpcService>,
    nonces: Arc<NonceAllocator>,
    fees: Arc<FeeOracle>,
}

impl AccountLedger {
    pub fn new(
        config: AccountLedgerConfig,
        rpc: Arc<dyn RpcService>,
        nonces: Arc<NonceAllocator>,
        fees: Arc<FeeOracle>,
    ) -> Self {
        Self {
            config,
            rpc,
            nonces,
            fees,
        }
    }

    async fn fee_for(&self, request: &TransferRequest) -> PipelineResult<AccountFee> {
        let overrides = &request.overrides;
        if let (Some(max_fee), Some(priority_fee)) =
            (overrides.max_fee_per_gas, overrides.max_priority_fee_per_gas)
        {
            return Ok(AccountFee {
                max_fee_per_gas: U256::from(max_fee),
                max_priority_fee_per_gas: U256::from(priority_fee),
            });
        }

        let estimate = self.fees.estimate(Ledger::Account, request.priority).await?;
        let max_fee = overrides.max_fee_per_gas.unwrap_or_else(|| estimate.rate());
        let priority_fee = overrides
            .max_priority_fee_per_gas
            .unwrap_or_else(|| estimate.priority_fee.unwrap_or(0).min(max_fee));

        Ok(AccountFee {
            max_fee_per_gas: U256::from(max_fee),
            max_priority_fee_per_gas: U256::from(priority_fee),
        })
    }

    fn account_view<'a>(
        &self,
        original: &'a UnsignedTransaction,
    ) -> PipelineResult<&'a AccountTransaction> {
        match original {
            UnsignedTransaction::Account(tx) => Ok(tx),
            other => Err(PipelineError::InvalidTransaction {
                ledger: Ledger::Account,
                reason: format!("expected an account transaction, got {}", other.ledger()),
            }),
        }
    }
}

#[async_trait]
impl LedgerBackend for AccountLedger {
    fn ledger(&self) -> Ledger {
        Ledger::Account
    }

    fn rpc(&self) -> Arc<dyn RpcService> {
        self.rpc.clone()
    }

    async fn build(&self, request: &TransferRequest) -> PipelineResult<UnsignedTransaction> {
        builder::validate_request(Ledger::Account, request)?;

        let fee = self.fee_for(request).await?;
        let gas_limit = request
            .overrides
            .gas_limit
            .unwrap_or(self.config.default_gas_limit);

        // Validate before allocating so a rejected build never consumes a nonce
        let mut tx = builder::assemble_account(self.config.chain_id, request, 0, fee, gas_limit)?;
        builder::validate(
            &UnsignedTransaction::Account(tx.clone()),
            self.config.dust_threshold,
        )?;

        tx.nonce = self
            .nonces
            .allocate(&request.from, Ledger::Account, self.rpc.as_ref())
            .await?;

        debug!(
            "Built account transfer {} -> {} nonce {}",
            request.from, request.to, tx.nonce
        );
        crate::metrics::record_tx_built(Ledger::Account);
        Ok(UnsignedTransaction::Account(tx))
    }

    async fn estimate_fee(&self, priority: Priority) -> PipelineResult<FeeEstimate> {
        self.fees.estimate(Ledger::Account, priority).await
    }

    async fn submit(&self, transaction: &SignedTransaction) -> PipelineResult<String> {
        self.rpc
            .submit_transaction(&transaction.raw)
            .await
            .map_err(|e| PipelineError::Submission {
                ledger: Ledger::Account,
                message: e.to_string(),
            })
    }

    async fn status(&self, hash: &str) -> PipelineResult<ChainStatus> {
        self.rpc
            .transaction_status(hash)
            .await
            .map_err(|e| PipelineError::StatusQuery {
                ledger: Ledger::Account,
                hash: hash.to_string(),
                message: e.to_string(),
            })
    }

    fn replacement(
        &self,
        hash: &str,
        original: &UnsignedTransaction,
        new_fee: u128,
    ) -> PipelineResult<UnsignedTransaction> {
        let original = self.account_view(original)?;
        let original_fee = to_u128(original.fee.max_fee_per_gas).unwrap_or(u128::MAX);
        let minimum = bump(original_fee, self.config.min_bump_percent);

        if new_fee < minimum {
            return Err(PipelineError::FeeBumpTooLow {
                hash: hash.to_string(),
                original: original_fee,
                proposed: new_fee,
                minimum,
            });
        }

        // Priority fee rises in proportion to the max fee
        let original_priority = to_u128(original.fee.max_priority_fee_per_gas).unwrap_or(0);
        let priority_fee = original_priority
            .saturating_mul(new_fee)
            .div_ceil(original_fee.max(1))
            .min(new_fee);

        let mut replacement = original.clone();
        replacement.fee = AccountFee {
            max_fee_per_gas: U256::from(new_fee),
            max_priority_fee_per_gas: U256::from(priority_fee),
        };

        info!(
            "Replacing {} at nonce {} with max fee {} (was {})",
            hash, original.nonce, new_fee, original_fee
        );
        Ok(UnsignedTransaction::Account(replacement))
    }

    fn cancellation(
        &self,
        hash: &str,
        original: &UnsignedTransaction,
    ) -> PipelineResult<UnsignedTransaction> {
        let original = self.account_view(original)?;
        let max_fee = to_u128(original.fee.max_fee_per_gas).unwrap_or(u128::MAX);
        let priority_fee = to_u128(original.fee.max_priority_fee_per_gas).unwrap_or(0);
        let bump_percent = self.config.cancel_bump_percent;

        let cancel = AccountTransaction {
            chain_id: original.chain_id,
            from: original.from,
            to: original.from,
            value: U256::zero(),
            nonce: original.nonce,
            fee: AccountFee {
                max_fee_per_gas: U256::from(bump(max_fee, bump_percent)),
                max_priority_fee_per_gas: U256::from(bump(priority_fee, bump_percent)),
            },
            data: None,
            gas_limit: BASE_TRANSFER_GAS,
        };

        info!("Cancelling {} at nonce {}", hash, original.nonce);
        Ok(UnsignedTransaction::Account(cancel))
    }

    async fn settle(&self, transaction: &UnsignedTransaction, outcome: ChainState) {
        // A dropped transaction never consumed its nonce
        if outcome == ChainState::Dropped {
            self.nonces.reset(&transaction.sender(), Ledger::Account);
        }
    }

    async fn abandon(&self, transaction: &UnsignedTransaction) {
        if let UnsignedTransaction::Account(tx) = transaction {
            self.nonces
                .release(&transaction.sender(), Ledger::Account, tx.nonce)
                .await;
        }
    }
}
