//! Unspent-output ledger: coin selection and per-byte fee rates

use super::{script_type_for, Ledger, LedgerBackend};
use crate::chain::{ChainState, ChainStatus, RpcService};
use crate::error::{PipelineError, PipelineResult};
use crate::tx::builder::{self, TransferRequest};
use crate::tx::fees::FeeOracle;
use crate::tx::utxo::{FeePolicy, UtxoSelector};
use crate::types::{FeeEstimate, Priority, SignedTransaction, UnsignedTransaction};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct UtxoLedgerConfig {
    pub dust_threshold: u64,
}

impl Default for UtxoLedgerConfig {
    fn default() -> Self {
        Self {
            dust_threshold: 546,
        }
    }
}

pub struct UtxoLedger {
    config: UtxoLedgerConfig,
    rpc: Arc<dyn RpcService>,
    selector: Arc<UtxoSelector>,
    fees: Arc<FeeOracle>,
}

impl UtxoLedger {
    pub fn new(
        config: UtxoLedgerConfig,
        rpc: Arc<dyn RpcService>,
        selector: Arc<UtxoSelector>,
        fees: Arc<FeeOracle>,
    ) -> Self {
        Self {
            config,
            rpc,
            selector,
            fees,
        }
    }

    async fn policy_for(&self, request: &TransferRequest) -> PipelineResult<FeePolicy> {
        if let Some(fee) = request.overrides.absolute_fee {
            return Ok(FeePolicy::Absolute(fee));
        }
        if let Some(rate) = request.overrides.fee_rate {
            return Ok(FeePolicy::Rate(rate));
        }

        let rate = self.fees.estimate(Ledger::Utxo, request.priority).await?.rate();
        Ok(FeePolicy::Rate(u64::try_from(rate).unwrap_or(u64::MAX)))
    }
}

#[async_trait]
impl LedgerBackend for UtxoLedger {
    fn ledger(&self) -> Ledger {
        Ledger::Utxo
    }

    fn rpc(&self) -> Arc<dyn RpcService> {
        self.rpc.clone()
    }

    async fn build(&self, request: &TransferRequest) -> PipelineResult<UnsignedTransaction> {
        builder::validate_request(Ledger::Utxo, request)?;
        let amount = builder::amount_u64(Ledger::Utxo, request.amount)?;
        let policy = self.policy_for(request).await?;

        // Payment plus change
        let outputs = [script_type_for(&request.to), script_type_for(&request.from)];
        let selection = self
            .selector
            .reserve(&request.from, amount, policy, &outputs, self.rpc.as_ref())
            .await?;
        let outpoints = selection.outpoints();

        let assembled =
            builder::assemble_utxo(request, selection, policy.rate(), self.config.dust_threshold)
                .map(UnsignedTransaction::Utxo)
                .and_then(|tx| {
                    builder::validate(&tx, self.config.dust_threshold)?;
                    Ok(tx)
                });

        match assembled {
            Ok(tx) => {
                debug!(
                    "Built utxo transfer {} -> {} with {} inputs",
                    request.from,
                    request.to,
                    outpoints.len()
                );
                crate::metrics::record_tx_built(Ledger::Utxo);
                Ok(tx)
            }
            Err(e) => {
                warn!("Utxo build for {} failed validation: {}", request.from, e);
                self.selector.release(&request.from, &outpoints).await;
                Err(e)
            }
        }
    }

    async fn estimate_fee(&self, priority: Priority) -> PipelineResult<FeeEstimate> {
        self.fees.estimate(Ledger::Utxo, priority).await
    }

    async fn submit(&self, transaction: &SignedTransaction) -> PipelineResult<String> {
        self.rpc
            .submit_transaction(&transaction.raw)
            .await
            .map_err(|e| PipelineError::Submission {
                ledger: Ledger::Utxo,
                message: e.to_string(),
            })
    }

    async fn status(&self, hash: &str) -> PipelineResult<ChainStatus> {
        self.rpc
            .transaction_status(hash)
            .await
            .map_err(|e| PipelineError::StatusQuery {
                ledger: Ledger::Utxo,
                hash: hash.to_string(),
                message: e.to_string(),
            })
    }

    async fn settle(&self, transaction: &UnsignedTransaction, outcome: ChainState) {
        let UnsignedTransaction::Utxo(tx) = transaction else {
            return;
        };
        match outcome {
            ChainState::Included | ChainState::Failed => {
                self.selector.forget(&tx.from, &tx.outpoints()).await;
            }
            ChainState::Dropped => {
                self.selector.release(&tx.from, &tx.outpoints()).await;
            }
            ChainState::Pending => {}
        }
    }

    async fn abandon(&self, transaction: &UnsignedTransaction) {
        if let UnsignedTransaction::Utxo(tx) = transaction {
            self.selector.forget(&tx.from, &tx.outpoints()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockRpcService;
    use crate::tx::builder::BuildOverrides;
    use crate::tx::fees::FeeOracleConfig;
    use crate::types::{ScriptType, Utxo};
    use std::collections::HashMap;

    const FROM: &str = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";
    const TO: &str = "bc1qxy2kgdygjrsqtzq2n0yrf2493p83kkfjhx0wlh";

    fn utxo(txid: &str, amount: u64) -> Utxo {
        Utxo {
            txid: txid.to_string(),
            vout: 0,
            amount,
            address: FROM.to_string(),
            script_type: ScriptType::Witness,
            spent: false,
        }
    }

    fn ledger(rpc: MockRpcService) -> UtxoLedger {
        let rpc: Arc<dyn RpcService> = Arc::new(rpc);
        let mut rpcs = HashMap::new();
        rpcs.insert(Ledger::Utxo, rpc.clone());
        let fees = Arc::new(FeeOracle::new(FeeOracleConfig::default(), rpcs));
        UtxoLedger::new(
            UtxoLedgerConfig::default(),
            rpc,
            Arc::new(UtxoSelector::new()),
            fees,
        )
    }

    fn absolute(fee: u64) -> BuildOverrides {
        BuildOverrides {
            absolute_fee: Some(fee),
            ..Default::default()
        }
    }

    fn as_utxo(tx: UnsignedTransaction) -> crate::types::UtxoTransaction {
        match tx {
            UnsignedTransaction::Utxo(tx) => tx,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exact_change_build() {
        let mut rpc = MockRpcService::new();
        rpc.expect_unspent_outputs()
            .returning(|_| Ok(vec![utxo("a", 100_000)]));
        let ledger = ledger(rpc);

        let request = TransferRequest::new(FROM, TO, 99_000).with_overrides(absolute(1_000));
        let tx = as_utxo(ledger.build(&request).await.unwrap());
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.fee, 1_000);
        assert_eq!(tx.fee_rate, None);
    }

    #[tokio::test]
    async fn test_change_producing_build() {
        let mut rpc = MockRpcService::new();
        rpc.expect_unspent_outputs()
            .returning(|_| Ok(vec![utxo("a", 200_000)]));
        let ledger = ledger(rpc);

        let request = TransferRequest::new(FROM, TO, 100_000).with_overrides(absolute(1_000));
        let tx = as_utxo(ledger.build(&request).await.unwrap());
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].amount, 100_000);
        assert_eq!(tx.outputs[1].amount, 99_000);
    }

    #[tokio::test]
    async fn test_insufficient_funds_build() {
        let mut rpc = MockRpcService::new();
        rpc.expect_unspent_outputs()
            .returning(|_| Ok(vec![utxo("a", 60_000), utxo("b", 40_000)]));
        let ledger = ledger(rpc);

        let request = TransferRequest::new(FROM, TO, 200_000).with_overrides(absolute(1_000));
        let err = ledger.build(&request).await.unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientFunds { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Resource);
    }

    #[tokio::test]
    async fn test_failed_validation_releases_inputs() {
        let mut rpc = MockRpcService::new();
        rpc.expect_unspent_outputs()
            .times(1)
            .returning(|_| Ok(vec![utxo("a", 100_000)]));
        let ledger = ledger(rpc);

        // payment below dust: selection succeeds, validation does not
        let request = TransferRequest::new(FROM, TO, 100).with_overrides(absolute(1_000));
        let err = ledger.build(&request).await.unwrap_err();
        assert!(matches!(err, PipelineError::DustOutput { .. }));

        let cached = ledger
            .selector
            .get_utxos(FROM, ledger.rpc.as_ref())
            .await
            .unwrap();
        assert!(cached.iter().all(|u| !u.spent));
    }

    #[tokio::test]
    async fn test_estimated_rate_is_used() {
        let mut rpc = MockRpcService::new();
        rpc.expect_fee_rate().times(3).returning(|_| Ok(10));
        rpc.expect_unspent_outputs()
            .returning(|_| Ok(vec![utxo("a", 100_000)]));
        let ledger = ledger(rpc);

        let tx = as_utxo(
            ledger
                .build(&TransferRequest::new(FROM, TO, 50_000))
                .await
                .unwrap(),
        );
        assert_eq!(tx.fee_rate, Some(10));
        // 1 witness input, 2 witness outputs = 141 vB
        assert_eq!(tx.fee, 1_410);
    }

    #[tokio::test]
    async fn test_settlement_forgets_inputs() {
        let mut rpc = MockRpcService::new();
        rpc.expect_unspent_outputs()
            .times(1)
            .returning(|_| Ok(vec![utxo("a", 100_000), utxo("b", 5_000)]));
        let ledger = ledger(rpc);

        let request = TransferRequest::new(FROM, TO, 50_000).with_overrides(absolute(1_000));
        let tx = ledger.build(&request).await.unwrap();
        ledger.settle(&tx, ChainState::Included).await;

        let cached = ledger
            .selector
            .get_utxos(FROM, ledger.rpc.as_ref())
            .await
            .unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].txid, "b");
    }

    #[test]
    fn test_replacement_not_implemented() {
        let ledger = ledger(MockRpcService::new());
        let tx = UnsignedTransaction::Utxo(crate::types::UtxoTransaction {
            from: FROM.to_string(),
            to: TO.to_string(),
            amount: 1,
            inputs: vec![],
            outputs: vec![],
            fee: 1,
            fee_rate: None,
        });
        assert!(matches!(
            ledger.replacement("h", &tx, 10).unwrap_err(),
            PipelineError::NotImplemented { .. }
        ));
    }
}
