//! Assembly and validation rules shared by the ledger builders
//!
//! Everything here is pure. Ledger backends gather the nonce, inputs and fee
//! estimate, then call the matching `assemble_*` function and [`validate`].

use crate::error::{PipelineError, PipelineResult};
use crate::ledger::{script_type_for, Ledger};
use crate::tx::utxo::{estimate_vsize, Selection};
use crate::types::{
    AccountFee, AccountTransaction, BlockhashTransaction, Priority, TxOutput,
    UnsignedTransaction, UtxoTransaction,
};

use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

/// Intrinsic gas of a plain value transfer
pub const BASE_TRANSFER_GAS: u64 = 21_000;

/// Optional caller overrides, each replacing what the builder would derive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOverrides {
    pub gas_limit: Option<u64>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    /// Satoshi per virtual byte
    pub fee_rate: Option<u64>,
    /// Total fee in satoshi, takes precedence over `fee_rate`
    pub absolute_fee: Option<u64>,
    /// Hex call data, account ledger only
    pub payload: Option<String>,
}

/// "Send `amount` from `from` to `to`"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from: String,
    pub to: String,
    pub amount: u128,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub overrides: BuildOverrides,
}

impl TransferRequest {
    pub fn new(from: impl Into<String>, to: impl Into<String>, amount: u128) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            amount,
            priority: Priority::default(),
            overrides: BuildOverrides::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_overrides(mut self, overrides: BuildOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Address and amount checks done before any network call
pub fn validate_request(ledger: Ledger, request: &TransferRequest) -> PipelineResult<()> {
    ledger.validate_address(&request.from)?;
    ledger.validate_address(&request.to)?;

    if request.overrides.payload.is_some() && ledger != Ledger::Account {
        return Err(PipelineError::InvalidPayload(format!(
            "payloads are not accepted on {}",
            ledger
        )));
    }

    let has_payload = request.overrides.payload.is_some();
    if request.amount == 0 && !has_payload {
        return Err(PipelineError::InvalidAmount {
            ledger,
            amount: 0,
            reason: "amount must be positive".to_string(),
        });
    }

    if ledger != Ledger::Account {
        amount_u64(ledger, request.amount)?;
    }
    Ok(())
}

pub(crate) fn amount_u64(ledger: Ledger, amount: u128) -> PipelineResult<u64> {
    u64::try_from(amount).map_err(|_| PipelineError::InvalidAmount {
        ledger,
        amount,
        reason: "amount exceeds the ledger's range".to_string(),
    })
}

/// Decode hex call data, with or without a `0x` prefix
pub fn decode_payload(payload: &str) -> PipelineResult<Bytes> {
    let digits = payload.strip_prefix("0x").unwrap_or(payload);
    hex::decode(digits)
        .map(Bytes::from)
        .map_err(|e| PipelineError::InvalidPayload(format!("{}: {}", payload, e)))
}

fn parse_account_address(address: &str) -> PipelineResult<Address> {
    address.parse().map_err(|e| PipelineError::InvalidAddress {
        ledger: Ledger::Account,
        address: address.to_string(),
        reason: format!("{}", e),
    })
}

/// Units a per-unit fee rate is charged over: gas limit, virtual bytes or
/// signatures
pub fn fee_units(transaction: &UnsignedTransaction) -> u128 {
    match transaction {
        UnsignedTransaction::Account(tx) => u128::from(tx.gas_limit),
        UnsignedTransaction::Utxo(tx) => u128::from(estimate_vsize(
            tx.inputs.iter().map(|u| u.script_type),
            tx.outputs.iter().map(|o| o.script_type),
        )),
        UnsignedTransaction::Blockhash(_) => 1,
    }
}

/// Total fee a transaction commits to, in the ledger's smallest unit
pub fn committed_fee(transaction: &UnsignedTransaction) -> u128 {
    match transaction {
        UnsignedTransaction::Account(tx) => {
            crate::chain::to_u128(tx.fee.max_fee_per_gas)
                .unwrap_or(u128::MAX)
                .saturating_mul(u128::from(tx.gas_limit))
        }
        UnsignedTransaction::Utxo(tx) => u128::from(tx.fee),
        UnsignedTransaction::Blockhash(tx) => u128::from(tx.fee),
    }
}

pub fn assemble_account(
    chain_id: u64,
    request: &TransferRequest,
    nonce: u64,
    fee: AccountFee,
    gas_limit: u64,
) -> PipelineResult<AccountTransaction> {
    let data = request
        .overrides
        .payload
        .as_deref()
        .map(decode_payload)
        .transpose()?;

    Ok(AccountTransaction {
        chain_id,
        from: parse_account_address(&request.from)?,
        to: parse_account_address(&request.to)?,
        value: U256::from(request.amount),
        nonce,
        fee,
        data,
        gas_limit,
    })
}

/// Payment output plus change; change below dust is left to the fee
pub fn assemble_utxo(
    request: &TransferRequest,
    selection: Selection,
    fee_rate: Option<u64>,
    dust_threshold: u64,
) -> PipelineResult<UtxoTransaction> {
    let amount = amount_u64(Ledger::Utxo, request.amount)?;
    let total = selection.total();
    let mut fee = selection.fee;

    let mut outputs = vec![TxOutput {
        address: request.to.clone(),
        amount,
        script_type: script_type_for(&request.to),
    }];

    let change = total.saturating_sub(amount).saturating_sub(fee);
    if change >= dust_threshold && change > 0 {
        outputs.push(TxOutput {
            address: request.from.clone(),
            amount: change,
            script_type: script_type_for(&request.from),
        });
    } else {
        fee += change;
    }

    Ok(UtxoTransaction {
        from: request.from.clone(),
        to: request.to.clone(),
        amount,
        inputs: selection.inputs,
        outputs,
        fee,
        fee_rate,
    })
}

pub fn assemble_blockhash(
    request: &TransferRequest,
    recent_blockhash: String,
    fee: u64,
) -> PipelineResult<BlockhashTransaction> {
    Ok(BlockhashTransaction {
        from: request.from.clone(),
        to: request.to.clone(),
        amount: amount_u64(Ledger::Blockhash, request.amount)?,
        recent_blockhash,
        fee,
    })
}

fn invalid(ledger: Ledger, reason: impl Into<String>) -> PipelineError {
    PipelineError::InvalidTransaction {
        ledger,
        reason: reason.into(),
    }
}

fn check_dust(ledger: Ledger, amount: u128, threshold: u64) -> PipelineResult<()> {
    if amount < u128::from(threshold) {
        return Err(PipelineError::DustOutput {
            ledger,
            amount,
            threshold: u128::from(threshold),
        });
    }
    Ok(())
}

/// Final check of an assembled transaction: outputs plus fee never exceed
/// inputs and no output is dust.
pub fn validate(transaction: &UnsignedTransaction, dust_threshold: u64) -> PipelineResult<()> {
    let ledger = transaction.ledger();
    match transaction {
        UnsignedTransaction::Account(tx) => {
            if tx.value.is_zero() && tx.data.is_none() {
                return Err(invalid(ledger, "zero-value transfer without payload"));
            }
            if tx.gas_limit < BASE_TRANSFER_GAS {
                return Err(invalid(
                    ledger,
                    format!("gas limit {} below {}", tx.gas_limit, BASE_TRANSFER_GAS),
                ));
            }
            if tx.fee.max_priority_fee_per_gas > tx.fee.max_fee_per_gas {
                return Err(invalid(ledger, "priority fee exceeds max fee"));
            }
            if !tx.value.is_zero() {
                let value = crate::chain::to_u128(tx.value).unwrap_or(u128::MAX);
                check_dust(ledger, value, dust_threshold)?;
            }
        }
        UnsignedTransaction::Utxo(tx) => {
            if tx.inputs.is_empty() {
                return Err(invalid(ledger, "no inputs"));
            }
            if tx.outputs.is_empty() {
                return Err(invalid(ledger, "no outputs"));
            }
            let spend = u128::from(tx.output_total()) + u128::from(tx.fee);
            let available = u128::from(tx.input_total());
            if spend > available {
                return Err(invalid(
                    ledger,
                    format!("outputs plus fee {} exceed inputs {}", spend, available),
                ));
            }
            for output in &tx.outputs {
                check_dust(ledger, u128::from(output.amount), dust_threshold)?;
            }
        }
        UnsignedTransaction::Blockhash(tx) => {
            if tx.recent_blockhash.is_empty() {
                return Err(invalid(ledger, "missing recent blockhash"));
            }
            check_dust(ledger, u128::from(tx.amount), dust_threshold)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ScriptType, Utxo};

    const SENDER: &str = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";
    const RECIPIENT: &str = "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2";

    fn selection(amounts: &[u64], fee: u64) -> Selection {
        Selection {
            inputs: amounts
                .iter()
                .enumerate()
                .map(|(i, amount)| Utxo {
                    txid: format!("tx{}", i),
                    vout: 0,
                    amount: *amount,
                    address: SENDER.to_string(),
                    script_type: ScriptType::Witness,
                    spent: true,
                })
                .collect(),
            fee,
            vsize: 141,
        }
    }

    #[test]
    fn test_exact_change_has_single_output() {
        let request = TransferRequest::new(SENDER, RECIPIENT, 99_000);
        let tx = assemble_utxo(&request, selection(&[100_000], 1_000), None, 546).unwrap();

        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.fee, 1_000);
        assert!(tx.change().is_none());
        validate(&UnsignedTransaction::Utxo(tx), 546).unwrap();
    }

    #[test]
    fn test_change_output() {
        let request = TransferRequest::new(SENDER, RECIPIENT, 100_000);
        let tx = assemble_utxo(&request, selection(&[200_000], 1_000), None, 546).unwrap();

        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].amount, 100_000);
        assert_eq!(tx.outputs[0].script_type, ScriptType::Legacy);
        assert_eq!(tx.change().map(|c| c.amount), Some(99_000));
        assert_eq!(tx.fee, 1_000);
    }

    #[test]
    fn test_dust_change_is_folded_into_fee() {
        let request = TransferRequest::new(SENDER, RECIPIENT, 99_000);
        let tx = assemble_utxo(&request, selection(&[100_500], 1_000), Some(7), 546).unwrap();
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.fee, 1_500);
        assert_eq!(tx.output_total() + tx.fee, tx.input_total());
    }

    #[test]
    fn test_validation_rejects_overspend() {
        let request = TransferRequest::new(SENDER, RECIPIENT, 99_000);
        let mut tx = assemble_utxo(&request, selection(&[100_000], 1_000), None, 546).unwrap();
        tx.fee = 2_000;
        let err = validate(&UnsignedTransaction::Utxo(tx), 546).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransaction { .. }));
    }

    #[test]
    fn test_validation_rejects_dust_output() {
        let request = TransferRequest::new(SENDER, RECIPIENT, 500);
        let tx = assemble_utxo(&request, selection(&[100_000], 1_000), None, 546).unwrap();
        let err = validate(&UnsignedTransaction::Utxo(tx), 546).unwrap_err();
        assert_eq!(
            err,
            PipelineError::DustOutput {
                ledger: Ledger::Utxo,
                amount: 500,
                threshold: 546
            }
        );
    }

    #[test]
    fn test_request_validation() {
        let ok = TransferRequest::new(SENDER, RECIPIENT, 1);
        assert!(validate_request(Ledger::Utxo, &ok).is_ok());

        let bad_address = TransferRequest::new("0x1234", RECIPIENT, 1);
        assert!(matches!(
            validate_request(Ledger::Utxo, &bad_address).unwrap_err(),
            PipelineError::InvalidAddress { .. }
        ));

        let zero = TransferRequest::new(SENDER, RECIPIENT, 0);
        assert!(matches!(
            validate_request(Ledger::Utxo, &zero).unwrap_err(),
            PipelineError::InvalidAmount { .. }
        ));

        let too_large = TransferRequest::new(SENDER, RECIPIENT, u128::from(u64::MAX) + 1);
        assert!(validate_request(Ledger::Utxo, &too_large).is_err());
    }

    #[test]
    fn test_account_payload() {
        let from = "0x52908400098527886E0F7030069857D2E4169EE7";
        let to = "0x8617E340B3D01FA5F11F306F4090FD50E238070D";
        let request = TransferRequest::new(from, to, 0).with_overrides(BuildOverrides {
            payload: Some("0xa9059cbb".to_string()),
            ..Default::default()
        });
        assert!(validate_request(Ledger::Account, &request).is_ok());

        let fee = AccountFee {
            max_fee_per_gas: U256::from(10u64),
            max_priority_fee_per_gas: U256::from(1u64),
        };
        let tx = assemble_account(1, &request, 4, fee, 60_000).unwrap();
        assert_eq!(tx.data.as_ref().map(|d| d.len()), Some(4));
        validate(&UnsignedTransaction::Account(tx), 0).unwrap();

        assert!(matches!(
            decode_payload("0xzz").unwrap_err(),
            PipelineError::InvalidPayload(_)
        ));
    }

    #[test]
    fn test_account_validation() {
        let fee = AccountFee {
            max_fee_per_gas: U256::from(10u64),
            max_priority_fee_per_gas: U256::from(1u64),
        };
        let request = TransferRequest::new(
            "0x52908400098527886E0F7030069857D2E4169EE7",
            "0x8617E340B3D01FA5F11F306F4090FD50E238070D",
            5,
        );
        let tx = assemble_account(1, &request, 0, fee, 20_000).unwrap();
        assert!(validate(&UnsignedTransaction::Account(tx), 0).is_err());
    }

    #[test]
    fn test_fee_units() {
        let tx = UnsignedTransaction::Blockhash(
            assemble_blockhash(
                &TransferRequest::new("a", "b", 1_000_000),
                "hash".to_string(),
                5_000,
            )
            .unwrap(),
        );
        assert_eq!(fee_units(&tx), 1);
        assert_eq!(committed_fee(&tx), 5_000);
        assert!(validate(&tx, 890_880).is_ok());
    }
}
