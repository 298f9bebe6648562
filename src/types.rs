//! Data model shared by builders, the broadcaster and the monitor

use crate::ledger::Ledger;

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Spend-script family of an output, drives size estimation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
    Legacy,
    Witness,
}

/// Reference to an output of a previous transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: String,
    pub vout: u32,
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// Unspent transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub amount: u64,
    pub address: String,
    pub script_type: ScriptType,
    #[serde(default)]
    pub spent: bool,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid.clone(),
            vout: self.vout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub amount: u64,
    pub script_type: ScriptType,
}

/// EIP-1559 style fee parameters, wei per gas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFee {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountTransaction {
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub nonce: u64,
    pub fee: AccountFee,
    pub data: Option<Bytes>,
    pub gas_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoTransaction {
    pub from: String,
    pub to: String,
    pub amount: u64,
    /// Selected inputs, largest first
    pub inputs: Vec<Utxo>,
    pub outputs: Vec<TxOutput>,
    pub fee: u64,
    /// Satoshi per virtual byte, absent for absolute-fee builds
    pub fee_rate: Option<u64>,
}

impl UtxoTransaction {
    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|u| u.amount).sum()
    }

    pub fn output_total(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// Change returned to the sender, if any
    pub fn change(&self) -> Option<&TxOutput> {
        self.outputs.iter().skip(1).find(|o| o.address == self.from)
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.inputs.iter().map(Utxo::outpoint).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockhashTransaction {
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub recent_blockhash: String,
    pub fee: u64,
}

/// Transaction ready for the external signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ledger", rename_all = "lowercase")]
pub enum UnsignedTransaction {
    Account(AccountTransaction),
    Utxo(UtxoTransaction),
    Blockhash(BlockhashTransaction),
}

impl UnsignedTransaction {
    pub fn ledger(&self) -> Ledger {
        match self {
            UnsignedTransaction::Account(_) => Ledger::Account,
            UnsignedTransaction::Utxo(_) => Ledger::Utxo,
            UnsignedTransaction::Blockhash(_) => Ledger::Blockhash,
        }
    }

    pub fn sender(&self) -> String {
        match self {
            UnsignedTransaction::Account(tx) => format!("{:?}", tx.from),
            UnsignedTransaction::Utxo(tx) => tx.from.clone(),
            UnsignedTransaction::Blockhash(tx) => tx.from.clone(),
        }
    }

    pub fn recipient(&self) -> String {
        match self {
            UnsignedTransaction::Account(tx) => format!("{:?}", tx.to),
            UnsignedTransaction::Utxo(tx) => tx.to.clone(),
            UnsignedTransaction::Blockhash(tx) => tx.to.clone(),
        }
    }
}

/// Unsigned transaction plus the encoded signature envelope from the signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub transaction: UnsignedTransaction,
    #[serde(with = "hex::serde")]
    pub raw: Vec<u8>,
}

impl SignedTransaction {
    pub fn new(transaction: UnsignedTransaction, raw: Vec<u8>) -> Self {
        Self { transaction, raw }
    }

    pub fn ledger(&self) -> Ledger {
        self.transaction.ledger()
    }
}

/// Caller urgency
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Multiplier as a (numerator, denominator) pair: 0.8, 1.0, 1.5
    fn ratio(&self) -> (u128, u128) {
        match self {
            Priority::Low => (4, 5),
            Priority::Medium => (1, 1),
            Priority::High => (3, 2),
        }
    }

    pub fn scale(&self, value: u128) -> u128 {
        let (num, den) = self.ratio();
        value.saturating_mul(num) / den
    }
}

/// Raw rate reported for one confirmation target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRate {
    pub target_blocks: u16,
    pub rate: u128,
}

/// Fee rate tiers for a ledger.
///
/// Rates are wei per gas (account), satoshi per virtual byte (utxo) or
/// lamports per signature (blockhash).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeEstimate {
    pub ledger: Ledger,
    pub priority: Priority,
    pub low: u128,
    pub medium: u128,
    pub high: u128,
    /// Account ledger only
    pub base_fee: Option<u128>,
    /// Account ledger only, for the requested priority
    pub priority_fee: Option<u128>,
    /// Raw per-target answers (utxo ledger)
    pub targets: Vec<TargetRate>,
    pub timestamp: DateTime<Utc>,
}

impl FeeEstimate {
    /// Rate for the requested priority
    pub fn rate(&self) -> u128 {
        match self.priority {
            Priority::Low => self.low,
            Priority::Medium => self.medium,
            Priority::High => self.high,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Broadcasted,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResult {
    /// Local correlation id, assigned before any network call
    pub request_id: Uuid,
    pub ledger: Ledger,
    /// Network identifier, empty until the node accepts the submission
    pub hash: String,
    pub status: TxStatus,
    pub timestamp: DateTime<Utc>,
    pub confirmations: u64,
}

impl BroadcastResult {
    pub fn pending(ledger: Ledger) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            ledger,
            hash: String::new(),
            status: TxStatus::Pending,
            timestamp: Utc::now(),
            confirmations: 0,
        }
    }
}
