//! Ledger families and the per-ledger capability interface
//!
//! Every ledger family implements [`LedgerBackend`]. Callers resolve the
//! backend once per call through the [`LedgerRegistry`] and never branch on
//! ledger specifics themselves.

pub mod account;
pub mod blockhash;
pub mod utxo;

pub use account::{AccountLedger, AccountLedgerConfig};
pub use blockhash::{BlockhashLedger, BlockhashLedgerConfig};
pub use utxo::{UtxoLedger, UtxoLedgerConfig};

use crate::chain::{ChainState, ChainStatus, RpcService};
use crate::error::{PipelineError, PipelineResult};
use crate::tx::builder::TransferRequest;
use crate::types::{FeeEstimate, Priority, ScriptType, SignedTransaction, UnsignedTransaction};

use async_trait::async_trait;
use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info};

lazy_static! {
    static ref ACCOUNT_ADDRESS: Regex = Regex::new(r"^0x[0-9a-fA-F]{40}$").unwrap();
    static ref BASE58_UTXO_ADDRESS: Regex =
        Regex::new(r"^[123mn][1-9A-HJ-NP-Za-km-z]{25,34}$").unwrap();
    static ref BECH32_UTXO_ADDRESS: Regex =
        Regex::new(r"^(bc1|tb1|bcrt1)[ac-hj-np-z02-9]{8,87}$").unwrap();
    static ref BLOCKHASH_ADDRESS: Regex = Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$").unwrap();
}

/// The three supported transaction models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ledger {
    /// Account/nonce based
    Account,
    /// Unspent-output based
    Utxo,
    /// Recent-blockhash based, fixed fee
    Blockhash,
}

impl Ledger {
    pub const ALL: [Ledger; 3] = [Ledger::Account, Ledger::Utxo, Ledger::Blockhash];

    pub fn as_str(&self) -> &'static str {
        match self {
            Ledger::Account => "account",
            Ledger::Utxo => "utxo",
            Ledger::Blockhash => "blockhash",
        }
    }

    /// Confirmation depth treated as final
    pub fn confirmation_threshold(&self) -> u64 {
        match self {
            Ledger::Account => 12,
            Ledger::Utxo => 6,
            Ledger::Blockhash => 32,
        }
    }

    /// Whether a pending transaction can be superseded (replace or cancel)
    pub fn replacement(&self) -> Capability {
        match self {
            Ledger::Account => Capability::Supported,
            Ledger::Utxo => Capability::NotImplemented,
            Ledger::Blockhash => Capability::Unsupported,
        }
    }

    /// Check an address against this ledger's format
    pub fn validate_address(&self, address: &str) -> PipelineResult<()> {
        let valid = match self {
            Ledger::Account => ACCOUNT_ADDRESS.is_match(address),
            Ledger::Utxo => {
                BASE58_UTXO_ADDRESS.is_match(address) || BECH32_UTXO_ADDRESS.is_match(address)
            }
            Ledger::Blockhash => BLOCKHASH_ADDRESS.is_match(address),
        };

        if valid {
            Ok(())
        } else {
            Err(PipelineError::InvalidAddress {
                ledger: *self,
                address: address.to_string(),
                reason: format!("not a valid {} address", self),
            })
        }
    }
}

impl fmt::Display for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ledger {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "account" => Ok(Ledger::Account),
            "utxo" => Ok(Ledger::Utxo),
            "blockhash" => Ok(Ledger::Blockhash),
            other => Err(PipelineError::Config(format!("unknown ledger '{}'", other))),
        }
    }
}

/// Script family of a UTXO-ledger address
pub fn script_type_for(address: &str) -> ScriptType {
    if BECH32_UTXO_ADDRESS.is_match(address) {
        ScriptType::Witness
    } else {
        ScriptType::Legacy
    }
}

/// Protocol capability of a ledger for an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Supported,
    NotImplemented,
    Unsupported,
}

impl Capability {
    /// The error a caller sees when the capability is missing
    pub fn refusal(&self, ledger: Ledger, operation: &'static str) -> PipelineError {
        match self {
            Capability::NotImplemented => PipelineError::NotImplemented { ledger, operation },
            _ => PipelineError::Unsupported { ledger, operation },
        }
    }
}

/// One implementation per ledger family
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    fn ledger(&self) -> Ledger;

    /// Node collaborator serving this ledger
    fn rpc(&self) -> Arc<dyn RpcService>;

    /// Assemble and validate an unsigned transaction
    async fn build(&self, request: &TransferRequest) -> PipelineResult<UnsignedTransaction>;

    async fn estimate_fee(&self, priority: Priority) -> PipelineResult<FeeEstimate>;

    /// Submit a signed transaction, returning the network identifier
    async fn submit(&self, transaction: &SignedTransaction) -> PipelineResult<String>;

    async fn status(&self, hash: &str) -> PipelineResult<ChainStatus>;

    /// Same-slot replacement at a higher fee
    fn replacement(
        &self,
        _hash: &str,
        _original: &UnsignedTransaction,
        _new_fee: u128,
    ) -> PipelineResult<UnsignedTransaction> {
        Err(self.ledger().replacement().refusal(self.ledger(), "replace"))
    }

    /// Zero-value self transfer superseding the original
    fn cancellation(
        &self,
        _hash: &str,
        _original: &UnsignedTransaction,
    ) -> PipelineResult<UnsignedTransaction> {
        Err(self.ledger().replacement().refusal(self.ledger(), "cancel"))
    }

    /// Called once a broadcast transaction reaches a terminal outcome
    async fn settle(&self, _transaction: &UnsignedTransaction, _outcome: ChainState) {}

    /// Called when the node rejected a fresh submission. Not called for a
    /// rejected replacement, whose original still holds the slot.
    async fn abandon(&self, _transaction: &UnsignedTransaction) {}
}

/// Backends for every configured ledger
pub struct LedgerRegistry {
    backends: DashMap<Ledger, Arc<dyn LedgerBackend>>,
}

impl LedgerRegistry {
    pub fn new() -> Self {
        Self {
            backends: DashMap::new(),
        }
    }

    pub fn insert(&self, backend: Arc<dyn LedgerBackend>) {
        let ledger = backend.ledger();
        self.backends.insert(ledger, backend);
        info!("Ledger {} registered", ledger);
    }

    pub fn get(&self, ledger: Ledger) -> PipelineResult<Arc<dyn LedgerBackend>> {
        self.backends
            .get(&ledger)
            .map(|b| b.clone())
            .ok_or(PipelineError::LedgerNotConfigured { ledger })
    }

    /// Configured ledgers in declaration order
    pub fn ledgers(&self) -> Vec<Ledger> {
        Ledger::ALL
            .into_iter()
            .filter(|l| self.backends.contains_key(l))
            .collect()
    }

    /// Ask every configured node for its latest block, all at once
    pub async fn health_check(&self) -> Vec<(Ledger, bool)> {
        let checks = self.ledgers().into_iter().filter_map(|ledger| {
            let rpc = self.backends.get(&ledger)?.rpc();
            Some(async move {
                let healthy = match rpc.latest_block().await {
                    Ok(height) => {
                        debug!("Ledger {} at height {}", ledger, height);
                        crate::metrics::record_block_height(ledger, height);
                        true
                    }
                    Err(e) => {
                        error!("Health check failed for ledger {}: {}", ledger, e);
                        false
                    }
                };
                crate::metrics::record_ledger_health(ledger, healthy);
                (ledger, healthy)
            })
        });

        futures::future::join_all(checks).await
    }
}

impl Default for LedgerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
