//! Tesseract transaction pipeline
//!
//! Builds, prices, submits and tracks wallet transactions across three ledger
//! families: account/nonce chains, UTXO chains and recent-blockhash chains.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod pipeline;
pub mod signer;
pub mod tx;
pub mod types;

pub use config::Settings;
pub use error::{PipelineError, PipelineResult};
pub use ledger::Ledger;
pub use pipeline::TransactionPipeline;
pub use signer::TransactionSigner;
pub use types::{
    BroadcastResult, FeeEstimate, Priority, SignedTransaction, TxStatus, UnsignedTransaction,
};
