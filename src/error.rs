//! Error types for the transaction pipeline

use crate::ledger::Ledger;
use thiserror::Error;

/// Main error type for the pipeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid {ledger} address {address}: {reason}")]
    InvalidAddress {
        ledger: Ledger,
        address: String,
        reason: String,
    },

    #[error("Invalid amount {amount} on {ledger}: {reason}")]
    InvalidAmount {
        ledger: Ledger,
        amount: u128,
        reason: String,
    },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Output of {amount} on {ledger} is below the dust threshold {threshold}")]
    DustOutput {
        ledger: Ledger,
        amount: u128,
        threshold: u128,
    },

    #[error("Invalid {ledger} transaction: {reason}")]
    InvalidTransaction { ledger: Ledger, reason: String },

    #[error("Fee sample is empty")]
    EmptyFeeSample,

    #[error("Replacement fee {proposed} for {hash} is below the minimum {minimum} (original {original})")]
    FeeBumpTooLow {
        hash: String,
        original: u128,
        proposed: u128,
        minimum: u128,
    },

    #[error("Insufficient funds for {address} on {ledger}: have {available}, need {required}")]
    InsufficientFunds {
        ledger: Ledger,
        address: String,
        available: u128,
        required: u128,
    },

    #[error("Nonce query failed for {address} on {ledger}: {message}")]
    NonceQuery {
        ledger: Ledger,
        address: String,
        message: String,
    },

    #[error("UTXO query failed for {address}: {message}")]
    UtxoQuery { address: String, message: String },

    #[error("Fee query failed on {ledger}: {message}")]
    FeeQuery { ledger: Ledger, message: String },

    #[error("Block reference query failed on {ledger}: {message}")]
    BlockReference { ledger: Ledger, message: String },

    #[error("Submission failed on {ledger}: {message}")]
    Submission { ledger: Ledger, message: String },

    #[error("Status query failed for {hash} on {ledger}: {message}")]
    StatusQuery {
        ledger: Ledger,
        hash: String,
        message: String,
    },

    #[error("{operation} is not supported on {ledger}")]
    Unsupported {
        ledger: Ledger,
        operation: &'static str,
    },

    #[error("{operation} is not yet implemented on {ledger}")]
    NotImplemented {
        ledger: Ledger,
        operation: &'static str,
    },

    #[error("Transaction {hash} not found")]
    TransactionNotFound { hash: String },

    #[error("Ledger {ledger} is not configured")]
    LedgerNotConfigured { ledger: Ledger },

    #[error("Signer error: {0}")]
    Signer(String),
}

/// Broad classes callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Resource,
    Transient,
    Capability,
    State,
    Internal,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidAddress { .. }
            | PipelineError::InvalidAmount { .. }
            | PipelineError::InvalidPayload(_)
            | PipelineError::DustOutput { .. }
            | PipelineError::InvalidTransaction { .. }
            | PipelineError::EmptyFeeSample
            | PipelineError::FeeBumpTooLow { .. } => ErrorKind::Input,
            PipelineError::InsufficientFunds { .. } => ErrorKind::Resource,
            PipelineError::NonceQuery { .. }
            | PipelineError::UtxoQuery { .. }
            | PipelineError::FeeQuery { .. }
            | PipelineError::BlockReference { .. }
            | PipelineError::Submission { .. }
            | PipelineError::StatusQuery { .. } => ErrorKind::Transient,
            PipelineError::Unsupported { .. } | PipelineError::NotImplemented { .. } => {
                ErrorKind::Capability
            }
            PipelineError::TransactionNotFound { .. }
            | PipelineError::LedgerNotConfigured { .. } => ErrorKind::State,
            PipelineError::Config(_) | PipelineError::Signer(_) => ErrorKind::Internal,
        }
    }

    /// Check if error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
