//! External signing capability
//!
//! Key custody and signature production live outside this crate. The pipeline
//! only needs something that turns an [`UnsignedTransaction`] into the
//! ledger's encoded signed envelope.

use crate::error::PipelineResult;
use crate::types::{SignedTransaction, UnsignedTransaction};

use async_trait::async_trait;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Return the wire-encoded signed transaction
    async fn sign(&self, transaction: &UnsignedTransaction) -> PipelineResult<Vec<u8>>;
}

/// Sign and wrap in one step
pub async fn sign_transaction(
    signer: &dyn TransactionSigner,
    transaction: UnsignedTransaction,
) -> PipelineResult<SignedTransaction> {
    let raw = signer.sign(&transaction).await?;
    Ok(SignedTransaction::new(transaction, raw))
}
