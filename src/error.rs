use rust_decimal::Decimal;
use thiserror::Error;

use tallybook_core::{AccountId, DocumentId, DocumentStatus, MoneyError, StorageError};

/// Engine-level failures. Storage and money errors pass through; everything
/// else is a rule of the ledger itself.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("journal entry has no lines")]
    EmptyEntry,
    #[error("journal entry does not balance: debits {debits}, credits {credits}")]
    UnbalancedEntry { debits: Decimal, credits: Decimal },
    #[error("account {0} does not belong to this organization")]
    ForeignAccount(AccountId),
    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: DocumentStatus,
        to: DocumentStatus,
    },
    #[error("payment exceeds amount due on document {0}")]
    Overpayment(DocumentId),
    #[error("concurrent update on document {0}, retries exhausted")]
    Conflict(DocumentId),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Money(#[from] MoneyError),
}

impl LedgerError {
    /// Transient storage failures are safe to retry; postings are idempotent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Storage(StorageError::Unavailable(_)))
    }
}
