//! Core types and traits for Tallybook storage backends.
//!
//! This crate provides the `StorageBackend` trait and all associated types,
//! enabling pluggable storage implementations in separate crates.

pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use models::documents::{
    settled_status, Document, DocumentKind, DocumentStatus, LineItem, Payment,
    PaymentApplication, PaymentKind, PaymentMethod,
};
pub use models::money::{Currency, Money, MoneyError};
pub use models::read::{
    AccountStatement, BalanceSheet, IncomeStatement, JournalView, LedgerRow, PostedLine,
    ReportLine, TrialBalance, TrialBalanceRow,
};
pub use models::write::{
    CreateAccountCommand, DraftDocumentCommand, LineCommand, PostEntryCommand,
    RecordPaymentCommand,
};
pub use models::{
    Account, AccountId, AccountType, CounterpartyId, DocumentId, EntryId, JournalEntry,
    JournalLine, Organization, OrganizationId, Side, SystemRole, TransactionType,
};
pub use storage::{StorageBackend, StorageError, TransactionId};
