//! Double-entry ledger core for small-business accounting.
//!
//! The engine services in this crate sit on top of a pluggable
//! [`StorageBackend`]: `tallybook-memory` for tests and ephemeral use,
//! `tallybook-sqlite` for a durable single-file store. All money movement
//! goes through [`JournalEngine`] as balanced, immutable entries; document
//! headers and every report are derived views over that journal.

pub mod balance;
pub mod chart;
pub mod error;
pub mod journal;
pub mod lifecycle;
pub mod reports;

pub use balance::BalanceCalculator;
pub use chart::AccountDirectory;
pub use error::LedgerError;
pub use journal::JournalEngine;
pub use lifecycle::DocumentLifecycle;
pub use reports::Reports;

pub use tallybook_core::{
    Account, AccountId, AccountStatement, AccountType, BalanceSheet, CounterpartyId,
    CreateAccountCommand, Currency, Document, DocumentId, DocumentKind, DocumentStatus,
    DraftDocumentCommand, EntryId, IncomeStatement, JournalEntry, JournalLine, JournalView,
    LedgerRow, LineCommand, LineItem, Money, MoneyError, Organization, OrganizationId, Payment,
    PaymentApplication, PaymentKind, PaymentMethod, PostEntryCommand, RecordPaymentCommand,
    ReportLine, Side, StorageBackend, StorageError, SystemRole, TransactionType, TrialBalance,
    TrialBalanceRow,
};
pub use tallybook_memory::InMemoryStorage;
pub use tallybook_sqlite::SqliteStorage;
