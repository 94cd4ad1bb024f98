use std::ops::Bound;

use time::Date;

use crate::models::documents::{Document, DocumentKind, Payment};
use crate::models::read::PostedLine;
use crate::models::{
    Account, AccountId, DocumentId, EntryId, JournalEntry, JournalLine, Organization,
    OrganizationId, SystemRole, TransactionType,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
    /// Transient failure; postings are idempotent, so retrying is safe.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("organization not found: {0}")]
    OrganizationNotFound(OrganizationId),
    #[error("organization already exists: {0}")]
    OrganizationAlreadyExists(OrganizationId),
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),
    #[error("journal entry not found: {0}")]
    EntryNotFound(EntryId),
    #[error("duplicate journal entry for source {source_document_id} ({transaction_type})")]
    DuplicateEntry {
        source_document_id: DocumentId,
        transaction_type: TransactionType,
    },
    #[error("entry {0} is already reversed")]
    DuplicateReversal(EntryId),
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),
    #[error("payment not found: {0}")]
    PaymentNotFound(DocumentId),
    #[error("stale document version for {0}")]
    VersionConflict(DocumentId),
    #[error("no active transaction")]
    NoActiveTransaction,
}

pub type TransactionId = u64;

/// Persistence seam for the ledger core. All data operations are scoped to
/// one organization; backends must never let reads cross that boundary.
pub trait StorageBackend: Send + Sync {
    fn create_organization(&self, organization: &Organization) -> Result<(), StorageError>;
    fn organization(&self, organization_id: OrganizationId)
        -> Result<Organization, StorageError>;

    fn insert_account(&self, account: &Account) -> Result<(), StorageError>;
    fn account(
        &self,
        organization_id: OrganizationId,
        account_id: AccountId,
    ) -> Result<Account, StorageError>;
    fn update_account(&self, account: &Account) -> Result<(), StorageError>;
    fn list_accounts(&self, organization_id: OrganizationId) -> Result<Vec<Account>, StorageError>;
    fn system_account(
        &self,
        organization_id: OrganizationId,
        role: SystemRole,
    ) -> Result<Option<Account>, StorageError>;

    /// Appends an immutable entry and its lines. For regular entries,
    /// backends enforce `(organization, source_document, transaction_type)`
    /// uniqueness and answer a violation with `DuplicateEntry`. Entries with
    /// `reverses` set are instead unique per reversed entry and violations
    /// answer with `DuplicateReversal`.
    fn insert_entry(
        &self,
        entry: &JournalEntry,
        lines: &[JournalLine],
    ) -> Result<(), StorageError>;
    fn entry(
        &self,
        organization_id: OrganizationId,
        entry_id: EntryId,
    ) -> Result<(JournalEntry, Vec<JournalLine>), StorageError>;
    /// Idempotency lookup for regular postings; never matches reversals.
    fn entry_for_source(
        &self,
        organization_id: OrganizationId,
        source_document_id: DocumentId,
        transaction_type: TransactionType,
    ) -> Result<Option<JournalEntry>, StorageError>;
    /// The compensating entry posted against `entry_id`, if one exists.
    fn reversal_of(
        &self,
        organization_id: OrganizationId,
        entry_id: EntryId,
    ) -> Result<Option<JournalEntry>, StorageError>;
    fn entries_for_source(
        &self,
        organization_id: OrganizationId,
        source_document_id: DocumentId,
    ) -> Result<Vec<JournalEntry>, StorageError>;
    fn entries_in_range(
        &self,
        organization_id: OrganizationId,
        from: Bound<Date>,
        to: Bound<Date>,
    ) -> Result<Vec<(JournalEntry, Vec<JournalLine>)>, StorageError>;
    /// Per-account lines ordered by (transaction_date, entry sequence).
    fn lines_for_account(
        &self,
        organization_id: OrganizationId,
        account_id: AccountId,
        from: Bound<Date>,
        to: Bound<Date>,
    ) -> Result<Vec<PostedLine>, StorageError>;
    /// Next value of the organization-wide monotonic journal sequence.
    fn next_sequence(&self) -> Result<u64, StorageError>;

    fn insert_document(&self, document: &Document) -> Result<(), StorageError>;
    fn document(
        &self,
        organization_id: OrganizationId,
        document_id: DocumentId,
    ) -> Result<Document, StorageError>;
    /// Compare-and-swap on the header: succeeds only when the stored version
    /// equals `expected_version`, and stores the header with version + 1.
    fn update_document(
        &self,
        document: &Document,
        expected_version: u64,
    ) -> Result<(), StorageError>;
    fn list_documents(
        &self,
        organization_id: OrganizationId,
        kind: DocumentKind,
    ) -> Result<Vec<Document>, StorageError>;

    fn insert_payment(&self, payment: &Payment) -> Result<(), StorageError>;
    fn payment(
        &self,
        organization_id: OrganizationId,
        payment_id: DocumentId,
    ) -> Result<Payment, StorageError>;

    fn begin_transaction(&self) -> Result<TransactionId, StorageError>;
    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError>;
    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError>;
}
