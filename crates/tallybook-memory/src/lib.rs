//! In-memory storage backend, primarily for tests and embedding.
//!
//! Transactions are whole-state snapshots and serialize the store: while one
//! is open, every access from other threads blocks until it commits or rolls
//! back, so a rollback can never clobber a neighbour's writes. The owning
//! thread may nest transactions; each level snapshots independently. The
//! sqlite backend handles durability.

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex, MutexGuard,
    },
    thread::{self, ThreadId},
};

use time::Date;

use tallybook_core::{
    Account, AccountId, Document, DocumentId, DocumentKind, EntryId, JournalEntry, JournalLine,
    Organization, OrganizationId, Payment, PostedLine, StorageBackend, StorageError, SystemRole,
    TransactionId, TransactionType,
};

#[derive(Clone)]
struct OrgData {
    organization: Organization,
    accounts: BTreeMap<AccountId, Account>,
    entries: BTreeMap<EntryId, (JournalEntry, Vec<JournalLine>)>,
    entries_by_source: HashMap<(DocumentId, TransactionType), EntryId>,
    reversals: HashMap<EntryId, EntryId>,
    /// Per-account posted lines partitioned by transaction date. Appends are
    /// in sequence order, so each day's vec is already insertion-ordered.
    account_lines: HashMap<AccountId, BTreeMap<Date, Vec<PostedLine>>>,
    documents: BTreeMap<DocumentId, Document>,
    payments: BTreeMap<DocumentId, Payment>,
}

impl OrgData {
    fn new(organization: Organization) -> Self {
        Self {
            organization,
            accounts: BTreeMap::new(),
            entries: BTreeMap::new(),
            entries_by_source: HashMap::new(),
            reversals: HashMap::new(),
            account_lines: HashMap::new(),
            documents: BTreeMap::new(),
            payments: BTreeMap::new(),
        }
    }
}

struct Snapshot {
    organizations: BTreeMap<OrganizationId, OrgData>,
    sequence_value: u64,
}

struct TxState {
    owner: ThreadId,
    /// Innermost transaction last.
    stack: Vec<(TransactionId, Snapshot)>,
}

struct Shared {
    organizations: BTreeMap<OrganizationId, OrgData>,
    sequence_value: u64,
    tx: Option<TxState>,
}

pub struct InMemoryStorage {
    shared: Mutex<Shared>,
    tx_done: Condvar,
    tx_counter: AtomicU64,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            shared: Mutex::new(Shared {
                organizations: BTreeMap::new(),
                sequence_value: 0,
                tx: None,
            }),
            tx_done: Condvar::new(),
            tx_counter: AtomicU64::new(1),
        }
    }

    /// Locks the store, waiting out any transaction owned by another thread.
    fn lock(&self) -> MutexGuard<'_, Shared> {
        let mut shared = self.shared.lock().unwrap();
        while shared
            .tx
            .as_ref()
            .is_some_and(|tx| tx.owner != thread::current().id())
        {
            shared = self.tx_done.wait(shared).unwrap();
        }
        shared
    }
}

fn in_bounds(date: Date, from: &Bound<Date>, to: &Bound<Date>) -> bool {
    let after_from = match from {
        Bound::Included(d) => date >= *d,
        Bound::Excluded(d) => date > *d,
        Bound::Unbounded => true,
    };
    let before_to = match to {
        Bound::Included(d) => date <= *d,
        Bound::Excluded(d) => date < *d,
        Bound::Unbounded => true,
    };
    after_from && before_to
}

impl StorageBackend for InMemoryStorage {
    fn create_organization(&self, organization: &Organization) -> Result<(), StorageError> {
        let mut shared = self.lock();
        if shared.organizations.contains_key(&organization.id) {
            return Err(StorageError::OrganizationAlreadyExists(organization.id));
        }
        shared
            .organizations
            .insert(organization.id, OrgData::new(organization.clone()));
        Ok(())
    }

    fn organization(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Organization, StorageError> {
        let shared = self.lock();
        shared
            .organizations
            .get(&organization_id)
            .map(|o| o.organization.clone())
            .ok_or(StorageError::OrganizationNotFound(organization_id))
    }

    fn insert_account(&self, account: &Account) -> Result<(), StorageError> {
        let mut shared = self.lock();
        let org = shared
            .organizations
            .get_mut(&account.organization_id)
            .ok_or(StorageError::OrganizationNotFound(account.organization_id))?;
        org.accounts.insert(account.id, account.clone());
        Ok(())
    }

    fn account(
        &self,
        organization_id: OrganizationId,
        account_id: AccountId,
    ) -> Result<Account, StorageError> {
        let shared = self.lock();
        let org = shared
            .organizations
            .get(&organization_id)
            .ok_or(StorageError::OrganizationNotFound(organization_id))?;
        org.accounts
            .get(&account_id)
            .cloned()
            .ok_or(StorageError::AccountNotFound(account_id))
    }

    fn update_account(&self, account: &Account) -> Result<(), StorageError> {
        let mut shared = self.lock();
        let org = shared
            .organizations
            .get_mut(&account.organization_id)
            .ok_or(StorageError::OrganizationNotFound(account.organization_id))?;
        if !org.accounts.contains_key(&account.id) {
            return Err(StorageError::AccountNotFound(account.id));
        }
        org.accounts.insert(account.id, account.clone());
        Ok(())
    }

    fn list_accounts(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<Account>, StorageError> {
        let shared = self.lock();
        let org = shared
            .organizations
            .get(&organization_id)
            .ok_or(StorageError::OrganizationNotFound(organization_id))?;
        Ok(org.accounts.values().cloned().collect())
    }

    fn system_account(
        &self,
        organization_id: OrganizationId,
        role: SystemRole,
    ) -> Result<Option<Account>, StorageError> {
        let shared = self.lock();
        let org = shared
            .organizations
            .get(&organization_id)
            .ok_or(StorageError::OrganizationNotFound(organization_id))?;
        Ok(org
            .accounts
            .values()
            .find(|a| a.system_role == Some(role))
            .cloned())
    }

    fn insert_entry(
        &self,
        entry: &JournalEntry,
        lines: &[JournalLine],
    ) -> Result<(), StorageError> {
        let mut shared = self.lock();
        let org = shared
            .organizations
            .get_mut(&entry.organization_id)
            .ok_or(StorageError::OrganizationNotFound(entry.organization_id))?;

        let source_key = (entry.source_document_id, entry.transaction_type);
        match entry.reverses {
            Some(reversed) => {
                if org.reversals.contains_key(&reversed) {
                    return Err(StorageError::DuplicateReversal(reversed));
                }
            }
            None => {
                if org.entries_by_source.contains_key(&source_key) {
                    return Err(StorageError::DuplicateEntry {
                        source_document_id: entry.source_document_id,
                        transaction_type: entry.transaction_type,
                    });
                }
            }
        }

        for line in lines {
            if !org.accounts.contains_key(&line.account_id) {
                return Err(StorageError::AccountNotFound(line.account_id));
            }
        }

        for line in lines {
            let posted = PostedLine {
                entry_id: entry.id,
                sequence: entry.sequence,
                date: entry.transaction_date,
                description: line.description.clone(),
                side: line.side,
                amount: line.amount,
            };
            org.account_lines
                .entry(line.account_id)
                .or_default()
                .entry(entry.transaction_date)
                .or_default()
                .push(posted);
        }

        match entry.reverses {
            Some(reversed) => {
                org.reversals.insert(reversed, entry.id);
            }
            None => {
                org.entries_by_source.insert(source_key, entry.id);
            }
        }
        org.entries.insert(entry.id, (entry.clone(), lines.to_vec()));
        Ok(())
    }

    fn entry(
        &self,
        organization_id: OrganizationId,
        entry_id: EntryId,
    ) -> Result<(JournalEntry, Vec<JournalLine>), StorageError> {
        let shared = self.lock();
        let org = shared
            .organizations
            .get(&organization_id)
            .ok_or(StorageError::OrganizationNotFound(organization_id))?;
        org.entries
            .get(&entry_id)
            .cloned()
            .ok_or(StorageError::EntryNotFound(entry_id))
    }

    fn entry_for_source(
        &self,
        organization_id: OrganizationId,
        source_document_id: DocumentId,
        transaction_type: TransactionType,
    ) -> Result<Option<JournalEntry>, StorageError> {
        let shared = self.lock();
        let org = shared
            .organizations
            .get(&organization_id)
            .ok_or(StorageError::OrganizationNotFound(organization_id))?;
        Ok(org
            .entries_by_source
            .get(&(source_document_id, transaction_type))
            .and_then(|id| org.entries.get(id))
            .map(|(entry, _)| entry.clone()))
    }

    fn reversal_of(
        &self,
        organization_id: OrganizationId,
        entry_id: EntryId,
    ) -> Result<Option<JournalEntry>, StorageError> {
        let shared = self.lock();
        let org = shared
            .organizations
            .get(&organization_id)
            .ok_or(StorageError::OrganizationNotFound(organization_id))?;
        Ok(org
            .reversals
            .get(&entry_id)
            .and_then(|id| org.entries.get(id))
            .map(|(entry, _)| entry.clone()))
    }

    fn entries_for_source(
        &self,
        organization_id: OrganizationId,
        source_document_id: DocumentId,
    ) -> Result<Vec<JournalEntry>, StorageError> {
        let shared = self.lock();
        let org = shared
            .organizations
            .get(&organization_id)
            .ok_or(StorageError::OrganizationNotFound(organization_id))?;
        let mut result: Vec<JournalEntry> = org
            .entries
            .values()
            .filter(|(e, _)| e.source_document_id == source_document_id)
            .map(|(e, _)| e.clone())
            .collect();
        result.sort_by_key(|e| e.sequence);
        Ok(result)
    }

    fn entries_in_range(
        &self,
        organization_id: OrganizationId,
        from: Bound<Date>,
        to: Bound<Date>,
    ) -> Result<Vec<(JournalEntry, Vec<JournalLine>)>, StorageError> {
        let shared = self.lock();
        let org = shared
            .organizations
            .get(&organization_id)
            .ok_or(StorageError::OrganizationNotFound(organization_id))?;
        let mut result: Vec<(JournalEntry, Vec<JournalLine>)> = org
            .entries
            .values()
            .filter(|(e, _)| in_bounds(e.transaction_date, &from, &to))
            .cloned()
            .collect();
        result.sort_by_key(|(e, _)| (e.transaction_date, e.sequence));
        Ok(result)
    }

    fn lines_for_account(
        &self,
        organization_id: OrganizationId,
        account_id: AccountId,
        from: Bound<Date>,
        to: Bound<Date>,
    ) -> Result<Vec<PostedLine>, StorageError> {
        let shared = self.lock();
        let org = shared
            .organizations
            .get(&organization_id)
            .ok_or(StorageError::OrganizationNotFound(organization_id))?;
        if !org.accounts.contains_key(&account_id) {
            return Err(StorageError::AccountNotFound(account_id));
        }

        let mut result = Vec::new();
        if let Some(days) = org.account_lines.get(&account_id) {
            for (_, lines) in days.range((from, to)) {
                result.extend(lines.iter().cloned());
            }
        }
        Ok(result)
    }

    fn next_sequence(&self) -> Result<u64, StorageError> {
        let mut shared = self.lock();
        shared.sequence_value += 1;
        Ok(shared.sequence_value)
    }

    fn insert_document(&self, document: &Document) -> Result<(), StorageError> {
        let mut shared = self.lock();
        let org = shared
            .organizations
            .get_mut(&document.organization_id)
            .ok_or(StorageError::OrganizationNotFound(document.organization_id))?;
        org.documents.insert(document.id, document.clone());
        Ok(())
    }

    fn document(
        &self,
        organization_id: OrganizationId,
        document_id: DocumentId,
    ) -> Result<Document, StorageError> {
        let shared = self.lock();
        let org = shared
            .organizations
            .get(&organization_id)
            .ok_or(StorageError::OrganizationNotFound(organization_id))?;
        org.documents
            .get(&document_id)
            .cloned()
            .ok_or(StorageError::DocumentNotFound(document_id))
    }

    fn update_document(
        &self,
        document: &Document,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        let mut shared = self.lock();
        let org = shared
            .organizations
            .get_mut(&document.organization_id)
            .ok_or(StorageError::OrganizationNotFound(document.organization_id))?;
        let stored = org
            .documents
            .get_mut(&document.id)
            .ok_or(StorageError::DocumentNotFound(document.id))?;
        if stored.version != expected_version {
            return Err(StorageError::VersionConflict(document.id));
        }
        let mut updated = document.clone();
        updated.version = expected_version + 1;
        *stored = updated;
        Ok(())
    }

    fn list_documents(
        &self,
        organization_id: OrganizationId,
        kind: DocumentKind,
    ) -> Result<Vec<Document>, StorageError> {
        let shared = self.lock();
        let org = shared
            .organizations
            .get(&organization_id)
            .ok_or(StorageError::OrganizationNotFound(organization_id))?;
        Ok(org
            .documents
            .values()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect())
    }

    fn insert_payment(&self, payment: &Payment) -> Result<(), StorageError> {
        let mut shared = self.lock();
        let org = shared
            .organizations
            .get_mut(&payment.organization_id)
            .ok_or(StorageError::OrganizationNotFound(payment.organization_id))?;
        org.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    fn payment(
        &self,
        organization_id: OrganizationId,
        payment_id: DocumentId,
    ) -> Result<Payment, StorageError> {
        let shared = self.lock();
        let org = shared
            .organizations
            .get(&organization_id)
            .ok_or(StorageError::OrganizationNotFound(organization_id))?;
        org.payments
            .get(&payment_id)
            .cloned()
            .ok_or(StorageError::PaymentNotFound(payment_id))
    }

    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let mut shared = self.lock();
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let snapshot = Snapshot {
            organizations: shared.organizations.clone(),
            sequence_value: shared.sequence_value,
        };
        match &mut shared.tx {
            Some(tx) => tx.stack.push((tx_id, snapshot)),
            None => {
                shared.tx = Some(TxState {
                    owner: thread::current().id(),
                    stack: vec![(tx_id, snapshot)],
                });
            }
        }
        tracing::debug!(tx_id, "Transaction started");
        Ok(tx_id)
    }

    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut shared = self.lock();
        let finished = {
            let tx = shared.tx.as_mut().ok_or(StorageError::NoActiveTransaction)?;
            // Only the innermost transaction may end.
            match tx.stack.last() {
                Some((id, _)) if *id == tx_id => {
                    tx.stack.pop();
                }
                _ => return Err(StorageError::NoActiveTransaction),
            }
            tx.stack.is_empty()
        };
        if finished {
            shared.tx = None;
            drop(shared);
            self.tx_done.notify_all();
        }
        tracing::debug!(tx_id, "Transaction committed");
        Ok(())
    }

    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut shared = self.lock();
        let (snapshot, finished) = {
            let tx = shared.tx.as_mut().ok_or(StorageError::NoActiveTransaction)?;
            let snapshot = match tx.stack.last() {
                Some((id, _)) if *id == tx_id => tx.stack.pop().map(|(_, s)| s),
                _ => None,
            }
            .ok_or(StorageError::NoActiveTransaction)?;
            (snapshot, tx.stack.is_empty())
        };
        shared.organizations = snapshot.organizations;
        shared.sequence_value = snapshot.sequence_value;
        if finished {
            shared.tx = None;
            drop(shared);
            self.tx_done.notify_all();
        }
        tracing::debug!(tx_id, "Transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;
    use tallybook_core::{AccountType, Currency, Money, Side};
    use time::Month;

    fn usd() -> Currency {
        Currency::from_code("USD").unwrap()
    }

    fn seed_org(storage: &InMemoryStorage) -> (OrganizationId, AccountId, AccountId) {
        let org = Organization {
            id: OrganizationId::new(),
            name: Arc::from("Test Co"),
            currency: usd(),
        };
        storage.create_organization(&org).unwrap();

        let bank = Account {
            id: AccountId::new(),
            organization_id: org.id,
            name: Arc::from("Bank"),
            account_type: AccountType::Asset,
            normal_side: Side::Debit,
            parent_account_id: None,
            system_role: Some(SystemRole::Cash),
            is_active: true,
            currency: usd(),
        };
        let equity = Account {
            id: AccountId::new(),
            organization_id: org.id,
            name: Arc::from("Equity"),
            account_type: AccountType::Equity,
            normal_side: Side::Credit,
            parent_account_id: None,
            system_role: None,
            is_active: true,
            currency: usd(),
        };
        storage.insert_account(&bank).unwrap();
        storage.insert_account(&equity).unwrap();
        (org.id, bank.id, equity.id)
    }

    fn balanced_entry(
        org: OrganizationId,
        bank: AccountId,
        equity: AccountId,
        seq: u64,
        date: Date,
    ) -> (JournalEntry, Vec<JournalLine>) {
        let entry = JournalEntry {
            id: EntryId::new(),
            organization_id: org,
            sequence: seq,
            transaction_date: date,
            transaction_type: TransactionType::Adjustment,
            source_document_id: DocumentId::new(),
            reverses: None,
            created_at: time::OffsetDateTime::now_utc(),
        };
        let lines = vec![
            JournalLine {
                entry_id: entry.id,
                account_id: bank,
                side: Side::Debit,
                amount: Money::new(dec!(1000), usd()),
                description: Arc::from("Investment"),
            },
            JournalLine {
                entry_id: entry.id,
                account_id: equity,
                side: Side::Credit,
                amount: Money::new(dec!(1000), usd()),
                description: Arc::from("Investment"),
            },
        ];
        (entry, lines)
    }

    #[test]
    fn duplicate_source_is_rejected() {
        let storage = InMemoryStorage::new();
        let (org, bank, equity) = seed_org(&storage);
        let date = Date::from_calendar_date(2024, Month::March, 1).unwrap();

        let (entry, lines) = balanced_entry(org, bank, equity, 1, date);
        storage.insert_entry(&entry, &lines).unwrap();

        let mut dup = entry.clone();
        dup.id = EntryId::new();
        dup.sequence = 2;
        let err = storage.insert_entry(&dup, &lines).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateEntry { .. }));
    }

    #[test]
    fn one_reversal_per_entry() {
        let storage = InMemoryStorage::new();
        let (org, bank, equity) = seed_org(&storage);
        let date = Date::from_calendar_date(2024, Month::March, 1).unwrap();

        let (entry, lines) = balanced_entry(org, bank, equity, 1, date);
        storage.insert_entry(&entry, &lines).unwrap();

        let (mut reversal, reversal_lines) = balanced_entry(org, bank, equity, 2, date);
        reversal.source_document_id = entry.source_document_id;
        reversal.reverses = Some(entry.id);
        storage.insert_entry(&reversal, &reversal_lines).unwrap();

        let found = storage.reversal_of(org, entry.id).unwrap().unwrap();
        assert_eq!(found.id, reversal.id);

        let (mut second, second_lines) = balanced_entry(org, bank, equity, 3, date);
        second.source_document_id = entry.source_document_id;
        second.reverses = Some(entry.id);
        let err = storage.insert_entry(&second, &second_lines).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateReversal(id) if id == entry.id));
    }

    #[test]
    fn rollback_restores_journal_and_sequence() {
        let storage = InMemoryStorage::new();
        let (org, bank, equity) = seed_org(&storage);
        let date = Date::from_calendar_date(2024, Month::March, 1).unwrap();

        let tx = storage.begin_transaction().unwrap();
        let seq = storage.next_sequence().unwrap();
        let (entry, lines) = balanced_entry(org, bank, equity, seq, date);
        storage.insert_entry(&entry, &lines).unwrap();
        storage.rollback_transaction(tx).unwrap();

        let lines = storage
            .lines_for_account(org, bank, Bound::Unbounded, Bound::Unbounded)
            .unwrap();
        assert!(lines.is_empty());
        assert_eq!(storage.next_sequence().unwrap(), seq);
    }

    #[test]
    fn nested_rollback_keeps_outer_writes() {
        let storage = InMemoryStorage::new();
        let (org, bank, equity) = seed_org(&storage);
        let date = Date::from_calendar_date(2024, Month::March, 1).unwrap();

        let outer = storage.begin_transaction().unwrap();
        let (kept, kept_lines) = balanced_entry(org, bank, equity, 1, date);
        storage.insert_entry(&kept, &kept_lines).unwrap();

        let inner = storage.begin_transaction().unwrap();
        let (dropped, dropped_lines) = balanced_entry(org, bank, equity, 2, date);
        storage.insert_entry(&dropped, &dropped_lines).unwrap();
        storage.rollback_transaction(inner).unwrap();

        storage.commit_transaction(outer).unwrap();

        assert!(storage.entry(org, kept.id).is_ok());
        assert!(matches!(
            storage.entry(org, dropped.id),
            Err(StorageError::EntryNotFound(_))
        ));
    }

    #[test]
    fn rollback_cannot_discard_a_neighbours_commit() {
        let storage = Arc::new(InMemoryStorage::new());
        let (org, bank, equity) = seed_org(&storage);
        let date = Date::from_calendar_date(2024, Month::March, 1).unwrap();

        let tx = storage.begin_transaction().unwrap();
        let (doomed, doomed_lines) = balanced_entry(org, bank, equity, 1, date);
        storage.insert_entry(&doomed, &doomed_lines).unwrap();

        let neighbour = storage.clone();
        let handle = std::thread::spawn(move || {
            // Blocks until the first transaction finishes.
            let tx2 = neighbour.begin_transaction().unwrap();
            let (entry, lines) = balanced_entry(org, bank, equity, 2, date);
            neighbour.insert_entry(&entry, &lines).unwrap();
            neighbour.commit_transaction(tx2).unwrap();
            entry.id
        });

        std::thread::sleep(Duration::from_millis(50));
        storage.rollback_transaction(tx).unwrap();
        let survivor = handle.join().unwrap();

        assert!(storage.entry(org, survivor).is_ok());
        assert!(matches!(
            storage.entry(org, doomed.id),
            Err(StorageError::EntryNotFound(_))
        ));
    }

    #[test]
    fn document_update_requires_matching_version() {
        use tallybook_core::{CounterpartyId, DocumentStatus};
        let storage = InMemoryStorage::new();
        let (org, bank, _) = seed_org(&storage);
        let date = Date::from_calendar_date(2024, Month::March, 1).unwrap();

        let doc = Document {
            id: DocumentId::new(),
            organization_id: org,
            kind: DocumentKind::Invoice,
            counterparty_id: CounterpartyId::new(),
            issue_date: date,
            due_date: date,
            line_items: vec![],
            subtotal: Money::zero(usd()),
            tax_amount: Money::zero(usd()),
            discount_amount: Money::zero(usd()),
            shipping_amount: Money::zero(usd()),
            total: Money::zero(usd()),
            amount_paid: Money::zero(usd()),
            amount_due: Money::zero(usd()),
            status: DocumentStatus::Draft,
            control_account_id: bank,
            version: 0,
        };
        storage.insert_document(&doc).unwrap();

        storage.update_document(&doc, 0).unwrap();
        let err = storage.update_document(&doc, 0).unwrap_err();
        assert!(matches!(err, StorageError::VersionConflict(_)));
        assert_eq!(storage.document(org, doc.id).unwrap().version, 1);
    }
}
