//! Posting and reversing balanced journal entries.

use std::sync::Arc;

use rust_decimal::Decimal;
use time::{Date, OffsetDateTime};

use tallybook_core::{
    EntryId, JournalEntry, JournalLine, LineCommand, OrganizationId, PostEntryCommand, Side,
    StorageBackend, StorageError,
};

use crate::error::LedgerError;

pub struct JournalEngine {
    storage: Arc<dyn StorageBackend>,
}

impl JournalEngine {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Validates and appends one balanced entry. Reposting the same
    /// `(source_document_id, transaction_type)` pair returns the id of the
    /// existing entry instead of creating a second one.
    pub fn post_entry(
        &self,
        organization_id: OrganizationId,
        cmd: PostEntryCommand,
    ) -> Result<EntryId, LedgerError> {
        self.post_inner(organization_id, cmd, false, None)
    }

    /// Posts the debit/credit mirror of an existing entry under the reversal
    /// transaction type. The original entry is never touched; the pair nets
    /// to zero on every account. Reversing the same entry again returns the
    /// id of the existing compensating entry.
    pub fn reverse_entry(
        &self,
        organization_id: OrganizationId,
        entry_id: EntryId,
        transaction_date: Date,
    ) -> Result<EntryId, LedgerError> {
        let (entry, lines) = self.storage.entry(organization_id, entry_id)?;
        if entry.reverses.is_some() {
            return Err(LedgerError::Validation(
                "compensating entries cannot themselves be reversed".into(),
            ));
        }
        let cmd = PostEntryCommand {
            transaction_date,
            transaction_type: entry.transaction_type.reversal(),
            source_document_id: entry.source_document_id,
            lines: lines
                .iter()
                .map(|line| match line.side {
                    Side::Debit => LineCommand::Credit {
                        account_id: line.account_id,
                        amount: line.amount,
                        description: line.description.clone(),
                    },
                    Side::Credit => LineCommand::Debit {
                        account_id: line.account_id,
                        amount: line.amount,
                        description: line.description.clone(),
                    },
                })
                .collect(),
        };
        // Reversals may touch accounts deactivated since the original posting.
        self.post_inner(organization_id, cmd, true, Some(entry_id))
    }

    pub fn entry(
        &self,
        organization_id: OrganizationId,
        entry_id: EntryId,
    ) -> Result<(JournalEntry, Vec<JournalLine>), LedgerError> {
        Ok(self.storage.entry(organization_id, entry_id)?)
    }

    pub fn entries_for_source(
        &self,
        organization_id: OrganizationId,
        source_document_id: tallybook_core::DocumentId,
    ) -> Result<Vec<JournalEntry>, LedgerError> {
        Ok(self
            .storage
            .entries_for_source(organization_id, source_document_id)?)
    }

    fn post_inner(
        &self,
        organization_id: OrganizationId,
        cmd: PostEntryCommand,
        allow_inactive: bool,
        reverses: Option<EntryId>,
    ) -> Result<EntryId, LedgerError> {
        let organization = self.storage.organization(organization_id)?;

        if cmd.lines.is_empty() {
            return Err(LedgerError::EmptyEntry);
        }

        let mut debits = Decimal::ZERO;
        let mut credits = Decimal::ZERO;
        for line in &cmd.lines {
            let amount = line.amount();
            if amount.currency() != organization.currency {
                return Err(LedgerError::Validation(format!(
                    "line currency {} differs from organization currency {}",
                    amount.currency(),
                    organization.currency
                )));
            }
            if !amount.is_positive() {
                return Err(LedgerError::Validation(
                    "line amounts must be positive".into(),
                ));
            }
            let account = self
                .storage
                .account(organization_id, line.account_id())
                .map_err(|e| match e {
                    StorageError::AccountNotFound(id) => LedgerError::ForeignAccount(id),
                    other => LedgerError::Storage(other),
                })?;
            if !account.is_active && !allow_inactive {
                return Err(LedgerError::Validation(format!(
                    "account {} is inactive",
                    account.name
                )));
            }
            match line.side() {
                Side::Debit => debits += amount.amount(),
                Side::Credit => credits += amount.amount(),
            }
        }
        if debits != credits {
            return Err(LedgerError::UnbalancedEntry { debits, credits });
        }

        if let Some(existing) = self.lookup_existing(organization_id, &cmd, reverses)? {
            tracing::debug!(
                entry_id = %existing,
                source = %cmd.source_document_id,
                transaction_type = %cmd.transaction_type,
                "duplicate posting request, returning existing entry"
            );
            return Ok(existing);
        }

        let tx = self.storage.begin_transaction()?;
        let result = self.append(organization_id, &cmd, reverses);
        match result {
            Ok(entry_id) => {
                self.storage.commit_transaction(tx)?;
                tracing::debug!(
                    entry_id = %entry_id,
                    transaction_type = %cmd.transaction_type,
                    "journal entry posted"
                );
                Ok(entry_id)
            }
            // Lost the idempotency race inside the transaction; the winner's
            // entry is the answer.
            Err(LedgerError::Storage(
                StorageError::DuplicateEntry { .. } | StorageError::DuplicateReversal(_),
            )) => {
                self.storage.rollback_transaction(tx)?;
                let existing = self
                    .lookup_existing(organization_id, &cmd, reverses)?
                    .ok_or_else(|| {
                        StorageError::Other("duplicate entry vanished during retry".into())
                    })?;
                Ok(existing)
            }
            Err(e) => {
                self.storage.rollback_transaction(tx)?;
                Err(e)
            }
        }
    }

    /// Idempotency lookup. Regular postings key on the source document and
    /// transaction type; reversals key on the entry they compensate.
    fn lookup_existing(
        &self,
        organization_id: OrganizationId,
        cmd: &PostEntryCommand,
        reverses: Option<EntryId>,
    ) -> Result<Option<EntryId>, LedgerError> {
        let existing = match reverses {
            Some(target) => self.storage.reversal_of(organization_id, target)?,
            None => self.storage.entry_for_source(
                organization_id,
                cmd.source_document_id,
                cmd.transaction_type,
            )?,
        };
        Ok(existing.map(|entry| entry.id))
    }

    fn append(
        &self,
        organization_id: OrganizationId,
        cmd: &PostEntryCommand,
        reverses: Option<EntryId>,
    ) -> Result<EntryId, LedgerError> {
        let sequence = self.storage.next_sequence()?;
        let entry = JournalEntry {
            id: EntryId::new(),
            organization_id,
            sequence,
            transaction_date: cmd.transaction_date,
            transaction_type: cmd.transaction_type,
            source_document_id: cmd.source_document_id,
            reverses,
            created_at: OffsetDateTime::now_utc(),
        };
        let lines: Vec<JournalLine> = cmd
            .lines
            .iter()
            .map(|line| JournalLine {
                entry_id: entry.id,
                account_id: line.account_id(),
                side: line.side(),
                amount: line.amount(),
                description: line.description(),
            })
            .collect();
        self.storage.insert_entry(&entry, &lines)?;
        Ok(entry.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tallybook_core::{
        AccountId, Currency, DocumentId, Money, SystemRole, TransactionType,
    };
    use tallybook_memory::InMemoryStorage;
    use time::Month;

    use crate::chart::AccountDirectory;

    struct Fixture {
        engine: JournalEngine,
        storage: Arc<InMemoryStorage>,
        org: OrganizationId,
        cash: AccountId,
        income: AccountId,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryStorage::new());
        let directory = AccountDirectory::new(storage.clone());
        let org = directory
            .create_organization("Test Co", Currency::from_code("USD").unwrap())
            .unwrap();
        directory.seed_chart(org.id).unwrap();
        let cash = directory
            .resolve_system_account(org.id, SystemRole::Cash)
            .unwrap();
        let income = directory
            .resolve_system_account(org.id, SystemRole::SalesIncome)
            .unwrap();
        Fixture {
            engine: JournalEngine::new(storage.clone()),
            storage,
            org: org.id,
            cash: cash.id,
            income: income.id,
        }
    }

    fn usd(amount: Decimal) -> Money {
        Money::new(amount, Currency::from_code("USD").unwrap())
    }

    fn jan(day: u8) -> Date {
        Date::from_calendar_date(2024, Month::January, day).unwrap()
    }

    fn simple_cmd(f: &Fixture, amount: Decimal) -> PostEntryCommand {
        PostEntryCommand {
            transaction_date: jan(15),
            transaction_type: TransactionType::Adjustment,
            source_document_id: DocumentId::new(),
            lines: vec![
                LineCommand::Debit {
                    account_id: f.cash,
                    amount: usd(amount),
                    description: Arc::from("cash in"),
                },
                LineCommand::Credit {
                    account_id: f.income,
                    amount: usd(amount),
                    description: Arc::from("sale"),
                },
            ],
        }
    }

    #[test]
    fn balanced_entry_posts() {
        let f = fixture();
        let entry_id = f.engine.post_entry(f.org, simple_cmd(&f, dec!(100))).unwrap();
        let (entry, lines) = f.engine.entry(f.org, entry_id).unwrap();
        assert_eq!(entry.sequence, 1);
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn empty_entry_is_rejected() {
        let f = fixture();
        let cmd = PostEntryCommand {
            transaction_date: jan(15),
            transaction_type: TransactionType::Adjustment,
            source_document_id: DocumentId::new(),
            lines: vec![],
        };
        assert!(matches!(
            f.engine.post_entry(f.org, cmd),
            Err(LedgerError::EmptyEntry)
        ));
    }

    #[test]
    fn unbalanced_entry_is_rejected_exactly() {
        let f = fixture();
        let mut cmd = simple_cmd(&f, dec!(100));
        // One cent off is still off.
        cmd.lines[1] = LineCommand::Credit {
            account_id: f.income,
            amount: usd(dec!(99.99)),
            description: Arc::from("sale"),
        };
        let err = f.engine.post_entry(f.org, cmd).unwrap_err();
        match err {
            LedgerError::UnbalancedEntry { debits, credits } => {
                assert_eq!(debits, dec!(100));
                assert_eq!(credits, dec!(99.99));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_and_negative_amounts_are_rejected() {
        let f = fixture();
        let mut cmd = simple_cmd(&f, dec!(100));
        cmd.lines[0] = LineCommand::Debit {
            account_id: f.cash,
            amount: usd(dec!(0)),
            description: Arc::from("nothing"),
        };
        assert!(matches!(
            f.engine.post_entry(f.org, cmd),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn foreign_account_is_rejected() {
        let f = fixture();
        let mut cmd = simple_cmd(&f, dec!(100));
        cmd.lines[0] = LineCommand::Debit {
            account_id: AccountId::new(),
            amount: usd(dec!(100)),
            description: Arc::from("nowhere"),
        };
        assert!(matches!(
            f.engine.post_entry(f.org, cmd),
            Err(LedgerError::ForeignAccount(_))
        ));
    }

    #[test]
    fn wrong_currency_is_rejected() {
        let f = fixture();
        let eur = Currency::from_code("EUR").unwrap();
        let mut cmd = simple_cmd(&f, dec!(100));
        cmd.lines[0] = LineCommand::Debit {
            account_id: f.cash,
            amount: Money::new(dec!(100), eur),
            description: Arc::from("euros"),
        };
        assert!(matches!(
            f.engine.post_entry(f.org, cmd),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn repost_of_same_source_returns_existing_entry() {
        let f = fixture();
        let cmd = simple_cmd(&f, dec!(100));
        let first = f.engine.post_entry(f.org, cmd.clone()).unwrap();
        let second = f.engine.post_entry(f.org, cmd.clone()).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            f.engine
                .entries_for_source(f.org, cmd.source_document_id)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn reversal_mirrors_lines_and_nets_to_zero() {
        let f = fixture();
        let cmd = simple_cmd(&f, dec!(250));
        let entry_id = f.engine.post_entry(f.org, cmd).unwrap();
        let reversal_id = f.engine.reverse_entry(f.org, entry_id, jan(20)).unwrap();
        assert_ne!(entry_id, reversal_id);

        let (reversal, lines) = f.engine.entry(f.org, reversal_id).unwrap();
        assert_eq!(reversal.transaction_type, TransactionType::Adjustment);
        assert_eq!(lines[0].side, Side::Credit);
        assert_eq!(lines[1].side, Side::Debit);

        use std::ops::Bound;
        let cash_lines = f
            .storage
            .lines_for_account(f.org, f.cash, Bound::Unbounded, Bound::Unbounded)
            .unwrap();
        let net: Decimal = cash_lines
            .iter()
            .map(|l| l.debit().amount() - l.credit().amount())
            .sum();
        assert_eq!(net, Decimal::ZERO);
    }

    #[test]
    fn reversing_twice_returns_same_compensating_entry() {
        let f = fixture();
        // Adjustment entries reverse into Adjustment entries, which is
        // exactly where a source-keyed lookup would hand back the original.
        let entry_id = f.engine.post_entry(f.org, simple_cmd(&f, dec!(75))).unwrap();
        let first = f.engine.reverse_entry(f.org, entry_id, jan(20)).unwrap();
        let second = f.engine.reverse_entry(f.org, entry_id, jan(21)).unwrap();
        assert_ne!(first, entry_id);
        assert_eq!(first, second);

        let (reversal, _) = f.engine.entry(f.org, first).unwrap();
        assert_eq!(reversal.reverses, Some(entry_id));
    }

    #[test]
    fn reversal_of_a_reversal_is_rejected() {
        let f = fixture();
        let entry_id = f.engine.post_entry(f.org, simple_cmd(&f, dec!(40))).unwrap();
        let reversal_id = f.engine.reverse_entry(f.org, entry_id, jan(20)).unwrap();
        assert!(matches!(
            f.engine.reverse_entry(f.org, reversal_id, jan(21)),
            Err(LedgerError::Validation(_))
        ));
    }
}
