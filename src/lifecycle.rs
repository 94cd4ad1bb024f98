//! Invoice, bill and payment lifecycle. Every financial effect flows through
//! the journal engine; document headers only summarize what was posted.

use std::sync::Arc;

use time::Date;

use tallybook_core::{
    settled_status, Account, Currency, Document, DocumentId, DocumentKind, DocumentStatus,
    DraftDocumentCommand, LineCommand, Money, OrganizationId, Payment, PaymentKind,
    PostEntryCommand, RecordPaymentCommand, Side, StorageBackend, StorageError, SystemRole,
};

use crate::error::LedgerError;
use crate::journal::JournalEngine;

/// Re-read attempts before a header update gives up with `Conflict`.
const VERSION_RETRIES: usize = 3;

pub struct DocumentLifecycle {
    storage: Arc<dyn StorageBackend>,
    journal: JournalEngine,
}

impl DocumentLifecycle {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            journal: JournalEngine::new(storage.clone()),
            storage,
        }
    }

    /// Creates a draft header. Drafts have no journal presence; nothing posts
    /// until `issue`.
    pub fn draft_document(
        &self,
        organization_id: OrganizationId,
        cmd: DraftDocumentCommand,
    ) -> Result<Document, LedgerError> {
        let organization = self.storage.organization(organization_id)?;
        let currency = organization.currency;

        if cmd.line_items.is_empty() {
            return Err(LedgerError::Validation(
                "document must have at least one line item".into(),
            ));
        }
        if cmd.due_date < cmd.issue_date {
            return Err(LedgerError::Validation(
                "due date precedes issue date".into(),
            ));
        }
        for extra in [&cmd.tax_amount, &cmd.discount_amount, &cmd.shipping_amount] {
            if extra.currency() != currency {
                return Err(LedgerError::Validation(format!(
                    "amount currency {} differs from organization currency {}",
                    extra.currency(),
                    currency
                )));
            }
            if extra.is_negative() {
                return Err(LedgerError::Validation(
                    "tax, discount and shipping must not be negative".into(),
                ));
            }
        }

        let mut subtotal = Money::zero(currency);
        for item in &cmd.line_items {
            if !item.quantity.is_sign_positive() || item.quantity.is_zero() {
                return Err(LedgerError::Validation(
                    "line item quantity must be positive".into(),
                ));
            }
            if item.unit_price.currency() != currency {
                return Err(LedgerError::Validation(format!(
                    "line item currency {} differs from organization currency {}",
                    item.unit_price.currency(),
                    currency
                )));
            }
            if !item.unit_price.is_positive() {
                return Err(LedgerError::Validation(
                    "line item unit price must be positive".into(),
                ));
            }
            if let Some(account_id) = item.account_id {
                // The account must exist here; posting validity is re-checked
                // at issue time.
                self.storage
                    .account(organization_id, account_id)
                    .map_err(|_| LedgerError::ForeignAccount(account_id))?;
            }
            subtotal = subtotal.checked_add(&item.amount()?)?;
        }

        let total = subtotal
            .checked_add(&cmd.tax_amount)?
            .checked_add(&cmd.shipping_amount)?
            .checked_sub(&cmd.discount_amount)?;
        if total.is_negative() {
            return Err(LedgerError::Validation(
                "discount exceeds the document total".into(),
            ));
        }

        let control_account = match cmd.control_account_id {
            Some(account_id) => {
                let account = self
                    .storage
                    .account(organization_id, account_id)
                    .map_err(|_| LedgerError::ForeignAccount(account_id))?;
                let expected = cmd.kind.control_role().account_type();
                if account.account_type != expected {
                    return Err(LedgerError::Validation(format!(
                        "control account must be of type {:?}",
                        expected
                    )));
                }
                account
            }
            None => self.system_account(organization_id, cmd.kind.control_role())?,
        };

        let document = Document {
            id: DocumentId::new(),
            organization_id,
            kind: cmd.kind,
            counterparty_id: cmd.counterparty_id,
            issue_date: cmd.issue_date,
            due_date: cmd.due_date,
            line_items: cmd.line_items,
            subtotal,
            tax_amount: cmd.tax_amount,
            discount_amount: cmd.discount_amount,
            shipping_amount: cmd.shipping_amount,
            total,
            amount_paid: Money::zero(currency),
            amount_due: Money::zero(currency),
            status: DocumentStatus::Draft,
            control_account_id: control_account.id,
            version: 0,
        };
        self.storage.insert_document(&document)?;
        tracing::debug!(document_id = %document.id, kind = ?document.kind, "document drafted");
        Ok(document)
    }

    /// Draft → Sent. Posts the issue entry and opens the balance due.
    pub fn issue(
        &self,
        organization_id: OrganizationId,
        document_id: DocumentId,
    ) -> Result<Document, LedgerError> {
        let document = self.storage.document(organization_id, document_id)?;
        if !document.status.can_become(DocumentStatus::Sent) {
            return Err(LedgerError::InvalidTransition {
                from: document.status,
                to: DocumentStatus::Sent,
            });
        }

        let cmd = self.issue_posting(&document)?;
        self.journal.post_entry(organization_id, cmd)?;

        self.update_header(organization_id, document_id, |doc| {
            doc.status = DocumentStatus::Sent;
            doc.amount_due = doc.total;
            Ok(())
        })
    }

    /// Sent → Viewed. A bookkeeping-free transition; nothing posts.
    pub fn mark_viewed(
        &self,
        organization_id: OrganizationId,
        document_id: DocumentId,
    ) -> Result<Document, LedgerError> {
        self.update_header(organization_id, document_id, |doc| {
            if !doc.status.can_become(DocumentStatus::Viewed) {
                return Err(LedgerError::InvalidTransition {
                    from: doc.status,
                    to: DocumentStatus::Viewed,
                });
            }
            doc.status = DocumentStatus::Viewed;
            Ok(())
        })
    }

    /// Records a payment split across open documents and posts one entry for
    /// the whole payment. Allocations must cover the payment amount exactly.
    /// Everything lands in one storage transaction; a retry carrying the same
    /// `payment_id` returns the recorded payment instead of posting again.
    pub fn apply_payment(
        &self,
        organization_id: OrganizationId,
        cmd: RecordPaymentCommand,
    ) -> Result<Payment, LedgerError> {
        let organization = self.storage.organization(organization_id)?;
        let currency = organization.currency;

        if cmd.amount.currency() != currency {
            return Err(LedgerError::Validation(format!(
                "payment currency {} differs from organization currency {}",
                cmd.amount.currency(),
                currency
            )));
        }
        if !cmd.amount.is_positive() {
            return Err(LedgerError::Validation(
                "payment amount must be positive".into(),
            ));
        }
        if cmd.applications.is_empty() {
            return Err(LedgerError::Validation(
                "payment must be applied to at least one document".into(),
            ));
        }

        let payment_id = cmd.payment_id.unwrap_or_else(DocumentId::new);
        match self.storage.payment(organization_id, payment_id) {
            Ok(existing) => {
                tracing::debug!(
                    payment_id = %payment_id,
                    "duplicate payment request, returning recorded payment"
                );
                return Ok(existing);
            }
            Err(StorageError::PaymentNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let tx = self.storage.begin_transaction()?;
        match self.record_payment(organization_id, payment_id, cmd, currency) {
            Ok(payment) => {
                self.storage.commit_transaction(tx)?;
                tracing::debug!(
                    payment_id = %payment.id,
                    amount = %payment.amount,
                    "payment recorded"
                );
                Ok(payment)
            }
            Err(e) => {
                self.storage.rollback_transaction(tx)?;
                Err(e)
            }
        }
    }

    /// The transactional body of `apply_payment`: validates allocations,
    /// posts the journal entry and settles each target header.
    fn record_payment(
        &self,
        organization_id: OrganizationId,
        payment_id: DocumentId,
        cmd: RecordPaymentCommand,
        currency: Currency,
    ) -> Result<Payment, LedgerError> {
        let cash = self.system_account(organization_id, SystemRole::Cash)?;
        let (cash_side, control_side) = match cmd.kind {
            PaymentKind::Customer => (Side::Debit, Side::Credit),
            PaymentKind::Vendor => (Side::Credit, Side::Debit),
        };

        let mut lines = vec![line(
            cash_side,
            cash.id,
            cmd.amount,
            format!("Payment {}", payment_id),
        )];
        let mut allocated = Money::zero(currency);
        // One slot per distinct document; allocations to the same document
        // are summed so the aggregate is what gets checked against the
        // balance due.
        let mut shares: Vec<(Document, Money)> = Vec::with_capacity(cmd.applications.len());
        for application in &cmd.applications {
            if !application.amount.is_positive() {
                return Err(LedgerError::Validation(
                    "payment applications must be positive".into(),
                ));
            }
            allocated = allocated.checked_add(&application.amount)?;
            if allocated > cmd.amount {
                return Err(LedgerError::Overpayment(application.document_id));
            }
            let control_account_id = match shares
                .iter_mut()
                .find(|(doc, _)| doc.id == application.document_id)
            {
                Some((document, share)) => {
                    *share = share.checked_add(&application.amount)?;
                    if *share > document.amount_due {
                        return Err(LedgerError::Overpayment(document.id));
                    }
                    document.control_account_id
                }
                None => {
                    let document = self
                        .storage
                        .document(organization_id, application.document_id)?;
                    if document.kind != cmd.kind.target_kind() {
                        return Err(LedgerError::Validation(format!(
                            "a {:?} payment cannot settle a {:?}",
                            cmd.kind, document.kind
                        )));
                    }
                    if !document.status.is_open() {
                        return Err(LedgerError::InvalidTransition {
                            from: document.status,
                            to: DocumentStatus::Partial,
                        });
                    }
                    if application.amount > document.amount_due {
                        return Err(LedgerError::Overpayment(document.id));
                    }
                    let control_account_id = document.control_account_id;
                    shares.push((document, application.amount));
                    control_account_id
                }
            };
            lines.push(line(
                control_side,
                control_account_id,
                application.amount,
                format!("Payment applied to document {}", application.document_id),
            ));
        }
        if allocated < cmd.amount {
            return Err(LedgerError::Validation(
                "payment applications fall short of the payment amount".into(),
            ));
        }

        let payment = Payment {
            id: payment_id,
            organization_id,
            kind: cmd.kind,
            counterparty_id: cmd.counterparty_id,
            payment_date: cmd.payment_date,
            amount: cmd.amount,
            method: cmd.method,
            applications: cmd.applications,
        };

        self.journal.post_entry(
            organization_id,
            PostEntryCommand {
                transaction_date: payment.payment_date,
                transaction_type: payment.kind.transaction_type(),
                source_document_id: payment.id,
                lines,
            },
        )?;
        self.storage.insert_payment(&payment)?;

        for (document, applied) in shares {
            self.update_header(organization_id, document.id, move |doc| {
                // Re-checked against the freshly read header so a concurrent
                // settlement cannot push the document negative.
                if !doc.status.is_open() {
                    return Err(LedgerError::InvalidTransition {
                        from: doc.status,
                        to: DocumentStatus::Partial,
                    });
                }
                doc.amount_paid = doc.amount_paid.checked_add(&applied)?;
                if doc.amount_paid > doc.total {
                    return Err(LedgerError::Overpayment(doc.id));
                }
                doc.amount_due = doc.total.checked_sub(&doc.amount_paid)?;
                doc.status = settled_status(doc.status, doc.amount_paid, doc.total);
                Ok(())
            })?;
        }

        Ok(payment)
    }

    /// Voids a document from any non-voided state by posting compensating
    /// entries for everything the document itself originated. Payment entries
    /// belong to their payments and are left untouched.
    pub fn void(
        &self,
        organization_id: OrganizationId,
        document_id: DocumentId,
        void_date: Date,
    ) -> Result<Document, LedgerError> {
        let document = self.storage.document(organization_id, document_id)?;
        if !document.status.can_become(DocumentStatus::Voided) {
            return Err(LedgerError::InvalidTransition {
                from: document.status,
                to: DocumentStatus::Voided,
            });
        }

        let entries = self
            .storage
            .entries_for_source(organization_id, document_id)?;
        for entry in entries {
            // Never reverse a reversal.
            if entry.reverses.is_some() {
                continue;
            }
            self.journal
                .reverse_entry(organization_id, entry.id, void_date)?;
        }

        self.update_header(organization_id, document_id, |doc| {
            doc.amount_due = Money::zero(doc.total.currency());
            doc.status = DocumentStatus::Voided;
            Ok(())
        })
    }

    pub fn document(
        &self,
        organization_id: OrganizationId,
        document_id: DocumentId,
    ) -> Result<Document, LedgerError> {
        Ok(self.storage.document(organization_id, document_id)?)
    }

    pub fn payment(
        &self,
        organization_id: OrganizationId,
        payment_id: DocumentId,
    ) -> Result<Payment, LedgerError> {
        Ok(self.storage.payment(organization_id, payment_id)?)
    }

    pub fn list_documents(
        &self,
        organization_id: OrganizationId,
        kind: DocumentKind,
    ) -> Result<Vec<Document>, LedgerError> {
        Ok(self.storage.list_documents(organization_id, kind)?)
    }

    /// Open documents past their due date as of `today`. Overdue is derived
    /// here and never written back.
    pub fn overdue_documents(
        &self,
        organization_id: OrganizationId,
        kind: DocumentKind,
        today: Date,
    ) -> Result<Vec<Document>, LedgerError> {
        Ok(self
            .storage
            .list_documents(organization_id, kind)?
            .into_iter()
            .filter(|doc| doc.is_overdue(today))
            .collect())
    }

    /// Builds the balanced issue posting: the control account carries the
    /// total on the document's natural side, the detail accounts carry the
    /// pieces on the other side.
    fn issue_posting(&self, document: &Document) -> Result<PostEntryCommand, LedgerError> {
        let kind = document.kind;
        let (control_side, detail_side) = match kind {
            DocumentKind::Invoice => (Side::Debit, Side::Credit),
            DocumentKind::Bill => (Side::Credit, Side::Debit),
        };
        let detail_role = self.system_account(document.organization_id, kind.detail_role())?;

        let mut lines = vec![line(
            control_side,
            document.control_account_id,
            document.total,
            format!("Document {}", document.id),
        )];
        for item in &document.line_items {
            let account_id = item.account_id.unwrap_or(detail_role.id);
            lines.push(line(
                detail_side,
                account_id,
                item.amount()?,
                item.description.to_string(),
            ));
        }
        if document.shipping_amount.is_positive() {
            lines.push(line(
                detail_side,
                detail_role.id,
                document.shipping_amount,
                "Shipping".to_string(),
            ));
        }
        if document.discount_amount.is_positive() {
            lines.push(line(
                detail_side.opposite(),
                detail_role.id,
                document.discount_amount,
                "Discount".to_string(),
            ));
        }
        if document.tax_amount.is_positive() {
            let tax = self.system_account(document.organization_id, SystemRole::TaxPayable)?;
            lines.push(line(
                detail_side,
                tax.id,
                document.tax_amount,
                "Tax".to_string(),
            ));
        }

        Ok(PostEntryCommand {
            transaction_date: document.issue_date,
            transaction_type: kind.issue_type(),
            source_document_id: document.id,
            lines,
        })
    }

    fn system_account(
        &self,
        organization_id: OrganizationId,
        role: SystemRole,
    ) -> Result<Account, LedgerError> {
        self.storage
            .system_account(organization_id, role)?
            .ok_or_else(|| {
                LedgerError::Validation(format!(
                    "organization has no {} account",
                    role.default_name()
                ))
            })
    }

    /// Loads, mutates and stores a header under the optimistic version check,
    /// re-reading on conflict a bounded number of times.
    fn update_header<F>(
        &self,
        organization_id: OrganizationId,
        document_id: DocumentId,
        mutate: F,
    ) -> Result<Document, LedgerError>
    where
        F: Fn(&mut Document) -> Result<(), LedgerError>,
    {
        for _ in 0..VERSION_RETRIES {
            let mut document = self.storage.document(organization_id, document_id)?;
            let expected = document.version;
            mutate(&mut document)?;
            match self.storage.update_document(&document, expected) {
                Ok(()) => {
                    document.version = expected + 1;
                    return Ok(document);
                }
                Err(StorageError::VersionConflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(LedgerError::Conflict(document_id))
    }
}

fn line(side: Side, account_id: tallybook_core::AccountId, amount: Money, memo: String) -> LineCommand {
    match side {
        Side::Debit => LineCommand::Debit {
            account_id,
            amount,
            description: Arc::from(memo.as_str()),
        },
        Side::Credit => LineCommand::Credit {
            account_id,
            amount,
            description: Arc::from(memo.as_str()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::ops::Bound;
    use tallybook_core::{
        AccountId, CounterpartyId, Currency, LineItem, PaymentApplication, PaymentKind,
        PaymentMethod,
    };
    use tallybook_memory::InMemoryStorage;
    use time::Month;

    use crate::chart::AccountDirectory;

    fn usd(amount: Decimal) -> Money {
        Money::new(amount, Currency::from_code("USD").unwrap())
    }

    fn jan(day: u8) -> Date {
        Date::from_calendar_date(2024, Month::January, day).unwrap()
    }

    struct Fixture {
        lifecycle: DocumentLifecycle,
        storage: Arc<InMemoryStorage>,
        directory: AccountDirectory,
        org: OrganizationId,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryStorage::new());
        let directory = AccountDirectory::new(storage.clone());
        let org = directory
            .create_organization("Test Co", Currency::from_code("USD").unwrap())
            .unwrap();
        directory.seed_chart(org.id).unwrap();
        Fixture {
            lifecycle: DocumentLifecycle::new(storage.clone()),
            storage,
            directory,
            org: org.id,
        }
    }

    fn invoice_cmd(amount: Decimal, tax: Decimal) -> DraftDocumentCommand {
        DraftDocumentCommand {
            kind: DocumentKind::Invoice,
            counterparty_id: CounterpartyId::new(),
            issue_date: jan(5),
            due_date: jan(31),
            line_items: vec![LineItem {
                description: Arc::from("Consulting services"),
                quantity: dec!(1),
                unit_price: usd(amount),
                account_id: None,
            }],
            tax_amount: usd(tax),
            discount_amount: usd(dec!(0)),
            shipping_amount: usd(dec!(0)),
            control_account_id: None,
        }
    }

    fn pay(
        f: &Fixture,
        document_id: DocumentId,
        amount: Decimal,
        day: u8,
    ) -> Result<Payment, LedgerError> {
        f.lifecycle.apply_payment(
            f.org,
            RecordPaymentCommand {
                payment_id: None,
                kind: PaymentKind::Customer,
                counterparty_id: CounterpartyId::new(),
                payment_date: jan(day),
                amount: usd(amount),
                method: PaymentMethod::BankTransfer,
                applications: vec![PaymentApplication {
                    document_id,
                    amount: usd(amount),
                }],
            },
        )
    }

    fn account_net(f: &Fixture, account_id: AccountId) -> Decimal {
        f.storage
            .lines_for_account(f.org, account_id, Bound::Unbounded, Bound::Unbounded)
            .unwrap()
            .iter()
            .map(|l| l.debit().amount() - l.credit().amount())
            .sum()
    }

    #[test]
    fn issue_posts_receivable_income_and_tax() {
        let f = fixture();
        let draft = f
            .lifecycle
            .draft_document(f.org, invoice_cmd(dec!(5000), dec!(400)))
            .unwrap();
        assert_eq!(draft.total, usd(dec!(5400)));
        assert_eq!(draft.status, DocumentStatus::Draft);

        let issued = f.lifecycle.issue(f.org, draft.id).unwrap();
        assert_eq!(issued.status, DocumentStatus::Sent);
        assert_eq!(issued.amount_due, usd(dec!(5400)));

        let ar = f
            .directory
            .resolve_system_account(f.org, SystemRole::AccountsReceivable)
            .unwrap();
        let income = f
            .directory
            .resolve_system_account(f.org, SystemRole::SalesIncome)
            .unwrap();
        let tax = f
            .directory
            .resolve_system_account(f.org, SystemRole::TaxPayable)
            .unwrap();
        assert_eq!(account_net(&f, ar.id), dec!(5400));
        assert_eq!(account_net(&f, income.id), dec!(-5000));
        assert_eq!(account_net(&f, tax.id), dec!(-400));
    }

    #[test]
    fn issue_is_draft_only() {
        let f = fixture();
        let draft = f
            .lifecycle
            .draft_document(f.org, invoice_cmd(dec!(100), dec!(0)))
            .unwrap();
        f.lifecycle.issue(f.org, draft.id).unwrap();
        let err = f.lifecycle.issue(f.org, draft.id).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidTransition {
                from: DocumentStatus::Sent,
                ..
            }
        ));
    }

    #[test]
    fn partial_then_full_payment_settles_the_document() {
        let f = fixture();
        let draft = f
            .lifecycle
            .draft_document(f.org, invoice_cmd(dec!(1000), dec!(0)))
            .unwrap();
        f.lifecycle.issue(f.org, draft.id).unwrap();

        pay(&f, draft.id, dec!(400), 10).unwrap();
        let partial = f.lifecycle.document(f.org, draft.id).unwrap();
        assert_eq!(partial.status, DocumentStatus::Partial);
        assert_eq!(partial.amount_paid, usd(dec!(400)));
        assert_eq!(partial.amount_due, usd(dec!(600)));

        pay(&f, draft.id, dec!(600), 15).unwrap();
        let paid = f.lifecycle.document(f.org, draft.id).unwrap();
        assert_eq!(paid.status, DocumentStatus::Paid);
        assert_eq!(paid.amount_due, usd(dec!(0)));
    }

    #[test]
    fn overpayment_is_rejected_before_anything_posts() {
        let f = fixture();
        let draft = f
            .lifecycle
            .draft_document(f.org, invoice_cmd(dec!(100), dec!(0)))
            .unwrap();
        f.lifecycle.issue(f.org, draft.id).unwrap();

        let err = pay(&f, draft.id, dec!(150), 10).unwrap_err();
        assert!(matches!(err, LedgerError::Overpayment(id) if id == draft.id));

        let unchanged = f.lifecycle.document(f.org, draft.id).unwrap();
        assert_eq!(unchanged.amount_paid, usd(dec!(0)));
    }

    #[test]
    fn one_payment_settles_several_invoices_in_one_entry() {
        let f = fixture();
        let a = f
            .lifecycle
            .draft_document(f.org, invoice_cmd(dec!(300), dec!(0)))
            .unwrap();
        let b = f
            .lifecycle
            .draft_document(f.org, invoice_cmd(dec!(200), dec!(0)))
            .unwrap();
        f.lifecycle.issue(f.org, a.id).unwrap();
        f.lifecycle.issue(f.org, b.id).unwrap();

        let payment = f
            .lifecycle
            .apply_payment(
                f.org,
                RecordPaymentCommand {
                    payment_id: None,
                    kind: PaymentKind::Customer,
                    counterparty_id: CounterpartyId::new(),
                    payment_date: jan(12),
                    amount: usd(dec!(500)),
                    method: PaymentMethod::Check,
                    applications: vec![
                        PaymentApplication {
                            document_id: a.id,
                            amount: usd(dec!(300)),
                        },
                        PaymentApplication {
                            document_id: b.id,
                            amount: usd(dec!(200)),
                        },
                    ],
                },
            )
            .unwrap();

        let entries = f
            .storage
            .entries_for_source(f.org, payment.id)
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            f.lifecycle.document(f.org, a.id).unwrap().status,
            DocumentStatus::Paid
        );
        assert_eq!(
            f.lifecycle.document(f.org, b.id).unwrap().status,
            DocumentStatus::Paid
        );
    }

    #[test]
    fn allocations_must_cover_the_payment_exactly() {
        let f = fixture();
        let draft = f
            .lifecycle
            .draft_document(f.org, invoice_cmd(dec!(1000), dec!(0)))
            .unwrap();
        f.lifecycle.issue(f.org, draft.id).unwrap();

        let err = f
            .lifecycle
            .apply_payment(
                f.org,
                RecordPaymentCommand {
                    payment_id: None,
                    kind: PaymentKind::Customer,
                    counterparty_id: CounterpartyId::new(),
                    payment_date: jan(10),
                    amount: usd(dec!(500)),
                    method: PaymentMethod::Cash,
                    applications: vec![PaymentApplication {
                        document_id: draft.id,
                        amount: usd(dec!(300)),
                    }],
                },
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn payments_cannot_target_drafts_or_paid_documents() {
        let f = fixture();
        let draft = f
            .lifecycle
            .draft_document(f.org, invoice_cmd(dec!(100), dec!(0)))
            .unwrap();
        let err = pay(&f, draft.id, dec!(100), 10).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        f.lifecycle.issue(f.org, draft.id).unwrap();
        pay(&f, draft.id, dec!(100), 10).unwrap();
        let err = pay(&f, draft.id, dec!(1), 12).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[test]
    fn void_reverses_the_issue_entry() {
        let f = fixture();
        let draft = f
            .lifecycle
            .draft_document(f.org, invoice_cmd(dec!(5000), dec!(400)))
            .unwrap();
        f.lifecycle.issue(f.org, draft.id).unwrap();

        let voided = f.lifecycle.void(f.org, draft.id, jan(20)).unwrap();
        assert_eq!(voided.status, DocumentStatus::Voided);
        assert_eq!(voided.amount_due, usd(dec!(0)));

        let ar = f
            .directory
            .resolve_system_account(f.org, SystemRole::AccountsReceivable)
            .unwrap();
        assert_eq!(account_net(&f, ar.id), Decimal::ZERO);

        // Voiding twice is an invalid transition, not a second reversal.
        let err = f.lifecycle.void(f.org, draft.id, jan(21)).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
        let entries = f.storage.entries_for_source(f.org, draft.id).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn voiding_a_draft_posts_nothing() {
        let f = fixture();
        let draft = f
            .lifecycle
            .draft_document(f.org, invoice_cmd(dec!(100), dec!(0)))
            .unwrap();
        let voided = f.lifecycle.void(f.org, draft.id, jan(6)).unwrap();
        assert_eq!(voided.status, DocumentStatus::Voided);
        assert!(f
            .storage
            .entries_for_source(f.org, draft.id)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn bill_issue_mirrors_the_invoice_posting() {
        let f = fixture();
        let draft = f
            .lifecycle
            .draft_document(
                f.org,
                DraftDocumentCommand {
                    kind: DocumentKind::Bill,
                    counterparty_id: CounterpartyId::new(),
                    issue_date: jan(5),
                    due_date: jan(31),
                    line_items: vec![LineItem {
                        description: Arc::from("Office rent"),
                        quantity: dec!(1),
                        unit_price: usd(dec!(2000)),
                        account_id: None,
                    }],
                    tax_amount: usd(dec!(0)),
                    discount_amount: usd(dec!(0)),
                    shipping_amount: usd(dec!(0)),
                    control_account_id: None,
                },
            )
            .unwrap();
        f.lifecycle.issue(f.org, draft.id).unwrap();

        let ap = f
            .directory
            .resolve_system_account(f.org, SystemRole::AccountsPayable)
            .unwrap();
        let expense = f
            .directory
            .resolve_system_account(f.org, SystemRole::OperatingExpense)
            .unwrap();
        assert_eq!(account_net(&f, ap.id), dec!(-2000));
        assert_eq!(account_net(&f, expense.id), dec!(2000));
    }

    #[test]
    fn overdue_is_derived_at_query_time() {
        let f = fixture();
        let draft = f
            .lifecycle
            .draft_document(f.org, invoice_cmd(dec!(100), dec!(0)))
            .unwrap();
        f.lifecycle.issue(f.org, draft.id).unwrap();

        let before_due = f
            .lifecycle
            .overdue_documents(f.org, DocumentKind::Invoice, jan(30))
            .unwrap();
        assert!(before_due.is_empty());

        let feb = Date::from_calendar_date(2024, Month::February, 5).unwrap();
        let after_due = f
            .lifecycle
            .overdue_documents(f.org, DocumentKind::Invoice, feb)
            .unwrap();
        assert_eq!(after_due.len(), 1);
        // Still stored as Sent, never as overdue.
        assert_eq!(after_due[0].status, DocumentStatus::Sent);
    }

    #[test]
    fn discount_and_shipping_balance_the_issue_entry() {
        let f = fixture();
        let mut cmd = invoice_cmd(dec!(1000), dec!(80));
        cmd.shipping_amount = usd(dec!(50));
        cmd.discount_amount = usd(dec!(100));
        let draft = f.lifecycle.draft_document(f.org, cmd).unwrap();
        assert_eq!(draft.total, usd(dec!(1030)));

        f.lifecycle.issue(f.org, draft.id).unwrap();
        let ar = f
            .directory
            .resolve_system_account(f.org, SystemRole::AccountsReceivable)
            .unwrap();
        let income = f
            .directory
            .resolve_system_account(f.org, SystemRole::SalesIncome)
            .unwrap();
        assert_eq!(account_net(&f, ar.id), dec!(1030));
        // 1000 sale + 50 shipping - 100 discount
        assert_eq!(account_net(&f, income.id), dec!(-950));
    }

    #[test]
    fn split_allocations_to_one_document_cannot_exceed_its_balance() {
        let f = fixture();
        let draft = f
            .lifecycle
            .draft_document(f.org, invoice_cmd(dec!(1000), dec!(0)))
            .unwrap();
        f.lifecycle.issue(f.org, draft.id).unwrap();

        // Each slice fits under the 1000 due on its own; together they do not.
        let err = f
            .lifecycle
            .apply_payment(
                f.org,
                RecordPaymentCommand {
                    payment_id: None,
                    kind: PaymentKind::Customer,
                    counterparty_id: CounterpartyId::new(),
                    payment_date: jan(10),
                    amount: usd(dec!(1200)),
                    method: PaymentMethod::BankTransfer,
                    applications: vec![
                        PaymentApplication {
                            document_id: draft.id,
                            amount: usd(dec!(600)),
                        },
                        PaymentApplication {
                            document_id: draft.id,
                            amount: usd(dec!(600)),
                        },
                    ],
                },
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Overpayment(id) if id == draft.id));

        let unchanged = f.lifecycle.document(f.org, draft.id).unwrap();
        assert_eq!(unchanged.amount_paid, usd(dec!(0)));
        assert_eq!(unchanged.amount_due, usd(dec!(1000)));
        // Only the issue entry exists; nothing posted for the payment.
        assert_eq!(f.storage.entries_for_source(f.org, draft.id).unwrap().len(), 1);
    }

    #[test]
    fn split_allocations_within_the_balance_are_summed() {
        let f = fixture();
        let draft = f
            .lifecycle
            .draft_document(f.org, invoice_cmd(dec!(1000), dec!(0)))
            .unwrap();
        f.lifecycle.issue(f.org, draft.id).unwrap();

        f.lifecycle
            .apply_payment(
                f.org,
                RecordPaymentCommand {
                    payment_id: None,
                    kind: PaymentKind::Customer,
                    counterparty_id: CounterpartyId::new(),
                    payment_date: jan(10),
                    amount: usd(dec!(700)),
                    method: PaymentMethod::BankTransfer,
                    applications: vec![
                        PaymentApplication {
                            document_id: draft.id,
                            amount: usd(dec!(400)),
                        },
                        PaymentApplication {
                            document_id: draft.id,
                            amount: usd(dec!(300)),
                        },
                    ],
                },
            )
            .unwrap();

        let settled = f.lifecycle.document(f.org, draft.id).unwrap();
        assert_eq!(settled.amount_paid, usd(dec!(700)));
        assert_eq!(settled.amount_due, usd(dec!(300)));
        assert_eq!(settled.status, DocumentStatus::Partial);
    }

    #[test]
    fn retry_with_same_payment_id_returns_the_recorded_payment() {
        let f = fixture();
        let draft = f
            .lifecycle
            .draft_document(f.org, invoice_cmd(dec!(500), dec!(0)))
            .unwrap();
        f.lifecycle.issue(f.org, draft.id).unwrap();

        let payment_id = DocumentId::new();
        let cmd = RecordPaymentCommand {
            payment_id: Some(payment_id),
            kind: PaymentKind::Customer,
            counterparty_id: CounterpartyId::new(),
            payment_date: jan(10),
            amount: usd(dec!(500)),
            method: PaymentMethod::BankTransfer,
            applications: vec![PaymentApplication {
                document_id: draft.id,
                amount: usd(dec!(500)),
            }],
        };
        let first = f.lifecycle.apply_payment(f.org, cmd.clone()).unwrap();
        let second = f.lifecycle.apply_payment(f.org, cmd).unwrap();
        assert_eq!(first.id, payment_id);
        assert_eq!(second.id, payment_id);

        // One journal entry, one header settlement.
        let entries = f.storage.entries_for_source(f.org, payment_id).unwrap();
        assert_eq!(entries.len(), 1);
        let settled = f.lifecycle.document(f.org, draft.id).unwrap();
        assert_eq!(settled.amount_paid, usd(dec!(500)));
        assert_eq!(settled.status, DocumentStatus::Paid);
    }

    #[test]
    fn reversing_a_payment_entry_posts_a_distinct_adjustment() {
        use crate::journal::JournalEngine;
        use tallybook_core::TransactionType;

        let f = fixture();
        let draft = f
            .lifecycle
            .draft_document(f.org, invoice_cmd(dec!(800), dec!(0)))
            .unwrap();
        f.lifecycle.issue(f.org, draft.id).unwrap();
        let payment = pay(&f, draft.id, dec!(800), 10).unwrap();

        let entries = f.storage.entries_for_source(f.org, payment.id).unwrap();
        assert_eq!(entries.len(), 1);
        let payment_entry = entries[0].id;

        let engine = JournalEngine::new(f.storage.clone());
        let reversal_id = engine.reverse_entry(f.org, payment_entry, jan(12)).unwrap();
        assert_ne!(reversal_id, payment_entry);

        let (reversal, _) = engine.entry(f.org, reversal_id).unwrap();
        assert_eq!(reversal.transaction_type, TransactionType::Adjustment);
        assert_eq!(reversal.reverses, Some(payment_entry));

        let cash = f
            .directory
            .resolve_system_account(f.org, SystemRole::Cash)
            .unwrap();
        assert_eq!(account_net(&f, cash.id), Decimal::ZERO);
    }
}
