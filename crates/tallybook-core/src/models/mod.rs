use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

pub mod documents;
pub mod money;
pub mod read;
pub mod write;

use money::{Currency, Money};

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

define_id!(
    /// Tenant boundary; every other id is scoped beneath one of these.
    OrganizationId
);
define_id!(AccountId);
define_id!(EntryId);
define_id!(
    /// Identifies an invoice, bill or payment acting as a journal source.
    DocumentId
);
define_id!(CounterpartyId);

/// One side of the ledger. Doubles as an account's normal balance side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Debit,
    Credit,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Debit => Side::Credit,
            Side::Credit => Side::Debit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Income,
    Expense,
}

impl AccountType {
    /// The side that increases a balance of this account type.
    pub fn normal_side(&self) -> Side {
        match self {
            AccountType::Asset | AccountType::Expense => Side::Debit,
            AccountType::Liability | AccountType::Equity | AccountType::Income => Side::Credit,
        }
    }
}

/// Well-known roles filled at organization seeding. The lifecycle manager
/// posts against these when a document does not name an account explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemRole {
    AccountsReceivable,
    AccountsPayable,
    Cash,
    SalesIncome,
    OperatingExpense,
    TaxPayable,
}

impl SystemRole {
    pub fn account_type(&self) -> AccountType {
        match self {
            SystemRole::AccountsReceivable | SystemRole::Cash => AccountType::Asset,
            SystemRole::AccountsPayable | SystemRole::TaxPayable => AccountType::Liability,
            SystemRole::SalesIncome => AccountType::Income,
            SystemRole::OperatingExpense => AccountType::Expense,
        }
    }

    pub fn default_name(&self) -> &'static str {
        match self {
            SystemRole::AccountsReceivable => "Accounts Receivable",
            SystemRole::AccountsPayable => "Accounts Payable",
            SystemRole::Cash => "Cash",
            SystemRole::SalesIncome => "Sales Income",
            SystemRole::OperatingExpense => "Operating Expenses",
            SystemRole::TaxPayable => "Tax Payable",
        }
    }

    pub fn all() -> [SystemRole; 6] {
        [
            SystemRole::AccountsReceivable,
            SystemRole::AccountsPayable,
            SystemRole::Cash,
            SystemRole::SalesIncome,
            SystemRole::OperatingExpense,
            SystemRole::TaxPayable,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: Arc<str>,
    /// Functional currency; every posting in the organization uses it.
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub organization_id: OrganizationId,
    pub name: Arc<str>,
    pub account_type: AccountType,
    pub normal_side: Side,
    pub parent_account_id: Option<AccountId>,
    pub system_role: Option<SystemRole>,
    pub is_active: bool,
    pub currency: Currency,
}

impl Account {
    pub fn is_system(&self) -> bool {
        self.system_role.is_some()
    }
}

/// Why a posting happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    InvoiceIssued,
    PaymentReceived,
    BillRecorded,
    VendorPayment,
    InvoiceVoided,
    BillVoided,
    Adjustment,
}

impl TransactionType {
    /// The type used for the compensating entry that mirrors this one.
    pub fn reversal(&self) -> TransactionType {
        match self {
            TransactionType::InvoiceIssued => TransactionType::InvoiceVoided,
            TransactionType::BillRecorded => TransactionType::BillVoided,
            _ => TransactionType::Adjustment,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::InvoiceIssued => "invoice_issued",
            TransactionType::PaymentReceived => "payment_received",
            TransactionType::BillRecorded => "bill_recorded",
            TransactionType::VendorPayment => "vendor_payment",
            TransactionType::InvoiceVoided => "invoice_voided",
            TransactionType::BillVoided => "bill_voided",
            TransactionType::Adjustment => "adjustment",
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One balanced business event. Immutable once stored; corrections are
/// posted as compensating entries, never as updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: EntryId,
    pub organization_id: OrganizationId,
    /// Monotonic insertion order across the organization's journal.
    pub sequence: u64,
    pub transaction_date: Date,
    pub transaction_type: TransactionType,
    pub source_document_id: DocumentId,
    /// Set on compensating entries only; at most one reversal may exist per
    /// reversed entry, which is what keeps reversals idempotent.
    pub reverses: Option<EntryId>,
    pub created_at: OffsetDateTime,
}

/// A single debit or credit within an entry. Holding a side plus one amount
/// makes "exactly one of debit/credit" true by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalLine {
    pub entry_id: EntryId,
    pub account_id: AccountId,
    pub side: Side,
    pub amount: Money,
    pub description: Arc<str>,
}

impl JournalLine {
    pub fn debit(&self) -> Money {
        match self.side {
            Side::Debit => self.amount,
            Side::Credit => Money::zero(self.amount.currency()),
        }
    }

    pub fn credit(&self) -> Money {
        match self.side {
            Side::Credit => self.amount,
            Side::Debit => Money::zero(self.amount.currency()),
        }
    }
}
