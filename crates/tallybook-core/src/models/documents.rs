use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::Date;

use super::money::{Money, MoneyError};
use super::{AccountId, CounterpartyId, DocumentId, OrganizationId, SystemRole, TransactionType};

/// Invoices and bills share one header shape; the kind picks the control
/// account side (AR vs AP) and the posting direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Invoice,
    Bill,
}

impl DocumentKind {
    pub fn control_role(&self) -> SystemRole {
        match self {
            DocumentKind::Invoice => SystemRole::AccountsReceivable,
            DocumentKind::Bill => SystemRole::AccountsPayable,
        }
    }

    /// Default counter-account role for line items without an explicit account.
    pub fn detail_role(&self) -> SystemRole {
        match self {
            DocumentKind::Invoice => SystemRole::SalesIncome,
            DocumentKind::Bill => SystemRole::OperatingExpense,
        }
    }

    pub fn issue_type(&self) -> TransactionType {
        match self {
            DocumentKind::Invoice => TransactionType::InvoiceIssued,
            DocumentKind::Bill => TransactionType::BillRecorded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Draft,
    Sent,
    Viewed,
    Partial,
    Paid,
    Voided,
}

impl DocumentStatus {
    /// Open documents can still receive payment applications.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Sent | DocumentStatus::Viewed | DocumentStatus::Partial
        )
    }

    /// Explicit transition table; anything not listed is invalid.
    pub fn can_become(&self, to: DocumentStatus) -> bool {
        use DocumentStatus::*;
        match (*self, to) {
            (Draft, Sent) => true,
            (Sent, Viewed) => true,
            (Sent | Viewed | Partial, Partial | Paid) => true,
            (Voided, _) => false,
            (_, Voided) => true,
            _ => false,
        }
    }
}

/// Pure status derivation from the paid/total amounts. Callers handle the
/// void flag separately; overdue is never a stored status at all.
pub fn settled_status(
    current: DocumentStatus,
    amount_paid: Money,
    total: Money,
) -> DocumentStatus {
    if amount_paid == total {
        DocumentStatus::Paid
    } else if amount_paid.is_positive() {
        DocumentStatus::Partial
    } else {
        current
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: Arc<str>,
    pub quantity: Decimal,
    pub unit_price: Money,
    /// Income (invoice) or expense (bill) account; defaults to the
    /// organization's detail role account when absent.
    pub account_id: Option<AccountId>,
}

impl LineItem {
    pub fn amount(&self) -> Result<Money, MoneyError> {
        self.unit_price.checked_mul(self.quantity)
    }
}

/// Invoice or bill header. `amount_paid`/`amount_due`/`status` are derived
/// through lifecycle transitions only and are always reconcilable against
/// the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub organization_id: OrganizationId,
    pub kind: DocumentKind,
    pub counterparty_id: CounterpartyId,
    pub issue_date: Date,
    pub due_date: Date,
    pub line_items: Vec<LineItem>,
    pub subtotal: Money,
    pub tax_amount: Money,
    pub discount_amount: Money,
    pub shipping_amount: Money,
    pub total: Money,
    pub amount_paid: Money,
    pub amount_due: Money,
    pub status: DocumentStatus,
    /// AR account for invoices, AP account for bills.
    pub control_account_id: AccountId,
    /// Optimistic concurrency token; bumped by every header update.
    pub version: u64,
}

impl Document {
    /// Query-time derivation; overdue is never written to the header.
    pub fn is_overdue(&self, today: Date) -> bool {
        self.status.is_open() && self.due_date < today && self.amount_due.is_positive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Check,
    BankTransfer,
    Card,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentKind {
    /// Money received from a customer against invoices.
    Customer,
    /// Money paid out to a vendor against bills.
    Vendor,
}

impl PaymentKind {
    pub fn transaction_type(&self) -> TransactionType {
        match self {
            PaymentKind::Customer => TransactionType::PaymentReceived,
            PaymentKind::Vendor => TransactionType::VendorPayment,
        }
    }

    /// The document kind a payment of this direction may settle.
    pub fn target_kind(&self) -> DocumentKind {
        match self {
            PaymentKind::Customer => DocumentKind::Invoice,
            PaymentKind::Vendor => DocumentKind::Bill,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentApplication {
    pub document_id: DocumentId,
    pub amount: Money,
}

/// A payment split across one or more open documents. The applications
/// always sum to `amount`; this is validated before anything is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: DocumentId,
    pub organization_id: OrganizationId,
    pub kind: PaymentKind,
    pub counterparty_id: CounterpartyId,
    pub payment_date: Date,
    pub amount: Money,
    pub method: PaymentMethod,
    pub applications: Vec<PaymentApplication>,
}
