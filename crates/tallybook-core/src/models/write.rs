use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::Date;

use super::documents::{DocumentKind, LineItem, PaymentApplication, PaymentKind, PaymentMethod};
use super::money::{Currency, Money};
use super::{AccountId, CounterpartyId, DocumentId, Side, SystemRole, TransactionType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostEntryCommand {
    pub transaction_date: Date,
    pub transaction_type: TransactionType,
    pub source_document_id: DocumentId,
    pub lines: Vec<LineCommand>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineCommand {
    Debit {
        account_id: AccountId,
        amount: Money,
        description: Arc<str>,
    },
    Credit {
        account_id: AccountId,
        amount: Money,
        description: Arc<str>,
    },
}

impl LineCommand {
    pub fn account_id(&self) -> AccountId {
        match self {
            LineCommand::Debit { account_id, .. } | LineCommand::Credit { account_id, .. } => {
                *account_id
            }
        }
    }

    pub fn amount(&self) -> Money {
        match self {
            LineCommand::Debit { amount, .. } | LineCommand::Credit { amount, .. } => *amount,
        }
    }

    pub fn side(&self) -> Side {
        match self {
            LineCommand::Debit { .. } => Side::Debit,
            LineCommand::Credit { .. } => Side::Credit,
        }
    }

    pub fn description(&self) -> Arc<str> {
        match self {
            LineCommand::Debit { description, .. } | LineCommand::Credit { description, .. } => {
                description.clone()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAccountCommand {
    pub name: Arc<str>,
    pub account_type: super::AccountType,
    /// Derived from the account type unless explicitly overridden
    /// (contra accounts).
    pub normal_side: Option<Side>,
    pub parent_account_id: Option<AccountId>,
    pub system_role: Option<SystemRole>,
    /// Defaults to the organization's functional currency.
    pub currency: Option<Currency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftDocumentCommand {
    pub kind: DocumentKind,
    pub counterparty_id: CounterpartyId,
    pub issue_date: Date,
    pub due_date: Date,
    pub line_items: Vec<LineItem>,
    pub tax_amount: Money,
    pub discount_amount: Money,
    pub shipping_amount: Money,
    /// AR/AP override; defaults to the organization's system account.
    pub control_account_id: Option<AccountId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPaymentCommand {
    /// Client-chosen payment id. Retrying a request with the same id returns
    /// the recorded payment instead of posting again; generated when absent.
    pub payment_id: Option<DocumentId>,
    pub kind: PaymentKind,
    pub counterparty_id: CounterpartyId,
    pub payment_date: Date,
    pub amount: Money,
    pub method: PaymentMethod,
    pub applications: Vec<PaymentApplication>,
}
