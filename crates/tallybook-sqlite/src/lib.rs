//! SQLite storage backend.
//!
//! Durable single-file store. Transactions are named SAVEPOINTs on the shared
//! connection and serialize access: statements from other threads wait until
//! the owning thread releases its outermost savepoint, so no statement can
//! land inside a stranger's transaction scope. The journal idempotency guard
//! is a pair of partial UNIQUE indexes, one on
//! `(organization_id, source_document_id, transaction_type)` for regular
//! entries and one on `(organization_id, reverses)` for compensating entries.

use std::{
    ops::Bound,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex, MutexGuard,
    },
    thread::{self, ThreadId},
};

use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use time::{Date, Month, OffsetDateTime};
use uuid::Uuid;

use tallybook_core::{
    Account, AccountId, AccountType, CounterpartyId, Currency, Document, DocumentId, DocumentKind,
    DocumentStatus, EntryId, JournalEntry, JournalLine, LineItem, Money, Organization,
    OrganizationId, Payment, PaymentApplication, PaymentKind, PaymentMethod, PostedLine, Side,
    StorageBackend, StorageError, SystemRole, TransactionId, TransactionType,
};

struct TxState {
    owner: ThreadId,
    /// Innermost savepoint last.
    stack: Vec<TransactionId>,
}

pub struct SqliteStorage {
    conn: Mutex<Connection>,
    tx_counter: AtomicU64,
    tx: Mutex<Option<TxState>>,
    tx_done: Condvar,
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(sql_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(sql_err)?;

        let storage = Self {
            conn: Mutex::new(conn),
            tx_counter: AtomicU64::new(1),
            tx: Mutex::new(None),
            tx_done: Condvar::new(),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Acquires the connection, waiting out any transaction owned by another
    /// thread. The tx guard is held until the connection lock is taken so a
    /// foreign savepoint cannot open in between.
    fn connection(&self) -> MutexGuard<'_, Connection> {
        let mut tx = self.tx.lock().unwrap();
        while tx
            .as_ref()
            .is_some_and(|t| t.owner != thread::current().id())
        {
            tx = self.tx_done.wait(tx).unwrap();
        }
        self.conn.lock().unwrap()
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.connection();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS organizations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                currency TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL REFERENCES organizations(id),
                name TEXT NOT NULL,
                account_type TEXT NOT NULL,
                normal_side TEXT NOT NULL,
                parent_account_id TEXT,
                system_role TEXT,
                is_active INTEGER NOT NULL,
                currency TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_accounts_org ON accounts(organization_id);

            CREATE TABLE IF NOT EXISTS journal_entries (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL REFERENCES organizations(id),
                sequence INTEGER NOT NULL,
                transaction_date TEXT NOT NULL,
                transaction_type TEXT NOT NULL,
                source_document_id TEXT NOT NULL,
                reverses TEXT,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_source
                ON journal_entries(organization_id, source_document_id, transaction_type)
                WHERE reverses IS NULL;

            CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_reversal
                ON journal_entries(organization_id, reverses)
                WHERE reverses IS NOT NULL;

            CREATE INDEX IF NOT EXISTS idx_entries_org_date
                ON journal_entries(organization_id, transaction_date, sequence);

            CREATE TABLE IF NOT EXISTS journal_lines (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_id TEXT NOT NULL REFERENCES journal_entries(id),
                account_id TEXT NOT NULL REFERENCES accounts(id),
                side TEXT NOT NULL,
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                description TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_lines_entry ON journal_lines(entry_id);
            CREATE INDEX IF NOT EXISTS idx_lines_account ON journal_lines(account_id);

            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL REFERENCES organizations(id),
                kind TEXT NOT NULL,
                counterparty_id TEXT NOT NULL,
                issue_date TEXT NOT NULL,
                due_date TEXT NOT NULL,
                subtotal TEXT NOT NULL,
                tax_amount TEXT NOT NULL,
                discount_amount TEXT NOT NULL,
                shipping_amount TEXT NOT NULL,
                total TEXT NOT NULL,
                amount_paid TEXT NOT NULL,
                amount_due TEXT NOT NULL,
                currency TEXT NOT NULL,
                status TEXT NOT NULL,
                control_account_id TEXT NOT NULL,
                version INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_org ON documents(organization_id, kind);

            CREATE TABLE IF NOT EXISTS document_line_items (
                document_id TEXT NOT NULL REFERENCES documents(id),
                position INTEGER NOT NULL,
                description TEXT NOT NULL,
                quantity TEXT NOT NULL,
                unit_price TEXT NOT NULL,
                currency TEXT NOT NULL,
                account_id TEXT,
                PRIMARY KEY (document_id, position)
            );

            CREATE TABLE IF NOT EXISTS payments (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL REFERENCES organizations(id),
                kind TEXT NOT NULL,
                counterparty_id TEXT NOT NULL,
                payment_date TEXT NOT NULL,
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                method TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS payment_applications (
                payment_id TEXT NOT NULL REFERENCES payments(id),
                position INTEGER NOT NULL,
                document_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                PRIMARY KEY (payment_id, position)
            );

            CREATE TABLE IF NOT EXISTS sequence_counter (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                value INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO sequence_counter (id, value) VALUES (1, 0);
            ",
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

fn sql_err(e: rusqlite::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn date_to_str(d: Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), d.month() as u8, d.day())
}

fn str_to_date(s: &str) -> Result<Date, StorageError> {
    let parts: Vec<&str> = s.split('-').collect();
    if parts.len() != 3 {
        return Err(StorageError::Other(format!("invalid date: {}", s)));
    }
    let year = parts[0]
        .parse::<i32>()
        .map_err(|e| StorageError::Other(e.to_string()))?;
    let month = parts[1]
        .parse::<u8>()
        .map_err(|e| StorageError::Other(e.to_string()))?;
    let day = parts[2]
        .parse::<u8>()
        .map_err(|e| StorageError::Other(e.to_string()))?;
    let month = Month::try_from(month).map_err(|e| StorageError::Other(e.to_string()))?;
    Date::from_calendar_date(year, month, day).map_err(|e| StorageError::Other(e.to_string()))
}

fn parse_uuid(s: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(s).map_err(|e| StorageError::Other(format!("invalid uuid: {}", e)))
}

fn parse_decimal(s: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(s).map_err(|e| StorageError::Other(format!("invalid decimal: {}", e)))
}

fn parse_currency(s: &str) -> Result<Currency, StorageError> {
    Currency::from_code(s).map_err(|e| StorageError::Other(e.to_string()))
}

fn parse_money(amount: &str, currency: &str) -> Result<Money, StorageError> {
    Ok(Money::new(parse_decimal(amount)?, parse_currency(currency)?))
}

fn account_type_to_str(at: AccountType) -> &'static str {
    match at {
        AccountType::Asset => "asset",
        AccountType::Liability => "liability",
        AccountType::Equity => "equity",
        AccountType::Income => "income",
        AccountType::Expense => "expense",
    }
}

fn str_to_account_type(s: &str) -> Result<AccountType, StorageError> {
    match s {
        "asset" => Ok(AccountType::Asset),
        "liability" => Ok(AccountType::Liability),
        "equity" => Ok(AccountType::Equity),
        "income" => Ok(AccountType::Income),
        "expense" => Ok(AccountType::Expense),
        _ => Err(StorageError::Other(format!("invalid account type: {}", s))),
    }
}

fn side_to_str(side: Side) -> &'static str {
    match side {
        Side::Debit => "debit",
        Side::Credit => "credit",
    }
}

fn str_to_side(s: &str) -> Result<Side, StorageError> {
    match s {
        "debit" => Ok(Side::Debit),
        "credit" => Ok(Side::Credit),
        _ => Err(StorageError::Other(format!("invalid side: {}", s))),
    }
}

fn system_role_to_str(role: SystemRole) -> &'static str {
    match role {
        SystemRole::AccountsReceivable => "accounts_receivable",
        SystemRole::AccountsPayable => "accounts_payable",
        SystemRole::Cash => "cash",
        SystemRole::SalesIncome => "sales_income",
        SystemRole::OperatingExpense => "operating_expense",
        SystemRole::TaxPayable => "tax_payable",
    }
}

fn str_to_system_role(s: &str) -> Result<SystemRole, StorageError> {
    match s {
        "accounts_receivable" => Ok(SystemRole::AccountsReceivable),
        "accounts_payable" => Ok(SystemRole::AccountsPayable),
        "cash" => Ok(SystemRole::Cash),
        "sales_income" => Ok(SystemRole::SalesIncome),
        "operating_expense" => Ok(SystemRole::OperatingExpense),
        "tax_payable" => Ok(SystemRole::TaxPayable),
        _ => Err(StorageError::Other(format!("invalid system role: {}", s))),
    }
}

fn str_to_transaction_type(s: &str) -> Result<TransactionType, StorageError> {
    match s {
        "invoice_issued" => Ok(TransactionType::InvoiceIssued),
        "payment_received" => Ok(TransactionType::PaymentReceived),
        "bill_recorded" => Ok(TransactionType::BillRecorded),
        "vendor_payment" => Ok(TransactionType::VendorPayment),
        "invoice_voided" => Ok(TransactionType::InvoiceVoided),
        "bill_voided" => Ok(TransactionType::BillVoided),
        "adjustment" => Ok(TransactionType::Adjustment),
        _ => Err(StorageError::Other(format!(
            "invalid transaction type: {}",
            s
        ))),
    }
}

fn kind_to_str(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Invoice => "invoice",
        DocumentKind::Bill => "bill",
    }
}

fn str_to_kind(s: &str) -> Result<DocumentKind, StorageError> {
    match s {
        "invoice" => Ok(DocumentKind::Invoice),
        "bill" => Ok(DocumentKind::Bill),
        _ => Err(StorageError::Other(format!("invalid document kind: {}", s))),
    }
}

fn status_to_str(status: DocumentStatus) -> &'static str {
    match status {
        DocumentStatus::Draft => "draft",
        DocumentStatus::Sent => "sent",
        DocumentStatus::Viewed => "viewed",
        DocumentStatus::Partial => "partial",
        DocumentStatus::Paid => "paid",
        DocumentStatus::Voided => "voided",
    }
}

fn str_to_status(s: &str) -> Result<DocumentStatus, StorageError> {
    match s {
        "draft" => Ok(DocumentStatus::Draft),
        "sent" => Ok(DocumentStatus::Sent),
        "viewed" => Ok(DocumentStatus::Viewed),
        "partial" => Ok(DocumentStatus::Partial),
        "paid" => Ok(DocumentStatus::Paid),
        "voided" => Ok(DocumentStatus::Voided),
        _ => Err(StorageError::Other(format!("invalid status: {}", s))),
    }
}

fn payment_kind_to_str(kind: PaymentKind) -> &'static str {
    match kind {
        PaymentKind::Customer => "customer",
        PaymentKind::Vendor => "vendor",
    }
}

fn str_to_payment_kind(s: &str) -> Result<PaymentKind, StorageError> {
    match s {
        "customer" => Ok(PaymentKind::Customer),
        "vendor" => Ok(PaymentKind::Vendor),
        _ => Err(StorageError::Other(format!("invalid payment kind: {}", s))),
    }
}

fn method_to_str(method: PaymentMethod) -> &'static str {
    match method {
        PaymentMethod::Cash => "cash",
        PaymentMethod::Check => "check",
        PaymentMethod::BankTransfer => "bank_transfer",
        PaymentMethod::Card => "card",
        PaymentMethod::Other => "other",
    }
}

fn str_to_method(s: &str) -> Result<PaymentMethod, StorageError> {
    match s {
        "cash" => Ok(PaymentMethod::Cash),
        "check" => Ok(PaymentMethod::Check),
        "bank_transfer" => Ok(PaymentMethod::BankTransfer),
        "card" => Ok(PaymentMethod::Card),
        "other" => Ok(PaymentMethod::Other),
        _ => Err(StorageError::Other(format!("invalid payment method: {}", s))),
    }
}

/// (comparison operator, bound value) pair for building date range SQL.
fn date_bound(bound: Bound<Date>, lower: bool) -> (&'static str, String) {
    match (bound, lower) {
        (Bound::Included(d), true) => (">=", date_to_str(d)),
        (Bound::Excluded(d), true) => (">", date_to_str(d)),
        (Bound::Unbounded, true) => (">=", "0000-01-01".to_string()),
        (Bound::Included(d), false) => ("<=", date_to_str(d)),
        (Bound::Excluded(d), false) => ("<", date_to_str(d)),
        (Bound::Unbounded, false) => ("<=", "9999-12-31".to_string()),
    }
}

type AccountRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    bool,
    String,
);

fn row_to_account(row: AccountRow) -> Result<Account, StorageError> {
    let (id, org_id, name, account_type, normal_side, parent, role, is_active, currency) = row;
    Ok(Account {
        id: AccountId(parse_uuid(&id)?),
        organization_id: OrganizationId(parse_uuid(&org_id)?),
        name: name.into(),
        account_type: str_to_account_type(&account_type)?,
        normal_side: str_to_side(&normal_side)?,
        parent_account_id: parent
            .map(|p| parse_uuid(&p).map(AccountId))
            .transpose()?,
        system_role: role.map(|r| str_to_system_role(&r)).transpose()?,
        is_active,
        currency: parse_currency(&currency)?,
    })
}

impl SqliteStorage {
    fn next_sequence_inner(conn: &Connection) -> Result<u64, StorageError> {
        conn.execute(
            "UPDATE sequence_counter SET value = value + 1 WHERE id = 1",
            [],
        )
        .map_err(sql_err)?;
        let seq: u64 = conn
            .query_row("SELECT value FROM sequence_counter WHERE id = 1", [], |r| {
                r.get(0)
            })
            .map_err(sql_err)?;
        Ok(seq)
    }

    fn load_lines(conn: &Connection, entry_id: EntryId) -> Result<Vec<JournalLine>, StorageError> {
        let mut stmt = conn
            .prepare(
                "SELECT account_id, side, amount, currency, description
                 FROM journal_lines WHERE entry_id = ?1 ORDER BY id",
            )
            .map_err(sql_err)?;
        let rows: Vec<(String, String, String, String, String)> = stmt
            .query_map(params![entry_id.to_string()], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;

        let mut lines = Vec::with_capacity(rows.len());
        for (account_id, side, amount, currency, description) in rows {
            lines.push(JournalLine {
                entry_id,
                account_id: AccountId(parse_uuid(&account_id)?),
                side: str_to_side(&side)?,
                amount: parse_money(&amount, &currency)?,
                description: description.into(),
            });
        }
        Ok(lines)
    }

    fn row_to_entry(row: EntryRow) -> Result<JournalEntry, StorageError> {
        let (id, org_id, sequence, date, tx_type, source_id, reverses, created_at) = row;
        Ok(JournalEntry {
            id: EntryId(parse_uuid(&id)?),
            organization_id: OrganizationId(parse_uuid(&org_id)?),
            sequence,
            transaction_date: str_to_date(&date)?,
            transaction_type: str_to_transaction_type(&tx_type)?,
            source_document_id: DocumentId(parse_uuid(&source_id)?),
            reverses: reverses.map(|r| parse_uuid(&r).map(EntryId)).transpose()?,
            created_at: OffsetDateTime::parse(
                &created_at,
                &time::format_description::well_known::Rfc3339,
            )
            .map_err(|e| StorageError::Other(e.to_string()))?,
        })
    }

    fn load_document(
        conn: &Connection,
        organization_id: OrganizationId,
        document_id: DocumentId,
    ) -> Result<Document, StorageError> {
        let row: Option<DocRow> = conn
            .query_row(
                "SELECT kind, counterparty_id, issue_date, due_date, subtotal, tax_amount,
                        discount_amount, shipping_amount, total, amount_paid, amount_due,
                        currency, status, control_account_id, version
                 FROM documents WHERE id = ?1 AND organization_id = ?2",
                params![document_id.to_string(), organization_id.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                        row.get(11)?,
                        row.get(12)?,
                        row.get(13)?,
                        row.get(14)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(sql_err(other)),
            })?;

        let row = row.ok_or(StorageError::DocumentNotFound(document_id))?;
        Self::row_to_document(conn, organization_id, document_id, row)
    }

    fn row_to_document(
        conn: &Connection,
        organization_id: OrganizationId,
        document_id: DocumentId,
        row: DocRow,
    ) -> Result<Document, StorageError> {
        let (
            kind,
            counterparty_id,
            issue_date,
            due_date,
            subtotal,
            tax_amount,
            discount_amount,
            shipping_amount,
            total,
            amount_paid,
            amount_due,
            currency,
            status,
            control_account_id,
            version,
        ) = row;

        let mut stmt = conn
            .prepare(
                "SELECT description, quantity, unit_price, currency, account_id
                 FROM document_line_items WHERE document_id = ?1 ORDER BY position",
            )
            .map_err(sql_err)?;
        let item_rows: Vec<(String, String, String, String, Option<String>)> = stmt
            .query_map(params![document_id.to_string()], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;

        let mut line_items = Vec::with_capacity(item_rows.len());
        for (description, quantity, unit_price, item_currency, account_id) in item_rows {
            line_items.push(LineItem {
                description: description.into(),
                quantity: parse_decimal(&quantity)?,
                unit_price: parse_money(&unit_price, &item_currency)?,
                account_id: account_id
                    .map(|a| parse_uuid(&a).map(AccountId))
                    .transpose()?,
            });
        }

        Ok(Document {
            id: document_id,
            organization_id,
            kind: str_to_kind(&kind)?,
            counterparty_id: CounterpartyId(parse_uuid(&counterparty_id)?),
            issue_date: str_to_date(&issue_date)?,
            due_date: str_to_date(&due_date)?,
            line_items,
            subtotal: parse_money(&subtotal, &currency)?,
            tax_amount: parse_money(&tax_amount, &currency)?,
            discount_amount: parse_money(&discount_amount, &currency)?,
            shipping_amount: parse_money(&shipping_amount, &currency)?,
            total: parse_money(&total, &currency)?,
            amount_paid: parse_money(&amount_paid, &currency)?,
            amount_due: parse_money(&amount_due, &currency)?,
            status: str_to_status(&status)?,
            control_account_id: AccountId(parse_uuid(&control_account_id)?),
            version,
        })
    }
}

type EntryRow = (
    String,
    String,
    u64,
    String,
    String,
    String,
    Option<String>,
    String,
);

type DocRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    u64,
);

impl StorageBackend for SqliteStorage {
    fn create_organization(&self, organization: &Organization) -> Result<(), StorageError> {
        let conn = self.connection();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO organizations (id, name, currency) VALUES (?1, ?2, ?3)",
                params![
                    organization.id.to_string(),
                    organization.name.as_ref(),
                    organization.currency.as_str()
                ],
            )
            .map_err(sql_err)?;
        if inserted == 0 {
            return Err(StorageError::OrganizationAlreadyExists(organization.id));
        }
        Ok(())
    }

    fn organization(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Organization, StorageError> {
        let conn = self.connection();
        let row: Result<(String, String), _> = conn.query_row(
            "SELECT name, currency FROM organizations WHERE id = ?1",
            params![organization_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        );
        match row {
            Ok((name, currency)) => Ok(Organization {
                id: organization_id,
                name: name.into(),
                currency: parse_currency(&currency)?,
            }),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(StorageError::OrganizationNotFound(organization_id))
            }
            Err(e) => Err(sql_err(e)),
        }
    }

    fn insert_account(&self, account: &Account) -> Result<(), StorageError> {
        let conn = self.connection();
        conn.execute(
            "INSERT INTO accounts
                (id, organization_id, name, account_type, normal_side,
                 parent_account_id, system_role, is_active, currency)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                account.id.to_string(),
                account.organization_id.to_string(),
                account.name.as_ref(),
                account_type_to_str(account.account_type),
                side_to_str(account.normal_side),
                account.parent_account_id.map(|p| p.to_string()),
                account.system_role.map(system_role_to_str),
                account.is_active,
                account.currency.as_str()
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn account(
        &self,
        organization_id: OrganizationId,
        account_id: AccountId,
    ) -> Result<Account, StorageError> {
        let conn = self.connection();
        let row: Result<AccountRow, _> = conn.query_row(
            "SELECT id, organization_id, name, account_type, normal_side,
                    parent_account_id, system_role, is_active, currency
             FROM accounts WHERE id = ?1 AND organization_id = ?2",
            params![account_id.to_string(), organization_id.to_string()],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            },
        );
        match row {
            Ok(row) => row_to_account(row),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(StorageError::AccountNotFound(account_id))
            }
            Err(e) => Err(sql_err(e)),
        }
    }

    fn update_account(&self, account: &Account) -> Result<(), StorageError> {
        let conn = self.connection();
        let updated = conn
            .execute(
                "UPDATE accounts SET name = ?3, is_active = ?4, parent_account_id = ?5
                 WHERE id = ?1 AND organization_id = ?2",
                params![
                    account.id.to_string(),
                    account.organization_id.to_string(),
                    account.name.as_ref(),
                    account.is_active,
                    account.parent_account_id.map(|p| p.to_string()),
                ],
            )
            .map_err(sql_err)?;
        if updated == 0 {
            return Err(StorageError::AccountNotFound(account.id));
        }
        Ok(())
    }

    fn list_accounts(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<Account>, StorageError> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare(
                "SELECT id, organization_id, name, account_type, normal_side,
                        parent_account_id, system_role, is_active, currency
                 FROM accounts WHERE organization_id = ?1 ORDER BY name",
            )
            .map_err(sql_err)?;
        let rows: Vec<AccountRow> = stmt
            .query_map(params![organization_id.to_string()], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        rows.into_iter().map(row_to_account).collect()
    }

    fn system_account(
        &self,
        organization_id: OrganizationId,
        role: SystemRole,
    ) -> Result<Option<Account>, StorageError> {
        let conn = self.connection();
        let row: Result<AccountRow, _> = conn.query_row(
            "SELECT id, organization_id, name, account_type, normal_side,
                    parent_account_id, system_role, is_active, currency
             FROM accounts WHERE organization_id = ?1 AND system_role = ?2",
            params![organization_id.to_string(), system_role_to_str(role)],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            },
        );
        match row {
            Ok(row) => row_to_account(row).map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(sql_err(e)),
        }
    }

    fn insert_entry(
        &self,
        entry: &JournalEntry,
        lines: &[JournalLine],
    ) -> Result<(), StorageError> {
        let conn = self.connection();
        let created_at = entry
            .created_at
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let result = conn.execute(
            "INSERT INTO journal_entries
                (id, organization_id, sequence, transaction_date,
                 transaction_type, source_document_id, reverses, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.id.to_string(),
                entry.organization_id.to_string(),
                entry.sequence,
                date_to_str(entry.transaction_date),
                entry.transaction_type.as_str(),
                entry.source_document_id.to_string(),
                entry.reverses.map(|r| r.to_string()),
                created_at
            ],
        );
        if let Err(e) = result {
            // The partial UNIQUE indexes are the idempotency guards; a
            // reversal entry can only trip the reversal index.
            if let rusqlite::Error::SqliteFailure(err, _) = &e {
                if err.code == rusqlite::ErrorCode::ConstraintViolation {
                    return Err(match entry.reverses {
                        Some(reversed) => StorageError::DuplicateReversal(reversed),
                        None => StorageError::DuplicateEntry {
                            source_document_id: entry.source_document_id,
                            transaction_type: entry.transaction_type,
                        },
                    });
                }
            }
            return Err(sql_err(e));
        }

        for line in lines {
            conn.execute(
                "INSERT INTO journal_lines
                    (entry_id, account_id, side, amount, currency, description)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.id.to_string(),
                    line.account_id.to_string(),
                    side_to_str(line.side),
                    line.amount.amount().to_string(),
                    line.amount.currency().as_str(),
                    line.description.as_ref()
                ],
            )
            .map_err(sql_err)?;
        }
        Ok(())
    }

    fn entry(
        &self,
        organization_id: OrganizationId,
        entry_id: EntryId,
    ) -> Result<(JournalEntry, Vec<JournalLine>), StorageError> {
        let conn = self.connection();
        let row: Result<EntryRow, _> = conn
            .query_row(
                "SELECT id, organization_id, sequence, transaction_date,
                        transaction_type, source_document_id, reverses, created_at
                 FROM journal_entries WHERE id = ?1 AND organization_id = ?2",
                params![entry_id.to_string(), organization_id.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            );
        let entry = match row {
            Ok(row) => Self::row_to_entry(row)?,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(StorageError::EntryNotFound(entry_id))
            }
            Err(e) => return Err(sql_err(e)),
        };
        let lines = Self::load_lines(&conn, entry.id)?;
        Ok((entry, lines))
    }

    fn entry_for_source(
        &self,
        organization_id: OrganizationId,
        source_document_id: DocumentId,
        transaction_type: TransactionType,
    ) -> Result<Option<JournalEntry>, StorageError> {
        let conn = self.connection();
        let row: Result<EntryRow, _> = conn
            .query_row(
                "SELECT id, organization_id, sequence, transaction_date,
                        transaction_type, source_document_id, reverses, created_at
                 FROM journal_entries
                 WHERE organization_id = ?1 AND source_document_id = ?2
                   AND transaction_type = ?3 AND reverses IS NULL",
                params![
                    organization_id.to_string(),
                    source_document_id.to_string(),
                    transaction_type.as_str()
                ],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            );
        match row {
            Ok(row) => Self::row_to_entry(row).map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(sql_err(e)),
        }
    }

    fn reversal_of(
        &self,
        organization_id: OrganizationId,
        entry_id: EntryId,
    ) -> Result<Option<JournalEntry>, StorageError> {
        let conn = self.connection();
        let row: Result<EntryRow, _> = conn.query_row(
            "SELECT id, organization_id, sequence, transaction_date,
                    transaction_type, source_document_id, reverses, created_at
             FROM journal_entries
             WHERE organization_id = ?1 AND reverses = ?2",
            params![organization_id.to_string(), entry_id.to_string()],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            },
        );
        match row {
            Ok(row) => Self::row_to_entry(row).map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(sql_err(e)),
        }
    }

    fn entries_for_source(
        &self,
        organization_id: OrganizationId,
        source_document_id: DocumentId,
    ) -> Result<Vec<JournalEntry>, StorageError> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare(
                "SELECT id, organization_id, sequence, transaction_date,
                        transaction_type, source_document_id, reverses, created_at
                 FROM journal_entries
                 WHERE organization_id = ?1 AND source_document_id = ?2
                 ORDER BY sequence",
            )
            .map_err(sql_err)?;
        let rows: Vec<EntryRow> = stmt
            .query_map(
                params![organization_id.to_string(), source_document_id.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        rows.into_iter().map(Self::row_to_entry).collect()
    }

    fn entries_in_range(
        &self,
        organization_id: OrganizationId,
        from: Bound<Date>,
        to: Bound<Date>,
    ) -> Result<Vec<(JournalEntry, Vec<JournalLine>)>, StorageError> {
        let conn = self.connection();
        let (from_op, from_str) = date_bound(from, true);
        let (to_op, to_str) = date_bound(to, false);
        let query = format!(
            "SELECT id, organization_id, sequence, transaction_date,
                    transaction_type, source_document_id, reverses, created_at
             FROM journal_entries
             WHERE organization_id = ?1
               AND transaction_date {} ?2 AND transaction_date {} ?3
             ORDER BY transaction_date, sequence",
            from_op, to_op
        );
        let mut stmt = conn.prepare(&query).map_err(sql_err)?;
        let rows: Vec<EntryRow> = stmt
            .query_map(
                params![organization_id.to_string(), from_str, to_str],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let entry = Self::row_to_entry(row)?;
            let lines = Self::load_lines(&conn, entry.id)?;
            result.push((entry, lines));
        }
        Ok(result)
    }

    fn lines_for_account(
        &self,
        organization_id: OrganizationId,
        account_id: AccountId,
        from: Bound<Date>,
        to: Bound<Date>,
    ) -> Result<Vec<PostedLine>, StorageError> {
        let conn = self.connection();

        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM accounts WHERE id = ?1 AND organization_id = ?2",
                params![account_id.to_string(), organization_id.to_string()],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        if !exists {
            return Err(StorageError::AccountNotFound(account_id));
        }

        let (from_op, from_str) = date_bound(from, true);
        let (to_op, to_str) = date_bound(to, false);
        let query = format!(
            "SELECT je.id, je.sequence, je.transaction_date, jl.description,
                    jl.side, jl.amount, jl.currency
             FROM journal_lines jl
             JOIN journal_entries je ON je.id = jl.entry_id
             WHERE jl.account_id = ?1 AND je.organization_id = ?2
               AND je.transaction_date {} ?3 AND je.transaction_date {} ?4
             ORDER BY je.transaction_date, je.sequence, jl.id",
            from_op, to_op
        );
        let mut stmt = conn.prepare(&query).map_err(sql_err)?;
        let rows: Vec<(String, u64, String, String, String, String, String)> = stmt
            .query_map(
                params![
                    account_id.to_string(),
                    organization_id.to_string(),
                    from_str,
                    to_str
                ],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;

        let mut result = Vec::with_capacity(rows.len());
        for (entry_id, sequence, date, description, side, amount, currency) in rows {
            result.push(PostedLine {
                entry_id: EntryId(parse_uuid(&entry_id)?),
                sequence,
                date: str_to_date(&date)?,
                description: description.into(),
                side: str_to_side(&side)?,
                amount: parse_money(&amount, &currency)?,
            });
        }
        Ok(result)
    }

    fn next_sequence(&self) -> Result<u64, StorageError> {
        let conn = self.connection();
        Self::next_sequence_inner(&conn)
    }

    fn insert_document(&self, document: &Document) -> Result<(), StorageError> {
        let conn = self.connection();
        conn.execute(
            "INSERT INTO documents
                (id, organization_id, kind, counterparty_id, issue_date, due_date,
                 subtotal, tax_amount, discount_amount, shipping_amount, total,
                 amount_paid, amount_due, currency, status, control_account_id, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                document.id.to_string(),
                document.organization_id.to_string(),
                kind_to_str(document.kind),
                document.counterparty_id.to_string(),
                date_to_str(document.issue_date),
                date_to_str(document.due_date),
                document.subtotal.amount().to_string(),
                document.tax_amount.amount().to_string(),
                document.discount_amount.amount().to_string(),
                document.shipping_amount.amount().to_string(),
                document.total.amount().to_string(),
                document.amount_paid.amount().to_string(),
                document.amount_due.amount().to_string(),
                document.total.currency().as_str(),
                status_to_str(document.status),
                document.control_account_id.to_string(),
                document.version
            ],
        )
        .map_err(sql_err)?;

        for (position, item) in document.line_items.iter().enumerate() {
            conn.execute(
                "INSERT INTO document_line_items
                    (document_id, position, description, quantity, unit_price, currency, account_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    document.id.to_string(),
                    position as u64,
                    item.description.as_ref(),
                    item.quantity.to_string(),
                    item.unit_price.amount().to_string(),
                    item.unit_price.currency().as_str(),
                    item.account_id.map(|a| a.to_string())
                ],
            )
            .map_err(sql_err)?;
        }
        Ok(())
    }

    fn document(
        &self,
        organization_id: OrganizationId,
        document_id: DocumentId,
    ) -> Result<Document, StorageError> {
        let conn = self.connection();
        Self::load_document(&conn, organization_id, document_id)
    }

    fn update_document(
        &self,
        document: &Document,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        let conn = self.connection();
        let updated = conn
            .execute(
                "UPDATE documents
                 SET amount_paid = ?3, amount_due = ?4, status = ?5, version = ?6
                 WHERE id = ?1 AND organization_id = ?2 AND version = ?7",
                params![
                    document.id.to_string(),
                    document.organization_id.to_string(),
                    document.amount_paid.amount().to_string(),
                    document.amount_due.amount().to_string(),
                    status_to_str(document.status),
                    expected_version + 1,
                    expected_version
                ],
            )
            .map_err(sql_err)?;
        if updated == 0 {
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) > 0 FROM documents WHERE id = ?1 AND organization_id = ?2",
                    params![
                        document.id.to_string(),
                        document.organization_id.to_string()
                    ],
                    |row| row.get(0),
                )
                .map_err(sql_err)?;
            return if exists {
                Err(StorageError::VersionConflict(document.id))
            } else {
                Err(StorageError::DocumentNotFound(document.id))
            };
        }
        Ok(())
    }

    fn list_documents(
        &self,
        organization_id: OrganizationId,
        kind: DocumentKind,
    ) -> Result<Vec<Document>, StorageError> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare(
                "SELECT id FROM documents
                 WHERE organization_id = ?1 AND kind = ?2 ORDER BY issue_date, id",
            )
            .map_err(sql_err)?;
        let ids: Vec<String> = stmt
            .query_map(
                params![organization_id.to_string(), kind_to_str(kind)],
                |row| row.get(0),
            )
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;

        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            let document_id = DocumentId(parse_uuid(&id)?);
            result.push(Self::load_document(&conn, organization_id, document_id)?);
        }
        Ok(result)
    }

    fn insert_payment(&self, payment: &Payment) -> Result<(), StorageError> {
        let conn = self.connection();
        conn.execute(
            "INSERT INTO payments
                (id, organization_id, kind, counterparty_id, payment_date, amount, currency, method)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                payment.id.to_string(),
                payment.organization_id.to_string(),
                payment_kind_to_str(payment.kind),
                payment.counterparty_id.to_string(),
                date_to_str(payment.payment_date),
                payment.amount.amount().to_string(),
                payment.amount.currency().as_str(),
                method_to_str(payment.method)
            ],
        )
        .map_err(sql_err)?;

        for (position, application) in payment.applications.iter().enumerate() {
            conn.execute(
                "INSERT INTO payment_applications
                    (payment_id, position, document_id, amount, currency)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    payment.id.to_string(),
                    position as u64,
                    application.document_id.to_string(),
                    application.amount.amount().to_string(),
                    application.amount.currency().as_str()
                ],
            )
            .map_err(sql_err)?;
        }
        Ok(())
    }

    fn payment(
        &self,
        organization_id: OrganizationId,
        payment_id: DocumentId,
    ) -> Result<Payment, StorageError> {
        let conn = self.connection();
        let row: Result<(String, String, String, String, String, String), _> = conn.query_row(
            "SELECT kind, counterparty_id, payment_date, amount, currency, method
             FROM payments WHERE id = ?1 AND organization_id = ?2",
            params![payment_id.to_string(), organization_id.to_string()],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        );
        let (kind, counterparty_id, payment_date, amount, currency, method) = match row {
            Ok(row) => row,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(StorageError::PaymentNotFound(payment_id))
            }
            Err(e) => return Err(sql_err(e)),
        };

        let mut stmt = conn
            .prepare(
                "SELECT document_id, amount, currency FROM payment_applications
                 WHERE payment_id = ?1 ORDER BY position",
            )
            .map_err(sql_err)?;
        let application_rows: Vec<(String, String, String)> = stmt
            .query_map(params![payment_id.to_string()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;

        let mut applications = Vec::with_capacity(application_rows.len());
        for (document_id, app_amount, app_currency) in application_rows {
            applications.push(PaymentApplication {
                document_id: DocumentId(parse_uuid(&document_id)?),
                amount: parse_money(&app_amount, &app_currency)?,
            });
        }

        Ok(Payment {
            id: payment_id,
            organization_id,
            kind: str_to_payment_kind(&kind)?,
            counterparty_id: CounterpartyId(parse_uuid(&counterparty_id)?),
            payment_date: str_to_date(&payment_date)?,
            amount: parse_money(&amount, &currency)?,
            method: str_to_method(&method)?,
            applications,
        })
    }

    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let mut tx = self.tx.lock().unwrap();
        while tx
            .as_ref()
            .is_some_and(|t| t.owner != thread::current().id())
        {
            tx = self.tx_done.wait(tx).unwrap();
        }
        let conn = self.conn.lock().unwrap();
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        conn.execute_batch(&format!("SAVEPOINT sp_{}", tx_id))
            .map_err(sql_err)?;
        match tx.as_mut() {
            Some(t) => t.stack.push(tx_id),
            None => {
                *tx = Some(TxState {
                    owner: thread::current().id(),
                    stack: vec![tx_id],
                });
            }
        }
        tracing::debug!(tx_id, "SQLite transaction started");
        Ok(tx_id)
    }

    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut tx = self.tx.lock().unwrap();
        let finished = {
            let state = tx.as_mut().ok_or(StorageError::NoActiveTransaction)?;
            // Only the innermost savepoint may end.
            if state.owner != thread::current().id() || state.stack.last() != Some(&tx_id) {
                return Err(StorageError::NoActiveTransaction);
            }
            let conn = self.conn.lock().unwrap();
            conn.execute_batch(&format!("RELEASE SAVEPOINT sp_{}", tx_id))
                .map_err(sql_err)?;
            state.stack.pop();
            state.stack.is_empty()
        };
        if finished {
            *tx = None;
            drop(tx);
            self.tx_done.notify_all();
        }
        tracing::debug!(tx_id, "SQLite transaction committed");
        Ok(())
    }

    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut tx = self.tx.lock().unwrap();
        let finished = {
            let state = tx.as_mut().ok_or(StorageError::NoActiveTransaction)?;
            if state.owner != thread::current().id() || state.stack.last() != Some(&tx_id) {
                return Err(StorageError::NoActiveTransaction);
            }
            let conn = self.conn.lock().unwrap();
            conn.execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT sp_{0}; RELEASE SAVEPOINT sp_{0}",
                tx_id
            ))
            .map_err(sql_err)?;
            state.stack.pop();
            state.stack.is_empty()
        };
        if finished {
            *tx = None;
            drop(tx);
            self.tx_done.notify_all();
        }
        tracing::debug!(tx_id, "SQLite transaction rolled back");
        Ok(())
    }
}
