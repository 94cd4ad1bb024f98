use std::fmt::Display;
use std::sync::Arc;

use prettytable::{row, Table};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::Date;

use super::money::{Currency, Money};
use super::{AccountId, AccountType, EntryId, JournalEntry, JournalLine, Side};

/// A journal line flattened for per-account reads, ordered by
/// (date, sequence) by the storage backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostedLine {
    pub entry_id: EntryId,
    pub sequence: u64,
    pub date: Date,
    pub description: Arc<str>,
    pub side: Side,
    pub amount: Money,
}

impl PostedLine {
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

/// One row of an account ledger, carrying the running balance after the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub date: Date,
    pub description: Arc<str>,
    pub debit: Decimal,
    pub credit: Decimal,
    pub running_balance: Decimal,
}

/// Collected ledger rows for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountStatement {
    pub currency: Currency,
    pub opening_balance: Decimal,
    pub rows: Vec<LedgerRow>,
}

impl Display for AccountStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = Table::new();
        table.add_row(row!["Date", "Description", "Debit", "Credit", "Balance"]);
        table.add_empty_row();
        table.add_row(row!["", "Opening balance", "", "", self.opening_balance]);
        for item in &self.rows {
            table.add_row(row![
                item.date,
                item.description,
                item.debit,
                item.credit,
                item.running_balance
            ]);
        }
        write!(f, "\n{}\n", table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialBalanceRow {
    pub account_id: AccountId,
    pub name: Arc<str>,
    pub account_type: AccountType,
    pub debit: Decimal,
    pub credit: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialBalance {
    pub as_of: Date,
    pub currency: Currency,
    pub rows: Vec<TrialBalanceRow>,
}

impl TrialBalance {
    pub fn total_debits(&self) -> Decimal {
        self.rows.iter().map(|r| r.debit).sum()
    }

    pub fn total_credits(&self) -> Decimal {
        self.rows.iter().map(|r| r.credit).sum()
    }
}

impl Display for TrialBalance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = Table::new();
        table.add_row(row!["Account", "Debit", "Credit"]);
        table.add_empty_row();
        for item in &self.rows {
            table.add_row(row![item.name, item.debit, item.credit]);
        }
        table.add_empty_row();
        table.add_row(row!["Total", self.total_debits(), self.total_credits()]);
        write!(f, "\n{}\n", table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportLine {
    pub account_id: AccountId,
    pub name: Arc<str>,
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSheet {
    pub as_of: Date,
    pub currency: Currency,
    pub assets: Vec<ReportLine>,
    pub liabilities: Vec<ReportLine>,
    pub equity: Vec<ReportLine>,
}

impl BalanceSheet {
    pub fn total_assets(&self) -> Decimal {
        self.assets.iter().map(|l| l.balance).sum()
    }

    pub fn total_liabilities(&self) -> Decimal {
        self.liabilities.iter().map(|l| l.balance).sum()
    }

    pub fn total_equity(&self) -> Decimal {
        self.equity.iter().map(|l| l.balance).sum()
    }
}

impl Display for BalanceSheet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = Table::new();
        table.add_row(row!["Section", "Account", "Balance"]);
        table.add_empty_row();
        for line in &self.assets {
            table.add_row(row!["Assets", line.name, line.balance]);
        }
        table.add_row(row!["Assets", "Total", self.total_assets()]);
        table.add_empty_row();
        for line in &self.liabilities {
            table.add_row(row!["Liabilities", line.name, line.balance]);
        }
        table.add_row(row!["Liabilities", "Total", self.total_liabilities()]);
        table.add_empty_row();
        for line in &self.equity {
            table.add_row(row!["Equity", line.name, line.balance]);
        }
        table.add_row(row!["Equity", "Total", self.total_equity()]);
        write!(f, "\n{}\n", table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomeStatement {
    pub from: Date,
    pub to: Date,
    pub currency: Currency,
    pub income: Vec<ReportLine>,
    pub expenses: Vec<ReportLine>,
}

impl IncomeStatement {
    pub fn total_income(&self) -> Decimal {
        self.income.iter().map(|l| l.balance).sum()
    }

    pub fn total_expenses(&self) -> Decimal {
        self.expenses.iter().map(|l| l.balance).sum()
    }

    pub fn net_income(&self) -> Decimal {
        self.total_income() - self.total_expenses()
    }
}

impl Display for IncomeStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = Table::new();
        table.add_row(row!["Account", "Amount"]);
        table.add_empty_row();
        for line in &self.income {
            table.add_row(row![line.name, line.balance]);
        }
        for line in &self.expenses {
            table.add_row(row![line.name, -line.balance]);
        }
        table.add_empty_row();
        table.add_row(row!["Net income", self.net_income()]);
        write!(f, "\n{}\n", table)
    }
}

/// The transaction journal: entries with their lines, in posting order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalView {
    pub entries: Vec<(JournalEntry, Vec<JournalLine>)>,
}

impl Display for JournalView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = Table::new();
        table.add_row(row!["Date", "Type", "Description", "Debit", "Credit"]);
        table.add_empty_row();
        for (entry, lines) in &self.entries {
            for line in lines {
                table.add_row(row![
                    entry.transaction_date,
                    entry.transaction_type,
                    line.description,
                    line.debit().amount(),
                    line.credit().amount()
                ]);
            }
        }
        write!(f, "\n{}\n", table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::money::Currency;
    use rust_decimal_macros::dec;
    use time::Month;

    #[test]
    fn posted_line_exposes_only_its_side() {
        let usd = Currency::from_code("USD").unwrap();
        let line = PostedLine {
            entry_id: EntryId::new(),
            sequence: 1,
            date: Date::from_calendar_date(2024, Month::January, 5).unwrap(),
            description: Arc::from("cash sale"),
            side: Side::Credit,
            amount: Money::new(dec!(75.25), usd),
        };
        assert!(line.debit().is_zero());
        assert_eq!(line.credit().amount(), dec!(75.25));
    }
}
