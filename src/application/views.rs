// Transport shapes: ids as strings, money as plain numbers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{
    cents_to_f64, Account, AccountType, RecurringInterval, Transaction, TransactionType,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub id: String,
    pub user_id: String,
    pub account_id: String,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub amount: f64,
    pub description: Option<String>,
    pub category: String,
    pub date: DateTime<Utc>,
    pub is_recurring: bool,
    pub recurring_interval: Option<RecurringInterval>,
    pub next_recurring_date: Option<DateTime<Utc>>,
    pub last_processed: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Transaction> for TransactionView {
    fn from(t: &Transaction) -> Self {
        Self {
            id: t.id.to_string(),
            user_id: t.user_id.to_string(),
            account_id: t.account_id.to_string(),
            transaction_type: t.transaction_type,
            amount: cents_to_f64(t.amount_cents),
            description: t.description.clone(),
            category: t.category.clone(),
            date: t.date,
            is_recurring: t.is_recurring(),
            recurring_interval: t.recurring_interval,
            next_recurring_date: t.next_recurring_date,
            last_processed: t.last_processed,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    pub balance: f64,
    pub is_default: bool,
    /// Only filled in by listing operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_count: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccountView {
    pub fn with_transaction_count(mut self, count: i64) -> Self {
        self.transaction_count = Some(count);
        self
    }
}

impl From<&Account> for AccountView {
    fn from(a: &Account) -> Self {
        Self {
            id: a.id.to_string(),
            user_id: a.user_id.to_string(),
            name: a.name.clone(),
            account_type: a.account_type,
            balance: cents_to_f64(a.balance_cents),
            is_default: a.is_default,
            transaction_count: None,
            created_at: a.created_at,
            updated_at: a.updated_at,
        }
    }
}

/// One account together with its transactions, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDetail {
    pub account: AccountView,
    pub transactions: Vec<TransactionView>,
}
