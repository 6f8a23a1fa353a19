use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{compute_next_recurring_date, AccountId, Cents, RecurringInterval, UserId};

pub type TransactionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Income,
    Expense,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Income => "INCOME",
            TransactionType::Expense => "EXPENSE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "INCOME" => Some(TransactionType::Income),
            "EXPENSE" => Some(TransactionType::Expense),
            _ => None,
        }
    }

    /// Apply the sign this type carries to a positive magnitude.
    pub fn signed(&self, amount_cents: Cents) -> Cents {
        match self {
            TransactionType::Income => amount_cents,
            TransactionType::Expense => -amount_cents,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single income or expense booked against an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    /// Owner, denormalised from the account
    pub user_id: UserId,
    pub account_id: AccountId,
    pub transaction_type: TransactionType,
    /// Amount in cents (always positive)
    pub amount_cents: Cents,
    pub description: Option<String>,
    pub category: String,
    /// When the transaction occurred in the real world
    pub date: DateTime<Utc>,
    /// Present when the transaction repeats
    pub recurring_interval: Option<RecurringInterval>,
    pub next_recurring_date: Option<DateTime<Utc>>,
    pub last_processed: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        user_id: UserId,
        account_id: AccountId,
        transaction_type: TransactionType,
        amount_cents: Cents,
        date: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            account_id,
            transaction_type,
            amount_cents,
            description: None,
            category: String::from(super::FALLBACK_EXPENSE_CATEGORY),
            date,
            recurring_interval: None,
            next_recurring_date: None,
            last_processed: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Mark the transaction as recurring (or not) and derive the next due date
    /// from its own date.
    pub fn with_recurrence(mut self, interval: Option<RecurringInterval>) -> Self {
        self.set_recurrence(interval);
        self
    }

    pub fn set_recurrence(&mut self, interval: Option<RecurringInterval>) {
        self.recurring_interval = interval;
        self.next_recurring_date = interval.and_then(|i| compute_next_recurring_date(self.date, i));
    }

    pub fn is_recurring(&self) -> bool {
        self.recurring_interval.is_some()
    }

    /// The amount as it affects the account balance.
    pub fn signed_amount(&self) -> Cents {
        self.transaction_type.signed(self.amount_cents)
    }

    /// Returns true if a recurring transaction has an occurrence due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_recurring() && self.next_recurring_date.is_some_and(|next| next <= now)
    }

    /// Build the concrete occurrence for the currently due date.
    /// Occurrences are plain one-off transactions.
    pub fn create_occurrence(&self) -> Option<Transaction> {
        let due = self.next_recurring_date?;
        let mut occurrence = Transaction::new(
            self.user_id,
            self.account_id,
            self.transaction_type,
            self.amount_cents,
            due,
        )
        .with_category(self.category.clone());
        occurrence.description = self.description.clone();
        Some(occurrence)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn sample(transaction_type: TransactionType, amount: Cents) -> Transaction {
        Transaction::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            transaction_type,
            amount,
            DateTime::parse_from_rfc3339("2024-01-31T09:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        )
    }

    #[test]
    fn test_signed_amount() {
        assert_eq!(sample(TransactionType::Expense, 2000).signed_amount(), -2000);
        assert_eq!(sample(TransactionType::Income, 2000).signed_amount(), 2000);
    }

    #[test]
    fn test_recurrence_sets_next_date() {
        let tx = sample(TransactionType::Expense, 100).with_recurrence(Some(RecurringInterval::Monthly));
        assert!(tx.is_recurring());
        assert_eq!(
            tx.next_recurring_date.unwrap().date_naive().to_string(),
            "2024-02-29"
        );

        let cleared = tx.with_recurrence(None);
        assert!(!cleared.is_recurring());
        assert_eq!(cleared.next_recurring_date, None);
    }

    #[test]
    fn test_is_due() {
        let tx = sample(TransactionType::Expense, 100).with_recurrence(Some(RecurringInterval::Daily));
        let next = tx.next_recurring_date.unwrap();
        assert!(!tx.is_due(next - Duration::seconds(1)));
        assert!(tx.is_due(next));

        let one_off = sample(TransactionType::Expense, 100);
        assert!(!one_off.is_due(next + Duration::days(30)));
    }

    #[test]
    fn test_occurrence_copies_template() {
        let tx = sample(TransactionType::Income, 500_000)
            .with_description("Salary")
            .with_category("salary")
            .with_recurrence(Some(RecurringInterval::Monthly));

        let occurrence = tx.create_occurrence().unwrap();
        assert_ne!(occurrence.id, tx.id);
        assert_eq!(occurrence.date, tx.next_recurring_date.unwrap());
        assert_eq!(occurrence.amount_cents, 500_000);
        assert_eq!(occurrence.category, "salary");
        assert_eq!(occurrence.description.as_deref(), Some("Salary"));
        assert!(!occurrence.is_recurring());
    }
}
