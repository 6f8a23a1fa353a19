use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::domain::{
    Account, AccountId, AccountType, Cents, RecurringInterval, Transaction, TransactionId,
    TransactionType, User, UserId,
};

use super::MIGRATION_001_INITIAL;

const ACCOUNT_COLUMNS: &str = "id, user_id, name, account_type, opening_balance_cents, balance_cents, is_default, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, user_id, account_id, transaction_type, amount_cents, description, category, date, recurring_interval, next_recurring_date, last_processed, created_at, updated_at";

/// A single logical write. A batch of mutations is applied by
/// [`Repository::commit`] inside one database transaction.
#[derive(Debug, Clone)]
pub enum Mutation {
    InsertUser(User),
    InsertAccount(Account),
    /// Clear the default flag on every account owned by the user
    ClearDefaultAccounts { user_id: UserId },
    SetDefaultAccount { account_id: AccountId },
    InsertTransaction(Transaction),
    /// Overwrite every mutable column of an existing transaction
    UpdateTransaction(Transaction),
    /// Store-side increment of an account balance
    AdjustBalance { account_id: AccountId, delta: Cents },
}

/// Repository for persisting and querying users, accounts and transactions.
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database at the given URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// Initialize a new database (connect + migrate).
    pub async fn init(database_url: &str) -> Result<Self> {
        let repo = Self::connect(database_url).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    // ========================
    // Atomic write unit
    // ========================

    /// Apply all mutations or none of them.
    ///
    /// Any failing statement, including an update that matches no row, aborts
    /// the batch; the open transaction is rolled back when dropped.
    pub async fn commit(&self, mutations: &[Mutation]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        for mutation in mutations {
            apply_mutation(&mut *tx, mutation).await?;
        }

        tx.commit().await.context("Failed to commit transaction")?;
        Ok(())
    }

    // ========================
    // User queries
    // ========================

    /// Get a user by the identity provider's subject id.
    pub async fn get_user_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, external_id, email, name, created_at FROM users WHERE external_id = ?",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user by external id")?;

        row.as_ref().map(Self::row_to_user).transpose()
    }

    fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
        let id_str: String = row.get("id");
        let created_at_str: String = row.get("created_at");

        Ok(User {
            id: Uuid::parse_str(&id_str).context("Invalid user ID")?,
            external_id: row.get("external_id"),
            email: row.get("email"),
            name: row.get("name"),
            created_at: parse_timestamp(&created_at_str).context("Invalid created_at")?,
        })
    }

    // ========================
    // Account queries
    // ========================

    /// Get an account by ID.
    pub async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch account")?;

        row.as_ref().map(Self::row_to_account).transpose()
    }

    /// List a user's accounts, newest first, with the number of transactions
    /// booked against each.
    pub async fn list_accounts_with_counts(&self, user_id: UserId) -> Result<Vec<(Account, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.user_id, a.name, a.account_type, a.opening_balance_cents, a.balance_cents,
                   a.is_default, a.created_at, a.updated_at,
                   (SELECT COUNT(*) FROM transactions t WHERE t.account_id = a.id) AS transaction_count
            FROM accounts a
            WHERE a.user_id = ?
            ORDER BY a.created_at DESC
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list accounts")?;

        rows.iter()
            .map(|row| -> Result<(Account, i64)> {
                Ok((Self::row_to_account(row)?, row.get("transaction_count")))
            })
            .collect()
    }

    /// Count the accounts a user owns.
    pub async fn count_accounts(&self, user_id: UserId) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM accounts WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_one(&self.pool)
            .await
            .context("Failed to count accounts")?;

        Ok(row.get("count"))
    }

    fn row_to_account(row: &sqlx::sqlite::SqliteRow) -> Result<Account> {
        let id_str: String = row.get("id");
        let user_id_str: String = row.get("user_id");
        let account_type_str: String = row.get("account_type");
        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        Ok(Account {
            id: Uuid::parse_str(&id_str).context("Invalid account ID")?,
            user_id: Uuid::parse_str(&user_id_str).context("Invalid account user ID")?,
            name: row.get("name"),
            account_type: AccountType::from_str(&account_type_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid account type: {}", account_type_str))?,
            opening_balance_cents: row.get("opening_balance_cents"),
            balance_cents: row.get("balance_cents"),
            is_default: row.get::<i32, _>("is_default") != 0,
            created_at: parse_timestamp(&created_at_str).context("Invalid created_at")?,
            updated_at: parse_timestamp(&updated_at_str).context("Invalid updated_at")?,
        })
    }

    // ========================
    // Transaction queries
    // ========================

    /// Get a transaction by ID.
    pub async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch transaction")?;

        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    /// List all of a user's transactions, newest first by date.
    pub async fn list_transactions_for_user(&self, user_id: UserId) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE user_id = ? ORDER BY date DESC, created_at DESC"
        ))
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list transactions")?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    /// List the transactions booked against one account, newest first by date.
    pub async fn list_transactions_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE account_id = ? ORDER BY date DESC, created_at DESC"
        ))
        .bind(account_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list transactions for account")?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    /// List a user's recurring transactions whose next occurrence is due.
    pub async fn list_due_recurring(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM transactions
            WHERE user_id = ?
              AND recurring_interval IS NOT NULL
              AND next_recurring_date IS NOT NULL
              AND next_recurring_date <= ?
            ORDER BY next_recurring_date
            "#
        ))
        .bind(user_id.to_string())
        .bind(format_timestamp(now))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list due recurring transactions")?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    fn row_to_transaction(row: &sqlx::sqlite::SqliteRow) -> Result<Transaction> {
        let id_str: String = row.get("id");
        let user_id_str: String = row.get("user_id");
        let account_id_str: String = row.get("account_id");
        let type_str: String = row.get("transaction_type");
        let date_str: String = row.get("date");
        let interval_str: Option<String> = row.get("recurring_interval");
        let next_str: Option<String> = row.get("next_recurring_date");
        let processed_str: Option<String> = row.get("last_processed");
        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        Ok(Transaction {
            id: Uuid::parse_str(&id_str).context("Invalid transaction ID")?,
            user_id: Uuid::parse_str(&user_id_str).context("Invalid transaction user ID")?,
            account_id: Uuid::parse_str(&account_id_str).context("Invalid account ID")?,
            transaction_type: TransactionType::from_str(&type_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid transaction type: {}", type_str))?,
            amount_cents: row.get("amount_cents"),
            description: row.get("description"),
            category: row.get("category"),
            date: parse_timestamp(&date_str).context("Invalid date")?,
            recurring_interval: interval_str
                .map(|s| s.parse::<RecurringInterval>())
                .transpose()?,
            next_recurring_date: next_str
                .map(|s| parse_timestamp(&s))
                .transpose()
                .context("Invalid next_recurring_date")?,
            last_processed: processed_str
                .map(|s| parse_timestamp(&s))
                .transpose()
                .context("Invalid last_processed")?,
            created_at: parse_timestamp(&created_at_str).context("Invalid created_at")?,
            updated_at: parse_timestamp(&updated_at_str).context("Invalid updated_at")?,
        })
    }
}

async fn apply_mutation(conn: &mut SqliteConnection, mutation: &Mutation) -> Result<()> {
    match mutation {
        Mutation::InsertUser(user) => {
            sqlx::query(
                "INSERT INTO users (id, external_id, email, name, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(user.id.to_string())
            .bind(&user.external_id)
            .bind(&user.email)
            .bind(&user.name)
            .bind(format_timestamp(user.created_at))
            .execute(&mut *conn)
            .await
            .context("Failed to insert user")?;
        }

        Mutation::InsertAccount(account) => {
            sqlx::query(&format!(
                "INSERT INTO accounts ({ACCOUNT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(account.id.to_string())
            .bind(account.user_id.to_string())
            .bind(&account.name)
            .bind(account.account_type.as_str())
            .bind(account.opening_balance_cents)
            .bind(account.balance_cents)
            .bind(account.is_default)
            .bind(format_timestamp(account.created_at))
            .bind(format_timestamp(account.updated_at))
            .execute(&mut *conn)
            .await
            .context("Failed to insert account")?;
        }

        Mutation::ClearDefaultAccounts { user_id } => {
            sqlx::query(
                "UPDATE accounts SET is_default = 0, updated_at = ? WHERE user_id = ? AND is_default = 1",
            )
            .bind(format_timestamp(Utc::now()))
            .bind(user_id.to_string())
            .execute(&mut *conn)
            .await
            .context("Failed to clear default accounts")?;
        }

        Mutation::SetDefaultAccount { account_id } => {
            let result = sqlx::query("UPDATE accounts SET is_default = 1, updated_at = ? WHERE id = ?")
                .bind(format_timestamp(Utc::now()))
                .bind(account_id.to_string())
                .execute(&mut *conn)
                .await
                .context("Failed to set default account")?;
            if result.rows_affected() != 1 {
                bail!("Account {} disappeared while setting default", account_id);
            }
        }

        Mutation::InsertTransaction(transaction) => {
            sqlx::query(&format!(
                "INSERT INTO transactions ({TRANSACTION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(transaction.id.to_string())
            .bind(transaction.user_id.to_string())
            .bind(transaction.account_id.to_string())
            .bind(transaction.transaction_type.as_str())
            .bind(transaction.amount_cents)
            .bind(&transaction.description)
            .bind(&transaction.category)
            .bind(format_timestamp(transaction.date))
            .bind(transaction.recurring_interval.map(|i| i.as_str()))
            .bind(transaction.next_recurring_date.map(format_timestamp))
            .bind(transaction.last_processed.map(format_timestamp))
            .bind(format_timestamp(transaction.created_at))
            .bind(format_timestamp(transaction.updated_at))
            .execute(&mut *conn)
            .await
            .context("Failed to insert transaction")?;
        }

        Mutation::UpdateTransaction(transaction) => {
            let result = sqlx::query(
                r#"
                UPDATE transactions
                SET account_id = ?, transaction_type = ?, amount_cents = ?, description = ?,
                    category = ?, date = ?, recurring_interval = ?, next_recurring_date = ?,
                    last_processed = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(transaction.account_id.to_string())
            .bind(transaction.transaction_type.as_str())
            .bind(transaction.amount_cents)
            .bind(&transaction.description)
            .bind(&transaction.category)
            .bind(format_timestamp(transaction.date))
            .bind(transaction.recurring_interval.map(|i| i.as_str()))
            .bind(transaction.next_recurring_date.map(format_timestamp))
            .bind(transaction.last_processed.map(format_timestamp))
            .bind(format_timestamp(transaction.updated_at))
            .bind(transaction.id.to_string())
            .execute(&mut *conn)
            .await
            .context("Failed to update transaction")?;
            if result.rows_affected() != 1 {
                bail!("Transaction {} disappeared during update", transaction.id);
            }
        }

        Mutation::AdjustBalance { account_id, delta } => {
            let result = sqlx::query(
                "UPDATE accounts SET balance_cents = balance_cents + ?, updated_at = ? WHERE id = ?",
            )
            .bind(delta)
            .bind(format_timestamp(Utc::now()))
            .bind(account_id.to_string())
            .execute(&mut *conn)
            .await
            .context("Failed to adjust account balance")?;
            if result.rows_affected() != 1 {
                bail!("Account {} disappeared while adjusting balance", account_id);
            }
        }
    }

    Ok(())
}

/// Timestamps are stored as fixed-width RFC 3339 text in UTC so that string
/// comparison in SQL matches chronological order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    async fn test_repo() -> Result<(Repository, TempDir)> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("repo.db");
        let repo = Repository::init(&format!("sqlite:{}?mode=rwc", db_path.display())).await?;
        Ok((repo, temp_dir))
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let a = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let b = a + chrono::Duration::nanoseconds(1);
        assert_eq!(format_timestamp(a).len(), format_timestamp(b).len());
        assert!(format_timestamp(a) < format_timestamp(b));
        assert_eq!(parse_timestamp(&format_timestamp(b)).unwrap(), b);
    }

    #[tokio::test]
    async fn test_commit_rolls_back_on_failure() -> Result<()> {
        let (repo, _temp) = test_repo().await?;

        let user = User::new("user_1", "one@example.com");
        let account = Account::new(user.id, "Main".into(), AccountType::Current, 10_000);
        repo.commit(&[
            Mutation::InsertUser(user.clone()),
            Mutation::InsertAccount(account.clone()),
        ])
        .await?;

        let tx = Transaction::new(
            user.id,
            account.id,
            TransactionType::Expense,
            2_000,
            Utc::now(),
        );
        let result = repo
            .commit(&[
                Mutation::InsertTransaction(tx.clone()),
                Mutation::AdjustBalance {
                    account_id: account.id,
                    delta: -2_000,
                },
                // Unknown account: the whole batch must be discarded
                Mutation::AdjustBalance {
                    account_id: Uuid::new_v4(),
                    delta: 1,
                },
            ])
            .await;

        assert!(result.is_err());
        assert!(repo.get_transaction(tx.id).await?.is_none());
        assert_eq!(
            repo.get_account(account.id).await?.unwrap().balance_cents,
            10_000
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_single_default_is_enforced_by_schema() -> Result<()> {
        let (repo, _temp) = test_repo().await?;

        let user = User::new("user_1", "one@example.com");
        let first = Account::new(user.id, "A".into(), AccountType::Current, 0).with_default(true);
        let second = Account::new(user.id, "B".into(), AccountType::Savings, 0).with_default(true);

        repo.commit(&[
            Mutation::InsertUser(user.clone()),
            Mutation::InsertAccount(first),
        ])
        .await?;

        assert!(repo
            .commit(&[Mutation::InsertAccount(second.clone())])
            .await
            .is_err());

        repo.commit(&[
            Mutation::ClearDefaultAccounts { user_id: user.id },
            Mutation::InsertAccount(second),
        ])
        .await?;

        let defaults = repo
            .list_accounts_with_counts(user.id)
            .await?
            .into_iter()
            .filter(|(a, _)| a.is_default)
            .count();
        assert_eq!(defaults, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_balance_cannot_leave_integer_range() -> Result<()> {
        let (repo, _temp) = test_repo().await?;

        let user = User::new("user_1", "one@example.com");
        let account = Account::new(user.id, "Full".into(), AccountType::Current, Cents::MAX);
        repo.commit(&[
            Mutation::InsertUser(user.clone()),
            Mutation::InsertAccount(account.clone()),
        ])
        .await?;

        let tx = Transaction::new(user.id, account.id, TransactionType::Income, 1, Utc::now());
        let result = repo
            .commit(&[
                Mutation::InsertTransaction(tx.clone()),
                Mutation::AdjustBalance {
                    account_id: account.id,
                    delta: 1,
                },
            ])
            .await;

        assert!(result.is_err());
        assert!(repo.get_transaction(tx.id).await?.is_none());
        assert_eq!(
            repo.get_account(account.id).await?.unwrap().balance_cents,
            Cents::MAX
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_transaction_round_trip() -> Result<()> {
        let (repo, _temp) = test_repo().await?;

        let user = User::new("user_1", "one@example.com").with_name("One");
        let account = Account::new(user.id, "Main".into(), AccountType::Current, 0);
        let tx = Transaction::new(user.id, account.id, TransactionType::Income, 150, Utc::now())
            .with_description("Refund")
            .with_category("other-income")
            .with_recurrence(Some(RecurringInterval::Weekly));

        repo.commit(&[
            Mutation::InsertUser(user.clone()),
            Mutation::InsertAccount(account.clone()),
            Mutation::InsertTransaction(tx.clone()),
        ])
        .await?;

        assert_eq!(repo.get_user_by_external_id("user_1").await?, Some(user));
        assert_eq!(repo.get_account(account.id).await?, Some(account));
        assert_eq!(repo.get_transaction(tx.id).await?, Some(tx));
        Ok(())
    }
}
