use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::{
    apply_delta, categories_for, check_balance, compute_next_recurring_date, parse_cents,
    parse_positive_cents, plan_create, plan_update, Account, AccountId, AccountType,
    BalanceAdjustment, BalanceCheck, Cents, ParseCentsError, RecurringInterval, Transaction,
    TransactionId, TransactionType, User,
};
use crate::extraction::ScannedReceipt;
use crate::storage::{Mutation, Repository};

use super::{
    AccessGuard, AccountDetail, AccountView, AppError, Caller, DenyReason, GuardDecision,
    TransactionView,
};

/// Tunables for the ledger's calls to external collaborators.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Upper bound on a single access guard check
    pub guard_timeout: Duration,
    /// Units requested from the access guard per mutating operation
    pub request_cost: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            guard_timeout: Duration::from_secs(5),
            request_cost: 1,
        }
    }
}

/// Fields of a transaction as entered by a user (or read from a receipt).
/// The amount is kept as raw text and validated by the service.
#[derive(Debug, Clone)]
pub struct TransactionInput {
    pub account_id: AccountId,
    pub transaction_type: TransactionType,
    pub amount: String,
    pub date: DateTime<Utc>,
    pub description: Option<String>,
    /// Defaults to `other-expense` / `other-income` when omitted
    pub category: Option<String>,
    pub recurring_interval: Option<RecurringInterval>,
}

/// Fields of a new account as entered by a user.
#[derive(Debug, Clone)]
pub struct AccountInput {
    pub name: String,
    pub account_type: AccountType,
    pub initial_balance: String,
    pub is_default: bool,
}

/// Application service providing the ledger operations.
/// This is the primary interface for any client (CLI, API, etc.).
pub struct LedgerService {
    repo: Repository,
    guard: Arc<dyn AccessGuard>,
    config: LedgerConfig,
}

impl LedgerService {
    /// Create a new ledger service with the given repository and access guard.
    pub fn new(repo: Repository, guard: Arc<dyn AccessGuard>) -> Self {
        Self {
            repo,
            guard,
            config: LedgerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LedgerConfig) -> Self {
        self.config = config;
        self
    }

    /// Open (creating if needed) the database at the given path and bring its
    /// schema up to date.
    pub async fn init(database_path: &str, guard: Arc<dyn AccessGuard>) -> Result<Self, AppError> {
        let db_url = format!("sqlite:{}?mode=rwc", database_path);
        let repo = Repository::init(&db_url).await?;
        Ok(Self::new(repo, guard))
    }

    // ========================
    // Identity
    // ========================

    /// Resolve the caller to a known user.
    async fn require_user(&self, caller: &Caller) -> Result<User, AppError> {
        let external_id = caller.external_id().ok_or(AppError::Unauthorized)?;
        self.repo
            .get_user_by_external_id(external_id)
            .await?
            .ok_or(AppError::UserNotFound)
    }

    /// Return the user behind the caller, creating it on first sign-in.
    pub async fn sync_user(
        &self,
        caller: &Caller,
        email: &str,
        name: Option<String>,
    ) -> Result<User, AppError> {
        let external_id = caller.external_id().ok_or(AppError::Unauthorized)?;
        if let Some(user) = self.repo.get_user_by_external_id(external_id).await? {
            return Ok(user);
        }

        let email = email.trim();
        if email.is_empty() {
            return Err(AppError::InvalidInput("Email is required".to_string()));
        }

        let mut user = User::new(external_id, email);
        if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
            user = user.with_name(name);
        }

        if let Err(e) = self.repo.commit(&[Mutation::InsertUser(user.clone())]).await {
            // Lost a race with a concurrent first sign-in
            return match self.repo.get_user_by_external_id(external_id).await? {
                Some(existing) => Ok(existing),
                None => Err(e.into()),
            };
        }

        tracing::info!(user_id = %user.id, external_id, "Created user on first sign-in");
        Ok(user)
    }

    /// Consult the access guard before a mutating operation.
    async fn check_access(&self, user: &User) -> Result<(), AppError> {
        let timeout = self.config.guard_timeout;
        let decision = tokio::time::timeout(
            timeout,
            self.guard.protect(&user.external_id, self.config.request_cost),
        )
        .await
        .map_err(|_| AppError::ExternalTimeout {
            service: "access guard",
            after: timeout,
        })?
        .map_err(|e| AppError::Blocked(format!("access guard unavailable: {:#}", e)))?;

        match decision {
            GuardDecision::Allow => Ok(()),
            GuardDecision::Deny(DenyReason::RateLimit {
                remaining,
                reset_in_seconds,
            }) => {
                tracing::warn!(
                    code = "RATE_LIMIT_EXCEEDED",
                    user_id = %user.id,
                    remaining,
                    reset_in_seconds,
                    "Access guard rate limited request"
                );
                Err(AppError::RateLimited {
                    remaining,
                    reset_in_seconds,
                })
            }
            GuardDecision::Deny(DenyReason::Blocked { reason }) => {
                tracing::warn!(user_id = %user.id, %reason, "Access guard blocked request");
                Err(AppError::Blocked(reason))
            }
        }
    }

    // ========================
    // Account operations
    // ========================

    /// Look up an account that must belong to `user`. Foreign accounts are
    /// reported as missing.
    async fn owned_account(&self, user: &User, id: AccountId) -> Result<Account, AppError> {
        self.repo
            .get_account(id)
            .await?
            .filter(|a| a.is_owned_by(user.id))
            .ok_or_else(|| AppError::AccountNotFound(id.to_string()))
    }

    /// Create a new account. A user's first account is always the default one.
    pub async fn create_account(
        &self,
        caller: &Caller,
        input: AccountInput,
    ) -> Result<AccountView, AppError> {
        let user = self.require_user(caller).await?;
        self.check_access(&user).await?;

        let name = input.name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidInput("Account name is required".to_string()));
        }
        let opening_balance = parse_cents(&input.initial_balance).map_err(|e| {
            AppError::InvalidInput(format!(
                "Invalid balance amount '{}': {}",
                input.initial_balance, e
            ))
        })?;

        let existing = self.repo.count_accounts(user.id).await?;
        let is_default = existing == 0 || input.is_default;

        let account = Account::new(user.id, name.to_string(), input.account_type, opening_balance)
            .with_default(is_default);

        let mut mutations = Vec::with_capacity(2);
        if is_default {
            mutations.push(Mutation::ClearDefaultAccounts { user_id: user.id });
        }
        mutations.push(Mutation::InsertAccount(account.clone()));
        self.repo.commit(&mutations).await?;

        tracing::info!(
            user_id = %user.id,
            account_id = %account.id,
            opening_balance,
            is_default,
            "Created account"
        );
        Ok(AccountView::from(&account))
    }

    /// List the caller's accounts, newest first, with transaction counts.
    pub async fn get_accounts_for_user(&self, caller: &Caller) -> Result<Vec<AccountView>, AppError> {
        let user = self.require_user(caller).await?;
        let accounts = self.repo.list_accounts_with_counts(user.id).await?;

        Ok(accounts
            .iter()
            .map(|(account, count)| AccountView::from(account).with_transaction_count(*count))
            .collect())
    }

    /// Get one of the caller's accounts with its transactions, newest first.
    pub async fn get_account_with_transactions(
        &self,
        caller: &Caller,
        account_id: AccountId,
    ) -> Result<AccountDetail, AppError> {
        let user = self.require_user(caller).await?;
        let account = self.owned_account(&user, account_id).await?;
        let transactions = self.repo.list_transactions_for_account(account.id).await?;

        Ok(AccountDetail {
            account: AccountView::from(&account).with_transaction_count(transactions.len() as i64),
            transactions: transactions.iter().map(TransactionView::from).collect(),
        })
    }

    /// Make one of the caller's accounts the default, clearing the others.
    pub async fn set_default_account(
        &self,
        caller: &Caller,
        account_id: AccountId,
    ) -> Result<AccountView, AppError> {
        let user = self.require_user(caller).await?;
        self.check_access(&user).await?;

        let mut account = self.owned_account(&user, account_id).await?;
        if account.is_default {
            return Ok(AccountView::from(&account));
        }

        self.repo
            .commit(&[
                Mutation::ClearDefaultAccounts { user_id: user.id },
                Mutation::SetDefaultAccount { account_id },
            ])
            .await?;

        tracing::info!(user_id = %user.id, %account_id, "Changed default account");
        account.is_default = true;
        Ok(AccountView::from(&account))
    }

    // ========================
    // Transaction operations
    // ========================

    /// Record a new transaction and move the account balance with it.
    pub async fn create_transaction(
        &self,
        caller: &Caller,
        input: TransactionInput,
    ) -> Result<TransactionView, AppError> {
        let user = self.require_user(caller).await?;
        self.check_access(&user).await?;

        let amount_cents = validate_amount(&input.amount)?;
        let category = resolve_category(input.transaction_type, input.category.as_deref())?;
        let account = self.owned_account(&user, input.account_id).await?;

        let mut transaction = Transaction::new(
            user.id,
            account.id,
            input.transaction_type,
            amount_cents,
            input.date,
        )
        .with_category(category)
        .with_recurrence(input.recurring_interval);
        transaction.description = non_blank(input.description);

        let adjustment = plan_create(&transaction);
        let new_balance = apply_delta(account.balance_cents, adjustment.delta)?;

        self.repo
            .commit(&[
                Mutation::InsertTransaction(transaction.clone()),
                Mutation::AdjustBalance {
                    account_id: adjustment.account_id,
                    delta: adjustment.delta,
                },
            ])
            .await?;

        tracing::info!(
            user_id = %user.id,
            account_id = %account.id,
            transaction_id = %transaction.id,
            delta = adjustment.delta,
            new_balance,
            "Created transaction"
        );
        Ok(TransactionView::from(&transaction))
    }

    /// Book the result of a receipt scan as an expense on `account_id`.
    pub async fn create_transaction_from_receipt(
        &self,
        caller: &Caller,
        account_id: AccountId,
        receipt: ScannedReceipt,
    ) -> Result<TransactionView, AppError> {
        self.create_transaction(caller, receipt.into_input(account_id))
            .await
    }

    /// Replace a transaction's fields and rebalance the affected accounts.
    pub async fn update_transaction(
        &self,
        caller: &Caller,
        transaction_id: TransactionId,
        input: TransactionInput,
    ) -> Result<TransactionView, AppError> {
        let user = self.require_user(caller).await?;
        let original = self.owned_transaction(&user, transaction_id).await?;
        self.check_access(&user).await?;

        let amount_cents = validate_amount(&input.amount)?;
        let category = resolve_category(input.transaction_type, input.category.as_deref())?;
        if input.account_id != original.account_id {
            self.owned_account(&user, input.account_id).await?;
        }

        let mut updated = original.clone();
        updated.account_id = input.account_id;
        updated.transaction_type = input.transaction_type;
        updated.amount_cents = amount_cents;
        updated.date = input.date;
        updated.description = non_blank(input.description);
        updated.category = category;
        updated.set_recurrence(input.recurring_interval);
        updated.updated_at = Utc::now();

        let adjustments = plan_update(&original, &updated)?;
        self.check_adjustments(&adjustments).await?;

        let mut mutations = Vec::with_capacity(1 + adjustments.len());
        mutations.push(Mutation::UpdateTransaction(updated.clone()));
        mutations.extend(adjustments.iter().map(|a| Mutation::AdjustBalance {
            account_id: a.account_id,
            delta: a.delta,
        }));
        self.repo.commit(&mutations).await?;

        tracing::info!(
            user_id = %user.id,
            %transaction_id,
            from_account = %original.account_id,
            to_account = %updated.account_id,
            adjustments = adjustments.len(),
            "Updated transaction"
        );
        Ok(TransactionView::from(&updated))
    }

    /// Look up a transaction owned by `user` both directly and through its
    /// account.
    async fn owned_transaction(
        &self,
        user: &User,
        id: TransactionId,
    ) -> Result<Transaction, AppError> {
        let not_found = || AppError::TransactionNotFound(id.to_string());

        let transaction = self
            .repo
            .get_transaction(id)
            .await?
            .filter(|t| t.user_id == user.id)
            .ok_or_else(not_found)?;

        let account_owned = self
            .repo
            .get_account(transaction.account_id)
            .await?
            .is_some_and(|a| a.is_owned_by(user.id));
        if !account_owned {
            return Err(not_found());
        }

        Ok(transaction)
    }

    /// Reject adjustments that would push a stored balance out of range.
    async fn check_adjustments(&self, adjustments: &[BalanceAdjustment]) -> Result<(), AppError> {
        for adjustment in adjustments {
            let account = self
                .repo
                .get_account(adjustment.account_id)
                .await?
                .ok_or_else(|| AppError::AccountNotFound(adjustment.account_id.to_string()))?;
            apply_delta(account.balance_cents, adjustment.delta)?;
        }
        Ok(())
    }

    /// Get a single transaction.
    pub async fn get_transaction(
        &self,
        caller: &Caller,
        transaction_id: TransactionId,
    ) -> Result<TransactionView, AppError> {
        let user = self.require_user(caller).await?;
        let transaction = self.owned_transaction(&user, transaction_id).await?;
        Ok(TransactionView::from(&transaction))
    }

    /// All of the caller's transactions, newest first by date.
    pub async fn list_transactions_for_user(
        &self,
        caller: &Caller,
    ) -> Result<Vec<TransactionView>, AppError> {
        let user = self.require_user(caller).await?;
        let transactions = self.repo.list_transactions_for_user(user.id).await?;
        Ok(transactions.iter().map(TransactionView::from).collect())
    }

    // ========================
    // Recurring transactions
    // ========================

    /// Book one occurrence for every recurring transaction of the caller that
    /// is due at `now`, advancing each schedule by one interval.
    pub async fn process_due_recurring(
        &self,
        caller: &Caller,
        now: DateTime<Utc>,
    ) -> Result<Vec<TransactionView>, AppError> {
        let user = self.require_user(caller).await?;
        let due = self.repo.list_due_recurring(user.id, now).await?;
        if due.is_empty() {
            return Ok(Vec::new());
        }
        self.check_access(&user).await?;

        let mut created = Vec::with_capacity(due.len());
        for mut template in due {
            let (Some(interval), Some(occurrence)) =
                (template.recurring_interval, template.create_occurrence())
            else {
                continue;
            };

            let adjustment = plan_create(&occurrence);
            match self.check_adjustments(&[adjustment]).await {
                Ok(()) => {}
                Err(AppError::InvalidInput(reason)) => {
                    tracing::warn!(
                        user_id = %user.id,
                        template_id = %template.id,
                        %reason,
                        "Skipped recurring transaction"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }

            template.next_recurring_date = compute_next_recurring_date(occurrence.date, interval);
            template.last_processed = Some(now);
            template.updated_at = Utc::now();
            if template.next_recurring_date.is_none() {
                tracing::warn!(
                    template_id = %template.id,
                    "Recurring schedule ran past the last representable date"
                );
            }

            self.repo
                .commit(&[
                    Mutation::InsertTransaction(occurrence.clone()),
                    Mutation::AdjustBalance {
                        account_id: adjustment.account_id,
                        delta: adjustment.delta,
                    },
                    Mutation::UpdateTransaction(template.clone()),
                ])
                .await?;

            tracing::info!(
                user_id = %user.id,
                template_id = %template.id,
                transaction_id = %occurrence.id,
                delta = adjustment.delta,
                "Booked recurring transaction"
            );
            created.push(TransactionView::from(&occurrence));
        }

        Ok(created)
    }

    // ========================
    // Integrity
    // ========================

    /// Recompute every account balance of the caller from its opening balance
    /// and transactions and compare with the stored value.
    pub async fn verify_balances(&self, caller: &Caller) -> Result<Vec<BalanceCheck>, AppError> {
        let user = self.require_user(caller).await?;
        let accounts = self.repo.list_accounts_with_counts(user.id).await?;

        let mut checks = Vec::with_capacity(accounts.len());
        for (account, _) in accounts {
            let transactions = self.repo.list_transactions_for_account(account.id).await?;
            let check = check_balance(&account, &transactions);
            if !check.is_consistent() {
                tracing::error!(
                    account_id = %account.id,
                    stored = check.stored_balance,
                    expected = check.expected_balance,
                    "Account balance does not match its transactions"
                );
            }
            checks.push(check);
        }
        Ok(checks)
    }
}

fn validate_amount(raw: &str) -> Result<Cents, AppError> {
    parse_positive_cents(raw).map_err(|e| {
        let reason = match e {
            ParseCentsError::NotPositive => "must be greater than zero".to_string(),
            other => other.to_string(),
        };
        AppError::InvalidInput(format!("Invalid amount '{}': {}", raw, reason))
    })
}

fn resolve_category(
    transaction_type: TransactionType,
    category: Option<&str>,
) -> Result<String, AppError> {
    match category.map(str::trim).filter(|c| !c.is_empty()) {
        Some(c) if categories_for(transaction_type).contains(&c) => Ok(c.to_string()),
        Some(c) => Err(AppError::InvalidInput(format!(
            "Unknown {} category '{}'",
            transaction_type.as_str().to_lowercase(),
            c
        ))),
        None => Ok(match transaction_type {
            TransactionType::Expense => "other-expense".to_string(),
            TransactionType::Income => "other-income".to_string(),
        }),
    }
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
