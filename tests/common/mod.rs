// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use expensa::application::{
    AccessGuard, AccountInput, AllowAll, Caller, DenyReason, GuardDecision, LedgerService,
    TransactionInput,
};
use expensa::domain::{AccountId, AccountType, TransactionType};
use tempfile::TempDir;
use uuid::Uuid;

/// Helper to create a test service with a temporary database
pub async fn test_service() -> Result<(LedgerService, TempDir)> {
    test_service_with_guard(Arc::new(AllowAll)).await
}

/// Same as [`test_service`] but with a specific access guard
pub async fn test_service_with_guard(
    guard: Arc<dyn AccessGuard>,
) -> Result<(LedgerService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let service = LedgerService::init(db_path.to_str().unwrap(), guard).await?;
    Ok((service, temp_dir))
}

/// Helper to parse a date string into DateTime<Utc>
pub fn parse_date(date_str: &str) -> DateTime<Utc> {
    NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
}

/// Register a user and return its caller token
pub async fn sign_in(service: &LedgerService, external_id: &str) -> Result<Caller> {
    let caller = Caller::authenticated(external_id);
    service
        .sync_user(&caller, &format!("{}@example.com", external_id), None)
        .await?;
    Ok(caller)
}

/// Create an account and return its id
pub async fn create_account(
    service: &LedgerService,
    caller: &Caller,
    name: &str,
    initial_balance: &str,
) -> Result<AccountId> {
    let account = service
        .create_account(
            caller,
            AccountInput {
                name: name.to_string(),
                account_type: AccountType::Current,
                initial_balance: initial_balance.to_string(),
                is_default: false,
            },
        )
        .await?;
    Ok(Uuid::parse_str(&account.id)?)
}

/// Stored balance of an account, in cents
pub async fn balance_of(
    service: &LedgerService,
    caller: &Caller,
    account_id: AccountId,
) -> Result<i64> {
    let detail = service.get_account_with_transactions(caller, account_id).await?;
    Ok((detail.account.balance * 100.0).round() as i64)
}

/// Stored balance of an account, in cents, read without going through the
/// floating point transport view
pub async fn stored_balance(
    service: &LedgerService,
    caller: &Caller,
    account_id: AccountId,
) -> Result<i64> {
    let check = service
        .verify_balances(caller)
        .await?
        .into_iter()
        .find(|c| c.account_id == account_id)
        .ok_or_else(|| anyhow::anyhow!("no balance check for {}", account_id))?;
    Ok(check.stored_balance)
}

pub fn expense(account_id: AccountId, amount: &str, date: &str) -> TransactionInput {
    entry(account_id, TransactionType::Expense, amount, date)
}

pub fn income(account_id: AccountId, amount: &str, date: &str) -> TransactionInput {
    entry(account_id, TransactionType::Income, amount, date)
}

fn entry(
    account_id: AccountId,
    transaction_type: TransactionType,
    amount: &str,
    date: &str,
) -> TransactionInput {
    TransactionInput {
        account_id,
        transaction_type,
        amount: amount.to_string(),
        date: parse_date(date),
        description: None,
        category: None,
        recurring_interval: None,
    }
}

/// Allows the first `allowed` requests, then rate limits.
pub struct QuotaGuard {
    allowed: u32,
    used: AtomicU32,
}

impl QuotaGuard {
    pub fn new(allowed: u32) -> Self {
        Self {
            allowed,
            used: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl AccessGuard for QuotaGuard {
    async fn protect(&self, _subject: &str, requested: u32) -> Result<GuardDecision> {
        let used = self.used.fetch_add(requested, Ordering::SeqCst) + requested;
        if used <= self.allowed {
            Ok(GuardDecision::Allow)
        } else {
            Ok(GuardDecision::Deny(DenyReason::RateLimit {
                remaining: 0,
                reset_in_seconds: Some(60),
            }))
        }
    }
}

/// Never answers.
pub struct StalledGuard;

#[async_trait]
impl AccessGuard for StalledGuard {
    async fn protect(&self, _subject: &str, _requested: u32) -> Result<GuardDecision> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(GuardDecision::Allow)
    }
}

/// Always fails to reach its backend.
pub struct BrokenGuard;

#[async_trait]
impl AccessGuard for BrokenGuard {
    async fn protect(&self, _subject: &str, _requested: u32) -> Result<GuardDecision> {
        anyhow::bail!("connection refused")
    }
}
