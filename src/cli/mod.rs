use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use crate::application::{
    AccountInput, AccountView, Caller, LedgerConfig, LedgerService, TokenBucketGuard,
    TransactionInput, TransactionView,
};
use crate::domain::{
    cents_from_f64, compute_next_recurring_date, format_cents, AccountType, RecurringInterval,
    TransactionType,
};
use crate::extraction::{GeminiExtractor, ReceiptScanner, DEFAULT_GEMINI_MODEL};

/// Expensa - Expense Ledger
#[derive(Parser)]
#[command(name = "expensa")]
#[command(about = "A balance-consistent expense ledger with receipt scanning")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(short, long, env = "EXPENSA_DB", default_value = "expensa.db")]
    pub database: String,

    /// Identity provider subject of the signed-in user
    #[arg(short, long, env = "EXPENSA_USER", global = true)]
    pub user: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Mutating requests allowed per user per rate window
    #[arg(long, default_value_t = 10)]
    pub rate_limit: u32,

    /// Length of the rate window in seconds
    #[arg(long, default_value_t = 3600)]
    pub rate_window: u64,

    /// Timeout in seconds for calls to external services
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// User management commands
    #[command(subcommand)]
    User(UserCommands),

    /// Account management commands
    #[command(subcommand)]
    Account(AccountCommands),

    /// Transaction commands
    #[command(subcommand)]
    Tx(TransactionCommands),

    /// Read a receipt image and book it as an expense
    Scan {
        /// Path to the receipt image
        image: String,

        /// Account to book the expense on (defaults to the default account)
        #[arg(short, long)]
        account: Option<String>,

        /// MIME type of the image (guessed from the extension when omitted)
        #[arg(long)]
        mime: Option<String>,

        /// Only show what was read, don't record anything
        #[arg(long)]
        dry_run: bool,

        /// Gemini API key
        #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Gemini model name
        #[arg(long, default_value = DEFAULT_GEMINI_MODEL)]
        model: String,
    },

    /// Recurring transaction commands
    #[command(subcommand)]
    Recurring(RecurringCommands),

    /// Verify that stored balances match the transactions
    Check,

    /// Show when a recurring transaction dated DATE would next be due
    NextDate {
        /// Base date (YYYY-MM-DD)
        date: String,

        /// Recurrence interval: DAILY, WEEKLY, MONTHLY, YEARLY
        interval: RecurringInterval,
    },
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Register the current user on first sign-in (no-op afterwards)
    Sync {
        /// Email address
        email: String,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum AccountCommands {
    /// Create a new account
    Create {
        /// Account name
        name: String,

        /// Account type: current, savings
        #[arg(short = 't', long = "type", default_value = "current")]
        account_type: String,

        /// Opening balance (e.g., "1500.00", may be negative)
        #[arg(short, long, default_value = "0", allow_hyphen_values = true)]
        balance: String,

        /// Make this the default account
        #[arg(long)]
        default: bool,
    },

    /// List accounts
    List,

    /// Show an account with its transactions
    Show {
        /// Account ID
        id: String,
    },

    /// Make an account the default one
    SetDefault {
        /// Account ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum TransactionCommands {
    /// Record a new transaction
    Create(TransactionArgs),

    /// Replace the fields of an existing transaction
    Update {
        /// Transaction ID
        id: String,

        #[command(flatten)]
        fields: TransactionArgs,
    },

    /// Show a single transaction
    Show {
        /// Transaction ID
        id: String,
    },

    /// List all transactions, newest first
    List {
        /// Maximum number of transactions to show
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[derive(Args)]
pub struct TransactionArgs {
    /// Amount (e.g., "42.50")
    #[arg(allow_hyphen_values = true)]
    pub amount: String,

    /// Account ID
    #[arg(short, long)]
    pub account: String,

    /// Transaction type: expense, income
    #[arg(short = 't', long = "type", default_value = "expense")]
    pub transaction_type: String,

    /// Date of the transaction (YYYY-MM-DD, defaults to now)
    #[arg(long)]
    pub date: Option<String>,

    /// Description
    #[arg(short, long)]
    pub description: Option<String>,

    /// Category (e.g., "groceries", "salary")
    #[arg(short, long)]
    pub category: Option<String>,

    /// Repeat every DAILY, WEEKLY, MONTHLY or YEARLY
    #[arg(short, long)]
    pub recurring: Option<RecurringInterval>,
}

#[derive(Subcommand)]
pub enum RecurringCommands {
    /// Book every recurring transaction that is due now
    Process,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let caller = Caller::from(self.user.clone());

        match self.command {
            Commands::Init => {
                self.open_service().await?;
                println!("Database initialized: {}", self.database);
            }

            Commands::NextDate { ref date, interval } => {
                let base = parse_date(date)?;
                let next = compute_next_recurring_date(base, interval)
                    .context("Next date is past the last supported date")?;
                if self.json {
                    print_json(&next)?;
                } else {
                    println!("{}", next.format("%Y-%m-%d"));
                }
            }

            Commands::User(UserCommands::Sync {
                ref email,
                ref name,
            }) => {
                let service = self.open_service().await?;
                let user = service.sync_user(&caller, email, name.clone()).await?;
                if self.json {
                    print_json(&user)?;
                } else {
                    println!("User: {} ({})", user.email, user.id);
                }
            }

            Commands::Account(ref cmd) => {
                let service = self.open_service().await?;
                run_account_command(&service, &caller, cmd, self.json).await?;
            }

            Commands::Tx(ref cmd) => {
                let service = self.open_service().await?;
                run_transaction_command(&service, &caller, cmd, self.json).await?;
            }

            Commands::Scan {
                ref image,
                ref account,
                ref mime,
                dry_run,
                ref api_key,
                ref model,
            } => {
                let service = self.open_service().await?;
                let extractor = GeminiExtractor::new(api_key.clone(), model.clone());
                let scanner = ReceiptScanner::new(Arc::new(extractor), self.external_timeout());

                let mime_type = match mime {
                    Some(m) => m.clone(),
                    None => guess_mime_type(image)?,
                };
                let bytes = tokio::fs::read(image)
                    .await
                    .with_context(|| format!("Failed to read receipt image '{}'", image))?;

                let receipt = scanner.scan(&bytes, &mime_type).await?;
                if dry_run {
                    if self.json {
                        print_json(&receipt)?;
                    } else {
                        println!("Amount:      {:.2}", receipt.amount);
                        println!("Date:        {}", receipt.date.format("%Y-%m-%d"));
                        println!("Merchant:    {}", receipt.merchant_name.as_deref().unwrap_or("-"));
                        println!("Description: {}", receipt.description.as_deref().unwrap_or("-"));
                        println!("Category:    {}", receipt.category);
                    }
                    return Ok(());
                }

                let account_id = match account {
                    Some(id) => parse_id(id, "account")?,
                    None => default_account_id(&service, &caller).await?,
                };
                let tx = service
                    .create_transaction_from_receipt(&caller, account_id, receipt)
                    .await?;
                if self.json {
                    print_json(&tx)?;
                } else {
                    println!(
                        "Recorded expense: {} on {} ({})",
                        format_amount(tx.amount),
                        tx.date.format("%Y-%m-%d"),
                        tx.id
                    );
                }
            }

            Commands::Recurring(RecurringCommands::Process) => {
                let service = self.open_service().await?;
                let created = service.process_due_recurring(&caller, Utc::now()).await?;
                if self.json {
                    print_json(&created)?;
                } else if created.is_empty() {
                    println!("No recurring transactions due.");
                } else {
                    println!("Booked {} recurring transaction(s):", created.len());
                    print_transactions(&created);
                }
            }

            Commands::Check => {
                let service = self.open_service().await?;
                run_check_command(&service, &caller, self.json).await?;
            }
        }

        Ok(())
    }

    async fn open_service(&self) -> Result<LedgerService> {
        let window = Duration::from_secs(self.rate_window);
        let guard = TokenBucketGuard::new(self.rate_limit, self.rate_limit, window);
        let config = LedgerConfig {
            guard_timeout: self.external_timeout(),
            ..LedgerConfig::default()
        };

        let service = LedgerService::init(&self.database, Arc::new(guard))
            .await
            .with_context(|| format!("Failed to open database '{}'", self.database))?;
        Ok(service.with_config(config))
    }

    fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

async fn run_account_command(
    service: &LedgerService,
    caller: &Caller,
    cmd: &AccountCommands,
    json: bool,
) -> Result<()> {
    match cmd {
        AccountCommands::Create {
            name,
            account_type,
            balance,
            default,
        } => {
            let account_type = AccountType::from_str(account_type).with_context(|| {
                format!(
                    "Invalid account type '{}'. Use 'current' or 'savings'",
                    account_type
                )
            })?;

            let account = service
                .create_account(
                    caller,
                    AccountInput {
                        name: name.clone(),
                        account_type,
                        initial_balance: balance.clone(),
                        is_default: *default,
                    },
                )
                .await?;

            if json {
                print_json(&account)?;
            } else {
                println!(
                    "Created account: {} ({}){}",
                    account.name,
                    account.id,
                    if account.is_default { " [default]" } else { "" }
                );
            }
        }

        AccountCommands::List => {
            let accounts = service.get_accounts_for_user(caller).await?;
            if json {
                print_json(&accounts)?;
            } else if accounts.is_empty() {
                println!("No accounts found.");
            } else {
                print_accounts(&accounts);
            }
        }

        AccountCommands::Show { id } => {
            let detail = service
                .get_account_with_transactions(caller, parse_id(id, "account")?)
                .await?;
            if json {
                print_json(&detail)?;
            } else {
                let account = &detail.account;
                println!("Account: {}", account.name);
                println!("  ID:      {}", account.id);
                println!("  Type:    {}", account.account_type);
                println!("  Balance: {}", format_amount(account.balance));
                println!("  Default: {}", if account.is_default { "yes" } else { "no" });
                println!();
                if detail.transactions.is_empty() {
                    println!("No transactions.");
                } else {
                    print_transactions(&detail.transactions);
                }
            }
        }

        AccountCommands::SetDefault { id } => {
            let account = service
                .set_default_account(caller, parse_id(id, "account")?)
                .await?;
            if json {
                print_json(&account)?;
            } else {
                println!("Default account: {} ({})", account.name, account.id);
            }
        }
    }
    Ok(())
}

async fn run_transaction_command(
    service: &LedgerService,
    caller: &Caller,
    cmd: &TransactionCommands,
    json: bool,
) -> Result<()> {
    match cmd {
        TransactionCommands::Create(fields) => {
            let tx = service.create_transaction(caller, fields.to_input()?).await?;
            if json {
                print_json(&tx)?;
            } else {
                println!(
                    "Recorded {}: {} [{}] ({})",
                    tx.transaction_type.as_str().to_lowercase(),
                    format_amount(tx.amount),
                    tx.category,
                    tx.id
                );
            }
        }

        TransactionCommands::Update { id, fields } => {
            let tx = service
                .update_transaction(caller, parse_id(id, "transaction")?, fields.to_input()?)
                .await?;
            if json {
                print_json(&tx)?;
            } else {
                println!("Updated transaction: {}", tx.id);
            }
        }

        TransactionCommands::Show { id } => {
            let tx = service
                .get_transaction(caller, parse_id(id, "transaction")?)
                .await?;
            if json {
                print_json(&tx)?;
            } else {
                print_transaction_detail(&tx);
            }
        }

        TransactionCommands::List { limit } => {
            let mut transactions = service.list_transactions_for_user(caller).await?;
            if let Some(limit) = limit {
                transactions.truncate(*limit);
            }
            if json {
                print_json(&transactions)?;
            } else if transactions.is_empty() {
                println!("No transactions found.");
            } else {
                print_transactions(&transactions);
            }
        }
    }
    Ok(())
}

async fn run_check_command(service: &LedgerService, caller: &Caller, json: bool) -> Result<()> {
    let checks = service.verify_balances(caller).await?;
    let inconsistent = checks.iter().filter(|c| !c.is_consistent()).count();

    if json {
        print_json(&checks)?;
    } else {
        println!("Checking account balances...\n");
        println!(
            "{:<20} {:>12} {:>12}  STATUS",
            "ACCOUNT", "STORED", "EXPECTED"
        );
        println!("{}", "-".repeat(56));
        for check in &checks {
            println!(
                "{:<20} {:>12} {:>12}  {}",
                truncate(&check.account_name, 20),
                format_cents(check.stored_balance),
                check
                    .expected_balance
                    .map(format_cents)
                    .unwrap_or_else(|| "OVERFLOW".to_string()),
                match (check.is_consistent(), check.discrepancy()) {
                    (true, _) => "OK".to_string(),
                    (false, Some(off)) => format!("OFF BY {}", format_cents(off)),
                    (false, None) => "OUT OF RANGE".to_string(),
                }
            );
        }
        println!();
    }

    if inconsistent > 0 {
        anyhow::bail!("{} account(s) have inconsistent balances", inconsistent);
    }
    if !json {
        println!("All balances are consistent.");
    }
    Ok(())
}

impl TransactionArgs {
    fn to_input(&self) -> Result<TransactionInput> {
        let transaction_type =
            TransactionType::from_str(&self.transaction_type).with_context(|| {
                format!(
                    "Invalid transaction type '{}'. Use 'expense' or 'income'",
                    self.transaction_type
                )
            })?;

        let date = match &self.date {
            Some(date_str) => parse_date(date_str).with_context(|| {
                format!("Invalid date format '{}'. Use YYYY-MM-DD", date_str)
            })?,
            None => Utc::now(),
        };

        Ok(TransactionInput {
            account_id: parse_id(&self.account, "account")?,
            transaction_type,
            amount: self.amount.clone(),
            date,
            description: self.description.clone(),
            category: self.category.clone(),
            recurring_interval: self.recurring,
        })
    }
}

async fn default_account_id(service: &LedgerService, caller: &Caller) -> Result<Uuid> {
    let accounts = service.get_accounts_for_user(caller).await?;
    let account = accounts
        .iter()
        .find(|a| a.is_default)
        .context("No default account. Create an account or pass --account")?;
    parse_id(&account.id, "account")
}

fn print_accounts(accounts: &[AccountView]) {
    println!(
        "{:<36}  {:<20} {:<8} {:>12} {:>6}",
        "ID", "NAME", "TYPE", "BALANCE", "TXS"
    );
    println!("{}", "-".repeat(88));
    for account in accounts {
        println!(
            "{:<36}  {:<20} {:<8} {:>12} {:>6}{}",
            account.id,
            truncate(&account.name, 20),
            account.account_type,
            format_amount(account.balance),
            account.transaction_count.unwrap_or(0),
            if account.is_default { "  *" } else { "" }
        );
    }
}

fn print_transactions(transactions: &[TransactionView]) {
    println!(
        "{:<12} {:<8} {:>10} {:<15} {:<10} DESCRIPTION",
        "DATE", "TYPE", "AMOUNT", "CATEGORY", "REPEATS"
    );
    println!("{}", "-".repeat(80));
    for tx in transactions {
        println!(
            "{:<12} {:<8} {:>10} {:<15} {:<10} {}",
            tx.date.format("%Y-%m-%d"),
            tx.transaction_type,
            format_amount(tx.amount),
            truncate(&tx.category, 15),
            tx.recurring_interval.map(|i| i.as_str()).unwrap_or("-"),
            truncate(tx.description.as_deref().unwrap_or(""), 30)
        );
    }
}

fn print_transaction_detail(tx: &TransactionView) {
    println!("Transaction: {}", tx.id);
    println!("  Date:        {}", tx.date.format("%Y-%m-%d"));
    println!("  Type:        {}", tx.transaction_type);
    println!("  Amount:      {}", format_amount(tx.amount));
    println!("  Account:     {}", tx.account_id);
    println!("  Category:    {}", tx.category);
    if let Some(desc) = &tx.description {
        println!("  Description: {}", desc);
    }
    if let Some(interval) = tx.recurring_interval {
        println!("  Repeats:     {}", interval);
        if let Some(next) = tx.next_recurring_date {
            println!("  Next due:    {}", next.format("%Y-%m-%d"));
        }
        if let Some(last) = tx.last_processed {
            println!("  Last booked: {}", last.format("%Y-%m-%d %H:%M:%S"));
        }
    }
    println!("  Recorded at: {}", tx.created_at.format("%Y-%m-%d %H:%M:%S"));
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_amount(amount: f64) -> String {
    match cents_from_f64(amount) {
        Some(cents) => format_cents(cents),
        None => format!("{:.2}", amount),
    }
}

fn guess_mime_type(path: &str) -> Result<String> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    let mime = match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("heic") => "image/heic",
        _ => anyhow::bail!("Cannot guess the image type of '{}'. Pass --mime", path),
    };
    Ok(mime.to_string())
}

fn parse_id(s: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(s.trim()).with_context(|| format!("Invalid {} ID '{}'", what, s))
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    use chrono::NaiveDate;

    // Parse YYYY-MM-DD format
    let naive_date = NaiveDate::parse_from_str(date_str.trim(), "%Y-%m-%d")
        .context("Date must be in YYYY-MM-DD format")?;

    // Convert to UTC datetime at midnight
    let naive_datetime = naive_date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow::anyhow!("Invalid date"))?;

    Ok(DateTime::from_naive_utc_and_offset(naive_datetime, Utc))
}
