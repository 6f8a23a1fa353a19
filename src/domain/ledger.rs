use std::fmt;

use serde::Serialize;

use super::{Account, AccountId, Cents, Transaction};

/// A change to apply to one account's stored balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceAdjustment {
    pub account_id: AccountId,
    pub delta: Cents,
}

/// Balance movement caused by booking a new transaction.
pub fn plan_create(transaction: &Transaction) -> BalanceAdjustment {
    BalanceAdjustment {
        account_id: transaction.account_id,
        delta: transaction.signed_amount(),
    }
}

/// Balance movements caused by replacing `original` with `updated`.
///
/// When the account is unchanged the net difference is applied to it. When the
/// transaction moves to another account the original account gets the old
/// signed amount reversed and the new account gets the new signed amount;
/// a single net delta would leave both balances wrong.
pub fn plan_update(
    original: &Transaction,
    updated: &Transaction,
) -> Result<Vec<BalanceAdjustment>, BalanceOverflow> {
    let old_signed = original.signed_amount();
    let new_signed = updated.signed_amount();

    if original.account_id == updated.account_id {
        let net_change = new_signed.checked_sub(old_signed).ok_or(BalanceOverflow)?;
        if net_change == 0 {
            return Ok(Vec::new());
        }
        return Ok(vec![BalanceAdjustment {
            account_id: updated.account_id,
            delta: net_change,
        }]);
    }

    Ok(vec![
        BalanceAdjustment {
            account_id: original.account_id,
            delta: -old_signed,
        },
        BalanceAdjustment {
            account_id: updated.account_id,
            delta: new_signed,
        },
    ])
}

/// The balance after applying `delta`, or an error if it does not fit.
pub fn apply_delta(balance: Cents, delta: Cents) -> Result<Cents, BalanceOverflow> {
    balance.checked_add(delta).ok_or(BalanceOverflow)
}

/// Compute what an account's balance should be from its opening balance and
/// the transactions booked against it. Transactions for other accounts are
/// ignored.
///
/// Summed in `i128` so the order of entries cannot cause an intermediate
/// overflow; `None` if the total does not fit in a balance.
pub fn compute_balance(account: &Account, transactions: &[Transaction]) -> Option<Cents> {
    let total = transactions
        .iter()
        .filter(|t| t.account_id == account.id)
        .fold(i128::from(account.opening_balance_cents), |balance, t| {
            balance + i128::from(t.signed_amount())
        });
    Cents::try_from(total).ok()
}

/// A balance change that would leave `i64` cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceOverflow;

impl fmt::Display for BalanceOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "amount would overflow the account balance")
    }
}

impl std::error::Error for BalanceOverflow {}

/// Result of comparing a stored balance with the recomputed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceCheck {
    pub account_id: AccountId,
    pub account_name: String,
    pub stored_balance: Cents,
    /// `None` when the transactions sum past the representable range
    pub expected_balance: Option<Cents>,
}

impl BalanceCheck {
    pub fn is_consistent(&self) -> bool {
        self.expected_balance == Some(self.stored_balance)
    }

    pub fn discrepancy(&self) -> Option<Cents> {
        self.stored_balance.checked_sub(self.expected_balance?)
    }
}

pub fn check_balance(account: &Account, transactions: &[Transaction]) -> BalanceCheck {
    BalanceCheck {
        account_id: account.id,
        account_name: account.name.clone(),
        stored_balance: account.balance_cents,
        expected_balance: compute_balance(account, transactions),
    }
}
