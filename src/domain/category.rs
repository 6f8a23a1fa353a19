use super::TransactionType;

/// Expense categories a scanned receipt may be filed under.
pub const EXPENSE_CATEGORIES: [&str; 15] = [
    "housing",
    "transportation",
    "groceries",
    "utilities",
    "entertainment",
    "food",
    "shopping",
    "healthcare",
    "education",
    "personal",
    "travel",
    "insurance",
    "gifts",
    "bills",
    "other-expense",
];

/// Categories available for manually entered income.
pub const INCOME_CATEGORIES: [&str; 6] = [
    "salary",
    "freelance",
    "investments",
    "business",
    "rental",
    "other-income",
];

pub const FALLBACK_EXPENSE_CATEGORY: &str = "other-expense";

/// Map free-form category text onto the closed expense set.
/// Anything unrecognised lands in `other-expense`.
pub fn normalize_expense_category(raw: Option<&str>) -> &'static str {
    let Some(raw) = raw else {
        return FALLBACK_EXPENSE_CATEGORY;
    };
    let wanted = raw.trim().to_lowercase().replace([' ', '_'], "-");
    EXPENSE_CATEGORIES
        .iter()
        .copied()
        .find(|c| *c == wanted)
        .unwrap_or(FALLBACK_EXPENSE_CATEGORY)
}

/// The categories a transaction of the given type may be filed under.
pub fn categories_for(transaction_type: TransactionType) -> &'static [&'static str] {
    match transaction_type {
        TransactionType::Expense => &EXPENSE_CATEGORIES,
        TransactionType::Income => &INCOME_CATEGORIES,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_categories_pass_through() {
        assert_eq!(normalize_expense_category(Some("groceries")), "groceries");
        assert_eq!(normalize_expense_category(Some(" Food ")), "food");
        assert_eq!(normalize_expense_category(Some("Other Expense")), "other-expense");
    }

    #[test]
    fn test_unknown_categories_fall_back() {
        assert_eq!(normalize_expense_category(Some("crypto")), "other-expense");
        assert_eq!(normalize_expense_category(Some("")), "other-expense");
        assert_eq!(normalize_expense_category(None), "other-expense");
    }

    #[test]
    fn test_categories_are_split_by_type() {
        let income = categories_for(TransactionType::Income);
        let expense = categories_for(TransactionType::Expense);
        assert!(income.contains(&"salary"));
        assert!(!income.contains(&"bills"));
        assert!(expense.contains(&"bills"));
        assert!(!expense.contains(&"salary"));
        assert!(!expense.contains(&"lottery") && !income.contains(&"lottery"));
    }
}
