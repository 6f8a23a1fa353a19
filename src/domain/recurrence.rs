use chrono::{DateTime, Months, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// How often a recurring transaction repeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecurringInterval {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RecurringInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurringInterval::Daily => "DAILY",
            RecurringInterval::Weekly => "WEEKLY",
            RecurringInterval::Monthly => "MONTHLY",
            RecurringInterval::Yearly => "YEARLY",
        }
    }
}

impl std::str::FromStr for RecurringInterval {
    type Err = UnknownInterval;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DAILY" => Ok(RecurringInterval::Daily),
            "WEEKLY" => Ok(RecurringInterval::Weekly),
            "MONTHLY" => Ok(RecurringInterval::Monthly),
            "YEARLY" => Ok(RecurringInterval::Yearly),
            _ => Err(UnknownInterval(s.to_string())),
        }
    }
}

impl std::fmt::Display for RecurringInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownInterval(pub String);

impl std::fmt::Display for UnknownInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unknown recurring interval '{}' (expected DAILY, WEEKLY, MONTHLY or YEARLY)",
            self.0
        )
    }
}

impl std::error::Error for UnknownInterval {}

/// Compute the date a recurring transaction is next due.
///
/// Months and years are calendar arithmetic: the day of month is kept when it
/// exists in the target month and clamped to the month's last day otherwise
/// (Jan 31 -> Feb 28/29, Feb 29 -> Feb 28 of a common year). Time of day is
/// preserved. Returns `None` past the last date chrono can represent.
pub fn compute_next_recurring_date(
    base: DateTime<Utc>,
    interval: RecurringInterval,
) -> Option<DateTime<Utc>> {
    match interval {
        RecurringInterval::Daily => base.checked_add_signed(TimeDelta::days(1)),
        RecurringInterval::Weekly => base.checked_add_signed(TimeDelta::weeks(1)),
        RecurringInterval::Monthly => base.checked_add_months(Months::new(1)),
        RecurringInterval::Yearly => base.checked_add_months(Months::new(12)),
    }
}
