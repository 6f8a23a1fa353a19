//! Receipt scanning on top of an external document extraction model.
//!
//! The model is asked for a single JSON object. Its answer is treated as
//! untrusted text: wrapping code fences are stripped, the object shape is
//! checked, and numbers are coerced before anything reaches the ledger, which
//! validates the result again like any user entry.

mod gemini;

pub use gemini::*;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::application::{AppError, TransactionInput};
use crate::domain::{normalize_expense_category, AccountId, TransactionType};

pub const RECEIPT_PROMPT: &str = r#"Analyze this receipt image and extract the following information in JSON format:
- Total amount (just the number)
- Date (in ISO format)
- Description or items purchased (brief summary)
- Merchant/store name
- Suggested category (one of: housing,transportation,groceries,utilities,entertainment,food,shopping,healthcare,education,personal,travel,insurance,gifts,bills,other-expense)

Only respond with valid JSON in this exact format:
{
  "amount": number,
  "date": "ISO date string",
  "description": "string",
  "merchantName": "string",
  "category": "string"
}

If it's not a receipt, return an empty object."#;

/// An image-to-text model. Returns the raw text of the model's answer.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn generate(&self, image: &[u8], mime_type: &str, prompt: &str) -> Result<String>;
}

/// Best-effort transaction fields read from a receipt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedReceipt {
    pub amount: f64,
    pub date: DateTime<Utc>,
    pub description: Option<String>,
    pub merchant_name: Option<String>,
    /// Always one of the expense categories
    pub category: String,
}

impl ScannedReceipt {
    /// Turn the scan into an expense entry for `account_id`. The amount is
    /// passed on as text so the ledger applies its usual validation.
    pub fn into_input(self, account_id: AccountId) -> TransactionInput {
        let description = match (self.description, self.merchant_name) {
            (Some(d), Some(m)) => Some(format!("{} ({})", d, m)),
            (Some(d), None) => Some(d),
            (None, m) => m,
        };

        TransactionInput {
            account_id,
            transaction_type: TransactionType::Expense,
            amount: self.amount.to_string(),
            date: self.date,
            description,
            category: Some(self.category),
            recurring_interval: None,
        }
    }
}

/// Wraps a [`DocumentExtractor`] with the receipt prompt, a deadline and
/// response validation.
#[derive(Clone)]
pub struct ReceiptScanner {
    extractor: Arc<dyn DocumentExtractor>,
    timeout: Duration,
}

impl ReceiptScanner {
    pub fn new(extractor: Arc<dyn DocumentExtractor>, timeout: Duration) -> Self {
        Self { extractor, timeout }
    }

    pub async fn scan(&self, image: &[u8], mime_type: &str) -> Result<ScannedReceipt, AppError> {
        if image.is_empty() {
            return Err(AppError::InvalidInput("Receipt image is empty".to_string()));
        }
        if !mime_type.starts_with("image/") {
            return Err(AppError::InvalidInput(format!(
                "Unsupported receipt type '{}'",
                mime_type
            )));
        }

        let text = tokio::time::timeout(
            self.timeout,
            self.extractor.generate(image, mime_type, RECEIPT_PROMPT),
        )
        .await
        .map_err(|_| {
            AppError::ExtractionFailed(format!("model did not answer within {:?}", self.timeout))
        })?
        .map_err(|e| AppError::ExtractionFailed(format!("{:#}", e)))?;

        let receipt = parse_receipt_response(&text);
        match &receipt {
            Ok(r) => tracing::info!(amount = r.amount, category = %r.category, "Scanned receipt"),
            Err(e) => tracing::warn!(error = %e, "Could not parse receipt scan"),
        }
        receipt
    }
}

/// Remove markdown code fences (```` ``` ```` and ```` ```json ````) the
/// model tends to wrap its answer in.
pub fn strip_code_fences(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find("```") {
        cleaned.push_str(&rest[..pos]);
        rest = &rest[pos + 3..];
        rest = rest
            .strip_prefix("json")
            .or_else(|| rest.strip_prefix("JSON"))
            .unwrap_or(rest);
        rest = rest.strip_prefix('\n').unwrap_or(rest);
    }
    cleaned.push_str(rest);

    cleaned.trim().to_string()
}

#[derive(Deserialize)]
struct RawReceipt {
    amount: Option<Value>,
    date: Option<String>,
    description: Option<String>,
    #[serde(rename = "merchantName")]
    merchant_name: Option<String>,
    category: Option<String>,
}

/// Parse the model's answer into a [`ScannedReceipt`].
pub fn parse_receipt_response(text: &str) -> Result<ScannedReceipt, AppError> {
    let cleaned = strip_code_fences(text);
    let value: Value = serde_json::from_str(&cleaned)
        .map_err(|e| AppError::ExtractionFailed(format!("response is not JSON: {}", e)))?;

    let is_empty_object = match &value {
        Value::Object(map) => map.is_empty(),
        _ => {
            return Err(AppError::ExtractionFailed(
                "response is not a JSON object".to_string(),
            ));
        }
    };
    if is_empty_object {
        return Err(AppError::ExtractionFailed(
            "image does not look like a receipt".to_string(),
        ));
    }

    let raw: RawReceipt = serde_json::from_value(value)
        .map_err(|e| AppError::ExtractionFailed(format!("unexpected response shape: {}", e)))?;

    let amount = raw
        .amount
        .as_ref()
        .and_then(coerce_number)
        .ok_or_else(|| AppError::ExtractionFailed("amount is not a number".to_string()))?;

    let date = raw
        .date
        .as_deref()
        .and_then(parse_receipt_date)
        .ok_or_else(|| AppError::ExtractionFailed("date is missing or invalid".to_string()))?;

    Ok(ScannedReceipt {
        amount,
        date,
        description: non_blank(raw.description),
        merchant_name: non_blank(raw.merchant_name),
        category: normalize_expense_category(raw.category.as_deref()).to_string(),
    })
}

fn coerce_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_start_matches(['$', '€', '£']).parse().ok()?,
        _ => return None,
    };
    number.is_finite().then_some(number)
}

fn parse_receipt_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```  "), "{}");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn test_parse_fenced_receipt() {
        let text = r#"```json
{
  "amount": 42.35,
  "date": "2024-05-03T00:00:00.000Z",
  "description": "Weekly shop",
  "merchantName": "Fresh Market",
  "category": "groceries"
}
```"#;
        let receipt = parse_receipt_response(text).unwrap();
        assert_eq!(receipt.amount, 42.35);
        assert_eq!(receipt.date.date_naive().to_string(), "2024-05-03");
        assert_eq!(receipt.merchant_name.as_deref(), Some("Fresh Market"));
        assert_eq!(receipt.category, "groceries");
    }

    #[test]
    fn test_amount_string_is_coerced() {
        let text = r#"{"amount": "$12.50", "date": "2024-05-03", "category": "dining out"}"#;
        let receipt = parse_receipt_response(text).unwrap();
        assert_eq!(receipt.amount, 12.5);
        assert_eq!(receipt.category, "other-expense");
        assert_eq!(receipt.description, None);
    }

    #[test]
    fn test_non_json_fails() {
        let err = parse_receipt_response("Sorry, I can't read that image.").unwrap_err();
        assert!(matches!(err, AppError::ExtractionFailed(_)));
    }

    #[test]
    fn test_wrong_shapes_fail() {
        for text in [
            "[1, 2, 3]",
            "{}",
            r#"{"amount": "twelve", "date": "2024-05-03"}"#,
            r#"{"amount": 12, "date": "yesterday"}"#,
            r#"{"amount": 12, "date": "2024-05-03", "description": 5}"#,
        ] {
            assert!(
                matches!(parse_receipt_response(text), Err(AppError::ExtractionFailed(_))),
                "expected failure for {}",
                text
            );
        }
    }

    #[test]
    fn test_into_input_merges_merchant() {
        let receipt = ScannedReceipt {
            amount: 9.99,
            date: Utc::now(),
            description: Some("Lunch".into()),
            merchant_name: Some("Cafe".into()),
            category: "food".into(),
        };
        let account_id = uuid::Uuid::new_v4();
        let input = receipt.into_input(account_id);
        assert_eq!(input.amount, "9.99");
        assert_eq!(input.description.as_deref(), Some("Lunch (Cafe)"));
        assert_eq!(input.transaction_type, TransactionType::Expense);
        assert_eq!(input.account_id, account_id);
    }

    struct FixedText(&'static str);

    #[async_trait]
    impl DocumentExtractor for FixedText {
        async fn generate(&self, _image: &[u8], _mime: &str, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Stalled;

    #[async_trait]
    impl DocumentExtractor for Stalled {
        async fn generate(&self, _image: &[u8], _mime: &str, _prompt: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_scanner_validates_request() {
        let scanner = ReceiptScanner::new(Arc::new(FixedText("{}")), Duration::from_secs(5));
        assert!(matches!(
            scanner.scan(&[], "image/png").await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            scanner.scan(b"%PDF", "application/pdf").await,
            Err(AppError::InvalidInput(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanner_times_out() {
        let scanner = ReceiptScanner::new(Arc::new(Stalled), Duration::from_secs(10));
        let err = scanner.scan(b"\x89PNG", "image/png").await.unwrap_err();
        assert!(matches!(err, AppError::ExtractionFailed(_)));
    }
}
