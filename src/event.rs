//! Payment outcome events: the unit of transport.
//!
//! An [`OutcomeEvent`] is produced by whatever processed a payment attempt,
//! validated at construction and again before it is published. The wire
//! format is a camelCase JSON object.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Errors raised when an outcome event violates its invariants.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventError {
    #[error("Order ID must not be empty")]
    MissingOrderId,

    #[error("Amount must be greater than zero, got {0}")]
    NonPositiveAmount(Decimal),

    #[error("Currency must not be empty")]
    MissingCurrency,

    #[error("Validation failed for {method} payment: {field} must not be empty")]
    MissingMethodField {
        method: PaymentMethod,
        field: &'static str,
    },

    #[error("SUCCESS outcome requires a transaction ID")]
    MissingTransactionId,
}

/// Payment method used for the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    CreditCard,
    Paypal,
    BankTransfer,
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PaymentMethod::CreditCard => "CREDIT_CARD",
            PaymentMethod::Paypal => "PAYPAL",
            PaymentMethod::BankTransfer => "BANK_TRANSFER",
        };
        f.write_str(s)
    }
}

/// Terminal status of a payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Success,
    Failed,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentStatus::Success => f.write_str("SUCCESS"),
            PaymentStatus::Failed => f.write_str("FAILED"),
        }
    }
}

/// Method-specific fields. Card and bank numbers are stored masked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_expiry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paypal_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_name: Option<String>,
}

impl MethodDetails {
    /// Credit card details. The number is masked to its last four digits.
    pub fn card(number: &str, expiry: impl Into<String>) -> Self {
        Self {
            card_number: Some(mask_digits(number)),
            card_expiry: Some(expiry.into()),
            ..Default::default()
        }
    }

    pub fn paypal(email: impl Into<String>) -> Self {
        Self {
            paypal_email: Some(email.into()),
            ..Default::default()
        }
    }

    /// Bank transfer details. The account number is masked to its last four digits.
    pub fn bank(account: &str, bank_name: impl Into<String>) -> Self {
        Self {
            bank_account: Some(mask_digits(account)),
            bank_name: Some(bank_name.into()),
            ..Default::default()
        }
    }

    fn require(&self, method: PaymentMethod) -> Result<(), EventError> {
        let missing = |field| EventError::MissingMethodField { method, field };
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());

        match method {
            PaymentMethod::CreditCard => {
                if !present(&self.card_number) {
                    return Err(missing("cardNumber"));
                }
                if !present(&self.card_expiry) {
                    return Err(missing("cardExpiry"));
                }
            }
            PaymentMethod::Paypal => {
                if !present(&self.paypal_email) {
                    return Err(missing("paypalEmail"));
                }
            }
            PaymentMethod::BankTransfer => {
                if !present(&self.bank_account) {
                    return Err(missing("bankAccount"));
                }
                if !present(&self.bank_name) {
                    return Err(missing("bankName"));
                }
            }
        }
        Ok(())
    }
}

/// Mask every digit except the last four. Separators are dropped.
///
/// Already-masked input (`*` characters) is kept as-is so masking is idempotent.
pub fn mask_digits(raw: &str) -> String {
    let kept: Vec<char> = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '*')
        .collect();
    let visible = kept.len().saturating_sub(4);
    kept.iter()
        .enumerate()
        .map(|(i, c)| if i < visible { '*' } else { *c })
        .collect()
}

/// Input for building an [`OutcomeEvent`].
#[derive(Debug, Clone)]
pub struct NewOutcome {
    pub order_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub details: MethodDetails,
    pub transaction_id: String,
    pub retry_count: u32,
}

/// Order-payment outcome event as transported on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeEvent {
    pub id: u64,
    pub order_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    #[serde(flatten)]
    pub details: MethodDetails,
    #[serde(default)]
    pub transaction_id: String,
    /// Attempts made by the business logic that produced the event.
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutcomeEvent {
    /// Validate and build a new event with a fresh id and timestamps.
    pub fn new(outcome: NewOutcome) -> Result<Self, EventError> {
        let now = Utc::now();
        let event = Self {
            id: next_event_id(),
            order_id: outcome.order_id,
            amount: outcome.amount,
            currency: outcome.currency,
            payment_method: outcome.payment_method,
            payment_status: outcome.payment_status,
            details: outcome.details,
            transaction_id: outcome.transaction_id,
            retry_count: outcome.retry_count,
            created_at: now,
            updated_at: now,
        };
        event.validate()?;
        Ok(event)
    }

    /// Re-check the invariants on an event that arrived from elsewhere.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.order_id.trim().is_empty() {
            return Err(EventError::MissingOrderId);
        }
        if self.amount <= Decimal::ZERO {
            return Err(EventError::NonPositiveAmount(self.amount));
        }
        if self.currency.trim().is_empty() {
            return Err(EventError::MissingCurrency);
        }
        self.details.require(self.payment_method)?;
        if self.payment_status == PaymentStatus::Success && self.transaction_id.trim().is_empty() {
            return Err(EventError::MissingTransactionId);
        }
        Ok(())
    }
}

/// Failure notice published to the failed route when a payment request never
/// produced an outcome (validation or gateway errors).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureNotice {
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl FailureNotice {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

static LAST_EVENT_ID: AtomicU64 = AtomicU64::new(0);

/// Strictly increasing event id seeded from wall-clock milliseconds.
pub fn next_event_id() -> u64 {
    let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
    let mut last = LAST_EVENT_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_EVENT_ID.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}
