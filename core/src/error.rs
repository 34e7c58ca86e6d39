use crate::types::{EntityId, Money};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Decimal error: {0}")]
    Decimal(#[from] rust_decimal::Error),

    // ── Validation (soft, re-submittable) ──────────────────────────
    #[error("Payment of {amount} is less than the current debt of {debt}; authorization required")]
    PartialPaymentRequiresAuthorization { amount: Money, debt: Money },

    #[error("An identical payment '{existing_payment_id}' was registered within the duplicate window")]
    DuplicatePaymentSuspected { existing_payment_id: EntityId },

    #[error("Subscriber '{subscriber_id}' has no debt to pay")]
    NothingToPay { subscriber_id: EntityId },

    #[error("Subscriber '{0}' not found")]
    SubscriberNotFound(EntityId),

    #[error("Payment '{0}' not found")]
    PaymentNotFound(EntityId),

    #[error("Payment '{payment_id}' is '{status}', expected 'pending'")]
    PaymentNotPending { payment_id: EntityId, status: String },

    #[error("Invoice '{0}' not found")]
    InvoiceNotFound(EntityId),

    #[error("Invoice '{0}' is already cancelled")]
    InvoiceAlreadyCancelled(EntityId),

    #[error("Invalid payment: {0}")]
    InvalidPayment(String),

    #[error("Promise date {promise_date} is before today ({today})")]
    PromiseDateInPast {
        promise_date: chrono::NaiveDate,
        today: chrono::NaiveDate,
    },

    #[error("No exchange rate configured for {from} -> {to}")]
    UnknownCurrencyRate { from: String, to: String },

    // ── Batch-fatal ─────────────────────────────────────────────────
    #[error("Subscriber '{0}' was modified concurrently")]
    ConcurrentModification(EntityId),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BillingError {
    /// Stable machine-readable code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Decimal(_) => "DECIMAL_ERROR",
            Self::PartialPaymentRequiresAuthorization { .. } => {
                "PARTIAL_PAYMENT_REQUIRES_AUTHORIZATION"
            }
            Self::DuplicatePaymentSuspected { .. } => "DUPLICATE_PAYMENT_SUSPECTED",
            Self::NothingToPay { .. } => "NOTHING_TO_PAY",
            Self::SubscriberNotFound(_) => "SUBSCRIBER_NOT_FOUND",
            Self::PaymentNotFound(_) => "PAYMENT_NOT_FOUND",
            Self::PaymentNotPending { .. } => "PAYMENT_NOT_PENDING",
            Self::InvoiceNotFound(_) => "INVOICE_NOT_FOUND",
            Self::InvoiceAlreadyCancelled(_) => "INVOICE_ALREADY_CANCELLED",
            Self::InvalidPayment(_) => "INVALID_PAYMENT",
            Self::PromiseDateInPast { .. } => "PROMISE_DATE_IN_PAST",
            Self::UnknownCurrencyRate { .. } => "UNKNOWN_CURRENCY_RATE",
            Self::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Validation errors leave no state behind and may be re-submitted
    /// (for example with an authorization or allow-duplicate flag).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::PartialPaymentRequiresAuthorization { .. }
                | Self::DuplicatePaymentSuspected { .. }
                | Self::NothingToPay { .. }
                | Self::SubscriberNotFound(_)
                | Self::PaymentNotFound(_)
                | Self::PaymentNotPending { .. }
                | Self::InvoiceNotFound(_)
                | Self::InvoiceAlreadyCancelled(_)
                | Self::InvalidPayment(_)
                | Self::PromiseDateInPast { .. }
                | Self::UnknownCurrencyRate { .. }
        )
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
