//! Ledger events and the audit trail.
//!
//! RULE: every state-changing operation emits a LedgerEvent, and every
//! LedgerEvent becomes exactly one append-only AuditRecord.
//! Variants are added over time; never removed or reordered.

use crate::{
    error::BillingResult,
    types::{EntityId, Money, RunId},
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAction {
    Suspend,
    Restore,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suspend => "suspend",
            Self::Restore => "restore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "suspend" => Some(Self::Suspend),
            "restore" => Some(Self::Restore),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    // ── Engine ─────────────────────────────────────
    CycleStarted {
        run_id: RunId,
        date: NaiveDate,
    },
    CycleCompleted {
        run_id: RunId,
        error_count: u32,
    },
    CycleFailed {
        run_id: RunId,
        error: String,
    },

    // ── Invoices ───────────────────────────────────
    InvoiceIssued {
        invoice_id: EntityId,
        subscriber_id: EntityId,
        period: String,
        amount: Money,
    },
    InvoiceProrated {
        invoice_id: EntityId,
        subscriber_id: EntityId,
        previous_total: Money,
        new_total: Money,
    },
    InvoiceStatusChanged {
        invoice_id: EntityId,
        subscriber_id: EntityId,
        from: String,
        to: String,
        cause: String,
    },
    InvoiceCancelled {
        invoice_id: EntityId,
        subscriber_id: EntityId,
        amount: Money,
        reason: String,
    },

    // ── Payments ───────────────────────────────────
    PaymentRegistered {
        payment_id: EntityId,
        subscriber_id: EntityId,
        amount: Money,
        currency: String,
        status: String,
    },
    PaymentConfirmed {
        payment_id: EntityId,
        subscriber_id: EntityId,
        amount: Money,
        fx_variance: Money,
    },
    PaymentReverted {
        payment_id: EntityId,
        subscriber_id: EntityId,
        amount: Money,
        previous_status: String,
        reason: String,
        reverted_by: String,
    },
    BalanceChanged {
        subscriber_id: EntityId,
        previous: Money,
        new: Money,
        cause: String,
    },

    // ── Promises ───────────────────────────────────
    PromiseGranted {
        promise_id: EntityId,
        subscriber_id: EntityId,
        promise_date: NaiveDate,
        granted_by: String,
    },
    PromiseFulfilled {
        promise_id: EntityId,
        subscriber_id: EntityId,
    },
    PromiseBroken {
        promise_id: EntityId,
        subscriber_id: EntityId,
        streak: u32,
    },

    // ── Service lifecycle ──────────────────────────
    SubscriberSuspended {
        subscriber_id: EntityId,
        previous_status: String,
        reason: String,
    },
    SubscriberRestored {
        subscriber_id: EntityId,
        previous_status: String,
        reason: String,
    },
    OverdueCorrected {
        subscriber_id: EntityId,
        invoice_id: EntityId,
    },
    DeviceActionApplied {
        subscriber_id: EntityId,
        device_id: EntityId,
        action: ServiceAction,
    },
    DeviceActionDeferred {
        subscriber_id: EntityId,
        device_id: Option<EntityId>,
        action: ServiceAction,
        error: String,
    },
}

impl LedgerEvent {
    /// Stable name, used as the audit `operation` column.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::CycleStarted { .. } => "cycle_started",
            Self::CycleCompleted { .. } => "cycle_completed",
            Self::CycleFailed { .. } => "cycle_failed",
            Self::InvoiceIssued { .. } => "invoice_issued",
            Self::InvoiceProrated { .. } => "invoice_prorated",
            Self::InvoiceStatusChanged { .. } => "invoice_status_changed",
            Self::InvoiceCancelled { .. } => "invoice_cancelled",
            Self::PaymentRegistered { .. } => "payment_registered",
            Self::PaymentConfirmed { .. } => "payment_confirmed",
            Self::PaymentReverted { .. } => "payment_reverted",
            Self::BalanceChanged { .. } => "balance_changed",
            Self::PromiseGranted { .. } => "promise_granted",
            Self::PromiseFulfilled { .. } => "promise_fulfilled",
            Self::PromiseBroken { .. } => "promise_broken",
            Self::SubscriberSuspended { .. } => "subscriber_suspended",
            Self::SubscriberRestored { .. } => "subscriber_restored",
            Self::OverdueCorrected { .. } => "overdue_corrected",
            Self::DeviceActionApplied { .. } => "device_action_applied",
            Self::DeviceActionDeferred { .. } => "device_action_deferred",
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::CycleStarted { .. } | Self::CycleCompleted { .. } | Self::CycleFailed { .. } => {
                "engine"
            }
            Self::InvoiceIssued { .. }
            | Self::InvoiceProrated { .. }
            | Self::InvoiceStatusChanged { .. }
            | Self::InvoiceCancelled { .. } => "billing",
            Self::PaymentRegistered { .. }
            | Self::PaymentConfirmed { .. }
            | Self::PaymentReverted { .. }
            | Self::BalanceChanged { .. } => "payments",
            Self::PromiseGranted { .. }
            | Self::PromiseFulfilled { .. }
            | Self::PromiseBroken { .. } => "promises",
            Self::SubscriberSuspended { .. }
            | Self::SubscriberRestored { .. }
            | Self::OverdueCorrected { .. }
            | Self::DeviceActionApplied { .. }
            | Self::DeviceActionDeferred { .. } => "service",
        }
    }

    fn entity(&self) -> (&'static str, &str) {
        match self {
            Self::CycleStarted { run_id, .. }
            | Self::CycleCompleted { run_id, .. }
            | Self::CycleFailed { run_id, .. } => ("cycle_run", run_id),
            Self::InvoiceIssued { invoice_id, .. }
            | Self::InvoiceProrated { invoice_id, .. }
            | Self::InvoiceStatusChanged { invoice_id, .. }
            | Self::InvoiceCancelled { invoice_id, .. } => ("invoice", invoice_id),
            Self::PaymentRegistered { payment_id, .. }
            | Self::PaymentConfirmed { payment_id, .. }
            | Self::PaymentReverted { payment_id, .. } => ("payment", payment_id),
            Self::PromiseGranted { promise_id, .. }
            | Self::PromiseFulfilled { promise_id, .. }
            | Self::PromiseBroken { promise_id, .. } => ("payment_promise", promise_id),
            Self::BalanceChanged { subscriber_id, .. }
            | Self::SubscriberSuspended { subscriber_id, .. }
            | Self::SubscriberRestored { subscriber_id, .. }
            | Self::OverdueCorrected { subscriber_id, .. }
            | Self::DeviceActionApplied { subscriber_id, .. }
            | Self::DeviceActionDeferred { subscriber_id, .. } => ("subscriber", subscriber_id),
        }
    }

    /// (previous_state, new_state) for transitions that have one.
    fn states(&self) -> (Option<String>, Option<String>) {
        match self {
            Self::InvoiceProrated { previous_total, new_total, .. } => {
                (Some(previous_total.to_string()), Some(new_total.to_string()))
            }
            Self::InvoiceStatusChanged { from, to, .. } => (Some(from.clone()), Some(to.clone())),
            Self::InvoiceCancelled { .. } => (None, Some("cancelled".into())),
            Self::PaymentRegistered { status, .. } => (None, Some(status.clone())),
            Self::PaymentConfirmed { .. } => (Some("pending".into()), Some("verified".into())),
            Self::PaymentReverted { previous_status, .. } => {
                (Some(previous_status.clone()), Some("deleted".into()))
            }
            Self::BalanceChanged { previous, new, .. } => {
                (Some(previous.to_string()), Some(new.to_string()))
            }
            Self::PromiseGranted { .. } => (None, Some("pending".into())),
            Self::PromiseFulfilled { .. } => (Some("pending".into()), Some("fulfilled".into())),
            Self::PromiseBroken { .. } => (Some("pending".into()), Some("broken".into())),
            Self::SubscriberSuspended { previous_status, .. } => {
                (Some(previous_status.clone()), Some("suspended".into()))
            }
            Self::SubscriberRestored { previous_status, .. } => {
                (Some(previous_status.clone()), Some("active".into()))
            }
            Self::OverdueCorrected { .. } => (Some("unpaid".into()), Some("paid".into())),
            _ => (None, None),
        }
    }

    fn description(&self) -> String {
        match self {
            Self::CycleStarted { date, .. } => format!("Daily cycle started for {date}"),
            Self::CycleCompleted { error_count, .. } => {
                format!("Daily cycle completed with {error_count} soft errors")
            }
            Self::CycleFailed { error, .. } => format!("Daily cycle failed: {error}"),
            Self::InvoiceIssued { period, amount, subscriber_id, .. } => {
                format!("Invoice for {period} issued to {subscriber_id}: {amount}")
            }
            Self::InvoiceProrated { previous_total, new_total, .. } => {
                format!("Prorated from {previous_total} to {new_total}")
            }
            Self::InvoiceStatusChanged { from, to, cause, .. } => {
                format!("Status {from} -> {to} ({cause})")
            }
            Self::InvoiceCancelled { amount, reason, .. } => {
                format!("Cancelled ({amount}): {reason}")
            }
            Self::PaymentRegistered { amount, currency, status, .. } => {
                format!("Payment of {amount} {currency} registered as {status}")
            }
            Self::PaymentConfirmed { amount, fx_variance, .. } => {
                format!("Payment of {amount} applied (fx variance {fx_variance})")
            }
            Self::PaymentReverted { amount, reason, reverted_by, .. } => {
                format!("Payment of {amount} reverted by {reverted_by}: {reason}")
            }
            Self::BalanceChanged { previous, new, cause, .. } => {
                format!("Balance {previous} -> {new} ({cause})")
            }
            Self::PromiseGranted { promise_date, granted_by, .. } => {
                format!("Promise to pay by {promise_date} granted by {granted_by}")
            }
            Self::PromiseFulfilled { .. } => "Promise fulfilled".into(),
            Self::PromiseBroken { streak, .. } => {
                format!("Promise broken (consecutive broken: {streak})")
            }
            Self::SubscriberSuspended { reason, .. } => format!("Service suspended: {reason}"),
            Self::SubscriberRestored { reason, .. } => format!("Service restored: {reason}"),
            Self::OverdueCorrected { invoice_id, .. } => {
                format!("Overdue invoice {invoice_id} corrected to paid; subscriber solvent")
            }
            Self::DeviceActionApplied { device_id, action, .. } => {
                format!("{} applied on device {device_id}", action.as_str())
            }
            Self::DeviceActionDeferred { device_id, action, error, .. } => format!(
                "{} deferred to retry queue (device {}): {error}",
                action.as_str(),
                device_id.as_deref().unwrap_or("none")
            ),
        }
    }

    pub fn audit_record(&self, timestamp: NaiveDateTime) -> AuditRecord {
        let (entity_type, entity_id) = self.entity();
        let (previous_state, new_state) = self.states();
        AuditRecord {
            id: None,
            operation: self.operation().to_string(),
            category: self.category().to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            description: self.description(),
            previous_state,
            new_state,
            payload: serde_json::to_string(self).unwrap_or_default(),
            timestamp,
        }
    }
}

/// The audit entry as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Option<i64>,
    pub operation: String,
    pub category: String,
    pub entity_type: String,
    pub entity_id: String,
    pub description: String,
    pub previous_state: Option<String>,
    pub new_state: Option<String>,
    pub payload: String, // JSON-serialized LedgerEvent
    pub timestamp: NaiveDateTime,
}

/// Append-only write interface. The core never reads the sink back.
pub trait AuditSink {
    fn append(&self, record: &AuditRecord) -> BillingResult<()>;
}
