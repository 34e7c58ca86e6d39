//! SQLite persistence layer.
//!
//! RULE: Only the store module talks to the database.
//! Components call store methods; they never execute SQL directly.
//!
//! Money columns are canonical decimal TEXT; they are summed and compared
//! in Rust, never in SQL.

use crate::{
    error::BillingResult,
    event::ServiceAction,
    types::{CurrencyCode, EntityId, Money, Period},
};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
    Connection, Row,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cell::Cell;

mod invoice;
mod operations;
mod payment;
mod promise;
mod subscriber;

pub use payment::InvariantCheck;

pub struct BillingStore {
    conn: Connection,
    tx_depth: Cell<u32>,
}

impl BillingStore {
    pub fn open(path: &str) -> BillingResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            tx_depth: Cell::new(0),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> BillingResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            tx_depth: Cell::new(0),
        })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> BillingResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_invoices.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_payments.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_promises_ops.sql"))?;
        Ok(())
    }

    /// Run `f` as one atomic unit.
    ///
    /// The outermost call is a `BEGIN IMMEDIATE … COMMIT` transaction; nested
    /// calls become savepoints, so an inner failure rolls back only the inner
    /// unit while the outer one may still commit.
    pub fn atomically<T>(
        &self,
        f: impl FnOnce(&Self) -> BillingResult<T>,
    ) -> BillingResult<T> {
        let depth = self.tx_depth.get();
        let (begin, commit, rollback) = if depth == 0 {
            (
                "BEGIN IMMEDIATE".to_string(),
                "COMMIT".to_string(),
                "ROLLBACK".to_string(),
            )
        } else {
            let sp = format!("sp_{depth}");
            (
                format!("SAVEPOINT {sp}"),
                format!("RELEASE {sp}"),
                format!("ROLLBACK TO {sp}; RELEASE {sp}"),
            )
        };

        self.conn.execute_batch(&begin)?;
        self.tx_depth.set(depth + 1);
        let result = f(self);
        self.tx_depth.set(depth);

        match result {
            Ok(value) => match self.conn.execute_batch(&commit) {
                Ok(()) => Ok(value),
                Err(e) => {
                    self.rollback_quietly(&rollback);
                    Err(e.into())
                }
            },
            Err(e) => {
                self.rollback_quietly(&rollback);
                Err(e)
            }
        }
    }

    fn rollback_quietly(&self, rollback: &str) {
        if let Err(e) = self.conn.execute_batch(rollback) {
            log::error!("rollback failed ({rollback}): {e}");
        }
    }
}

// ── Column helpers ─────────────────────────────────────────────────

pub(crate) fn money_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Money> {
    let raw: String = row.get(idx)?;
    raw.parse::<Decimal>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn period_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Period> {
    let raw: String = row.get(idx)?;
    Period::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("bad period '{raw}'").into(),
        )
    })
}

/// Text-backed status enums stored as their snake_case name.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self { $(Self::$variant => $text),+ }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s { $($text => Some(Self::$variant),)+ _ => None }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                Self::parse(s).ok_or_else(|| {
                    FromSqlError::Other(format!("unknown {} '{s}'", stringify!($name)).into())
                })
            }
        }
    };
}

// ── Statuses ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Active,
    Suspended,
    Retired,
}
text_enum!(SubscriberStatus { Active => "active", Suspended => "suspended", Retired => "retired" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Unpaid,
    Paid,
    Cancelled,
}
text_enum!(InvoiceStatus { Pending => "pending", Unpaid => "unpaid", Paid => "paid", Cancelled => "cancelled" });

impl InvoiceStatus {
    /// Pending (issued for a future date) and unpaid invoices both carry debt.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Unpaid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Verified,
    Cancelled,
}
text_enum!(PaymentStatus { Pending => "pending", Verified => "verified", Cancelled => "cancelled" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromiseStatus {
    Pending,
    Fulfilled,
    Broken,
}
text_enum!(PromiseStatus { Pending => "pending", Fulfilled => "fulfilled", Broken => "broken" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Done,
}
text_enum!(OperationStatus { Queued => "queued", Done => "done" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}
text_enum!(RunStatus { Running => "running", Completed => "completed", Failed => "failed" });

impl ToSql for ServiceAction {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ServiceAction {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        ServiceAction::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown service action '{s}'").into()))
    }
}

// ── Topology rows ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneRow {
    pub zone_id: EntityId,
    pub name: String,
    pub billing_day: Option<u32>,
    pub grace_period_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterRow {
    pub router_id: EntityId,
    pub name: String,
    /// Selects the NetworkServiceAdapter implementation.
    pub vendor: String,
    pub host: String,
    pub zone_id: Option<EntityId>,
    pub billing_day: Option<u32>,
    pub grace_period_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRow {
    pub plan_id: EntityId,
    pub name: String,
    pub price: Money,
    pub active: bool,
}

// ── Subscriber rows ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberRow {
    pub subscriber_id: EntityId,
    pub name: String,
    pub status: SubscriberStatus,
    /// Positive = debt, negative = credit.
    pub balance: Money,
    pub monthly_fee: Money,
    pub plan_id: Option<EntityId>,
    pub router_id: Option<EntityId>,
    pub zone_id: Option<EntityId>,
    pub collector_id: Option<EntityId>,
    /// The subscriber's identifier on its network device.
    pub service_ref: String,
    pub promise_date: Option<NaiveDate>,
    pub broken_promise_streak: u32,
    pub billing_enabled: bool,
    pub deleted_at: Option<NaiveDateTime>,
    pub version: i64,
}

impl SubscriberRow {
    pub fn debt(&self) -> Money {
        self.balance.max(Decimal::ZERO)
    }
}

/// Fields supplied when onboarding a subscriber.
#[derive(Debug, Clone)]
pub struct NewSubscriber {
    pub subscriber_id: EntityId,
    pub name: String,
    pub monthly_fee: Money,
    pub plan_id: Option<EntityId>,
    pub router_id: Option<EntityId>,
    pub zone_id: Option<EntityId>,
    pub collector_id: Option<EntityId>,
    pub service_ref: String,
    pub billing_enabled: bool,
}

impl NewSubscriber {
    pub fn new(subscriber_id: &str, monthly_fee: Money) -> Self {
        Self {
            subscriber_id: subscriber_id.to_string(),
            name: subscriber_id.to_string(),
            monthly_fee,
            plan_id: None,
            router_id: None,
            zone_id: None,
            collector_id: None,
            service_ref: subscriber_id.to_string(),
            billing_enabled: true,
        }
    }

    pub fn on_router(mut self, router_id: &str) -> Self {
        self.router_id = Some(router_id.to_string());
        self
    }

    pub fn in_zone(mut self, zone_id: &str) -> Self {
        self.zone_id = Some(zone_id.to_string());
        self
    }

    pub fn with_plan(mut self, plan_id: &str) -> Self {
        self.plan_id = Some(plan_id.to_string());
        self
    }

    pub fn collected_by(mut self, collector_id: &str) -> Self {
        self.collector_id = Some(collector_id.to_string());
        self
    }
}

// ── Invoice rows ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRow {
    pub invoice_id: EntityId,
    pub subscriber_id: EntityId,
    pub period: Period,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub subtotal: Money,
    pub total_amount: Money,
    pub status: InvoiceStatus,
    pub currency: CurrencyCode,
    /// Ledger -> reporting rate at issue time.
    pub exchange_rate: Decimal,
    pub seq: i64,
    /// Sum of payment allocations against this invoice (loaded, not stored).
    pub applied: Money,
}

impl InvoiceRow {
    pub fn outstanding(&self) -> Money {
        (self.total_amount - self.applied).max(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLineRow {
    pub line_no: u32,
    pub kind: String, // plan | adjustment
    pub description: String,
    pub amount: Money,
}

// ── Payment rows ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentPartRow {
    pub seq: u32,
    pub amount: Money,
    pub currency: CurrencyCode,
    pub method: String,
    /// Tendered -> ledger rate.
    pub exchange_rate: Decimal,
    pub ledger_amount: Money,
    pub tax_amount: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRow {
    pub payment_id: EntityId,
    pub subscriber_id: EntityId,
    /// Ledger currency.
    pub amount: Money,
    pub currency: CurrencyCode,
    /// Reporting currency.
    pub base_amount: Money,
    pub exchange_rate: Decimal,
    pub fx_variance: Money,
    pub tax_amount: Money,
    pub method: String,
    pub status: PaymentStatus,
    pub payment_date: NaiveDate,
    pub reference: Option<String>,
    pub registered_by: String,
    /// Restore a suspended subscriber when the payment is verified, even if
    /// debt remains.
    pub activate: bool,
    pub integrity_hash: String,
    pub created_at: NaiveDateTime,
    pub parts: Vec<PaymentPartRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRow {
    pub allocation_id: i64,
    pub payment_id: EntityId,
    pub invoice_id: EntityId,
    pub amount: Money,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletedPaymentRow {
    pub payment_id: EntityId,
    pub subscriber_id: EntityId,
    pub amount: Money,
    pub currency: CurrencyCode,
    pub method: String,
    pub status: PaymentStatus,
    pub payment_date: NaiveDate,
    pub integrity_hash: String,
    pub snapshot: String, // JSON of the payment and its allocations
    pub reason: String,
    pub deleted_by: String,
    pub deleted_at: NaiveDateTime,
}

// ── Promise rows ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromiseRow {
    pub promise_id: EntityId,
    pub subscriber_id: EntityId,
    pub promise_date: NaiveDate,
    pub status: PromiseStatus,
    pub granted_by: String,
    pub created_at: NaiveDateTime,
    pub resolved_at: Option<NaiveDateTime>,
}

impl PromiseRow {
    /// A pending promise whose date has not yet passed.
    pub fn covers(&self, today: NaiveDate) -> bool {
        self.status == PromiseStatus::Pending && self.promise_date >= today
    }
}

// ── Operations rows ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperationRow {
    pub op_id: i64,
    pub subscriber_id: EntityId,
    pub device_id: Option<EntityId>,
    pub kind: ServiceAction,
    pub attributes: serde_json::Value,
    pub status: OperationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRunRow {
    pub run_id: String,
    pub run_date: NaiveDate,
    pub status: RunStatus,
    pub invoices: u32,
    pub prorated: u32,
    pub suspended: u32,
    pub restored: u32,
    pub error_count: u32,
    pub error: Option<String>,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
}
