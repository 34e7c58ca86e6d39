//! Cycle phase trait and the context every phase runs against.
//!
//! RULE: Every phase of the daily cycle implements CyclePhase.
//! The engine runs phases in registration order, once per cycle, each
//! inside its own transaction.
//! Execution order is fixed and documented in engine.rs.

use crate::{
    config::BillingConfig,
    currency::CurrencyRateProvider,
    error::BillingResult,
    event::LedgerEvent,
    network::DeviceAction,
    scope::BillingScope,
    store::BillingStore,
    types::Period,
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

/// Everything a phase or ledger operation may touch. The clock is read once
/// by the caller so a whole run sees a single `now`.
pub struct CycleContext<'a> {
    pub store: &'a BillingStore,
    pub config: &'a BillingConfig,
    pub rates: &'a dyn CurrencyRateProvider,
    pub scope: &'a BillingScope,
    pub now: NaiveDateTime,
}

impl CycleContext<'_> {
    pub fn today(&self) -> NaiveDate {
        self.now.date()
    }

    pub fn period(&self) -> Period {
        Period::of(self.today())
    }
}

/// Counts and events produced by one phase or one ledger operation.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PhaseReport {
    pub invoices_issued: u32,
    pub invoices_promoted: u32,
    pub prorated: u32,
    pub suspended: u32,
    pub restored: u32,
    pub corrected: u32,
    pub promises_broken: u32,
    pub skipped_frozen: u32,
    pub device_deferred: u32,
    /// Per-subscriber failures caught and skipped.
    pub errors: u32,
    #[serde(skip)]
    pub events: Vec<LedgerEvent>,
    /// Physical actions decided by the unit, driven by the engine after it
    /// commits.
    #[serde(skip)]
    pub device_actions: Vec<DeviceAction>,
}

impl PhaseReport {
    pub fn absorb(&mut self, other: PhaseReport) {
        self.invoices_issued += other.invoices_issued;
        self.invoices_promoted += other.invoices_promoted;
        self.prorated += other.prorated;
        self.suspended += other.suspended;
        self.restored += other.restored;
        self.corrected += other.corrected;
        self.promises_broken += other.promises_broken;
        self.skipped_frozen += other.skipped_frozen;
        self.device_deferred += other.device_deferred;
        self.errors += other.errors;
        self.events.extend(other.events);
        self.device_actions.extend(other.device_actions);
    }
}

/// The contract every cycle phase must fulfill.
pub trait CyclePhase: Send {
    /// Unique stable name for this phase.
    fn name(&self) -> &'static str;

    /// Called once per cycle by the engine. Must be safe to re-run for the
    /// same date: every phase guards its writes with existence checks or
    /// monotonic comparisons.
    fn run(&mut self, ctx: &CycleContext<'_>) -> BillingResult<PhaseReport>;
}
