//! The reconciliation engine: the single entry point for the daily cycle and
//! for every ledger operation.
//!
//! EXECUTION ORDER (fixed, documented, never reordered):
//!   1. Invoice generation   (promote pending, issue this period)
//!   2. Proration            (from proration.start_day)
//!   3. Suspension           (expire promises, suspend, restore)
//!
//! RULES:
//!   - Each phase runs inside its own transaction; a batch-fatal error rolls
//!     the phase back and fails the run. Earlier phases stay committed and
//!     every phase is idempotent, so the scheduler may simply retry.
//!   - Every ledger operation (pay, confirm, revert, cancel, promise, quote)
//!     is one transaction covering balance, invoices and allocations.
//!   - The clock is read once per call.
//!   - Every event is appended to the audit sink in the same transaction as
//!     the change it describes.
//!   - Device actions decided by a phase or ledger operation are driven only
//!     after it commits, with no transaction open. Their outcomes are
//!     recorded in a short transaction of their own. A device or queue
//!     failure never fails the operation that decided the action.

use crate::{
    clock::Clock,
    config::BillingConfig,
    currency::{CurrencyRateProvider, RateTable},
    error::BillingResult,
    event::{AuditSink, LedgerEvent},
    invoice_subsystem::InvoiceSubsystem,
    network::{DeviceAction, DrainReport, ServiceEnforcer},
    payment_ledger::{self, PaymentRequest},
    promise_tracker,
    proration_subsystem::ProrationSubsystem,
    scope::BillingScope,
    store::{BillingStore, CycleRunRow, PaymentRow, PromiseRow, RunStatus},
    subsystem::{CycleContext, CyclePhase, PhaseReport},
    suspension_subsystem::SuspensionSubsystem,
    types::{EntityId, Money, Period, RunId},
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

/// Outcome of one `run_daily_cycle`.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: RunId,
    pub date: NaiveDate,
    pub invoices_issued: u32,
    pub invoices_promoted: u32,
    pub prorated: u32,
    pub suspended: u32,
    pub restored: u32,
    pub corrected: u32,
    pub promises_broken: u32,
    pub skipped_frozen: u32,
    pub device_deferred: u32,
    pub error_count: u32,
}

pub struct ReconciliationEngine {
    store: BillingStore,
    config: BillingConfig,
    clock: Box<dyn Clock>,
    rates: Box<dyn CurrencyRateProvider>,
    enforcer: ServiceEnforcer,
    phases: Vec<Box<dyn CyclePhase>>,
}

impl ReconciliationEngine {
    /// An engine with no phases registered. Rates come from the config.
    pub fn new(
        store: BillingStore,
        config: BillingConfig,
        clock: Box<dyn Clock>,
        enforcer: ServiceEnforcer,
    ) -> Self {
        let rates = Box::new(RateTable::new(&config.rates));
        Self {
            store,
            config,
            clock,
            rates,
            enforcer,
            phases: Vec::new(),
        }
    }

    /// Build a fully wired engine with all phases registered.
    /// Call this instead of new() + manual register() calls.
    pub fn build(
        store: BillingStore,
        config: BillingConfig,
        clock: Box<dyn Clock>,
        enforcer: ServiceEnforcer,
    ) -> Self {
        let mut engine = Self::new(store, config, clock, enforcer);
        // EXECUTION ORDER: fixed, documented, never reordered.
        engine.register(Box::new(InvoiceSubsystem::new()));
        engine.register(Box::new(ProrationSubsystem::new()));
        engine.register(Box::new(SuspensionSubsystem::new()));
        engine
    }

    /// Build an engine over a fresh in-memory store with the test config.
    /// Used by integration tests.
    pub fn build_test(clock: Box<dyn Clock>, enforcer: ServiceEnforcer) -> BillingResult<Self> {
        let store = BillingStore::in_memory()?;
        store.migrate()?;
        Ok(Self::build(store, BillingConfig::default_test(), clock, enforcer))
    }

    /// Replace the rate provider built from the config.
    pub fn with_rates(mut self, rates: Box<dyn CurrencyRateProvider>) -> Self {
        self.rates = rates;
        self
    }

    /// Register a phase. Call in the documented execution order.
    pub fn register(&mut self, phase: Box<dyn CyclePhase>) {
        self.phases.push(phase);
    }

    /// Read access for the reporting/query layer.
    pub fn store(&self) -> &BillingStore {
        &self.store
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    // ── Daily cycle ────────────────────────────────────────────────

    pub fn run_daily_cycle(&mut self, scope: &BillingScope) -> BillingResult<CycleReport> {
        let now = self.clock.now();
        let today = now.date();
        let mut run = CycleRunRow {
            run_id: uuid::Uuid::new_v4().to_string(),
            run_date: today,
            status: RunStatus::Running,
            invoices: 0,
            prorated: 0,
            suspended: 0,
            restored: 0,
            error_count: 0,
            error: None,
            started_at: now,
            finished_at: None,
        };
        self.store.insert_cycle_run(&run)?;
        append_events(
            &self.store,
            &[LedgerEvent::CycleStarted {
                run_id: run.run_id.clone(),
                date: today,
            }],
            now,
        )?;
        log::info!("Daily cycle {} started for {today}", run.run_id);

        let ctx = CycleContext {
            store: &self.store,
            config: &self.config,
            rates: self.rates.as_ref(),
            scope,
            now,
        };
        let mut total = PhaseReport::default();
        for phase in self.phases.iter_mut() {
            let name = phase.name();
            let result = ctx.store.atomically(|s| {
                let report = phase.run(&ctx)?;
                append_events(s, &report.events, now)?;
                Ok(report)
            });
            match result {
                Ok(mut report) => {
                    log::debug!("Phase {name} finished with {} events", report.events.len());
                    enforce_decided(&self.store, &self.enforcer, &mut report, now);
                    total.absorb(report);
                }
                Err(e) => {
                    log::error!("Daily cycle {} failed in phase {name}: {e}", run.run_id);
                    run.status = RunStatus::Failed;
                    run.error = Some(format!("{name}: {e}"));
                    run.finished_at = Some(self.clock.now());
                    fill_counts(&mut run, &total);
                    let failed = LedgerEvent::CycleFailed {
                        run_id: run.run_id.clone(),
                        error: e.to_string(),
                    };
                    if let Err(log_err) = self
                        .store
                        .finish_cycle_run(&run)
                        .and_then(|_| append_events(&self.store, &[failed], now))
                    {
                        log::error!("Could not record failed run {}: {log_err}", run.run_id);
                    }
                    return Err(e);
                }
            }
        }

        run.status = RunStatus::Completed;
        run.finished_at = Some(self.clock.now());
        fill_counts(&mut run, &total);
        self.store.finish_cycle_run(&run)?;
        append_events(
            &self.store,
            &[LedgerEvent::CycleCompleted {
                run_id: run.run_id.clone(),
                error_count: total.errors,
            }],
            now,
        )?;
        log::info!(
            "Daily cycle {} completed: {} invoices, {} prorated, {} suspended, {} restored, {} errors",
            run.run_id,
            total.invoices_issued,
            total.prorated,
            total.suspended,
            total.restored,
            total.errors
        );

        Ok(CycleReport {
            run_id: run.run_id,
            date: today,
            invoices_issued: total.invoices_issued,
            invoices_promoted: total.invoices_promoted,
            prorated: total.prorated,
            suspended: total.suspended,
            restored: total.restored,
            corrected: total.corrected,
            promises_broken: total.promises_broken,
            skipped_frozen: total.skipped_frozen,
            device_deferred: total.device_deferred,
            error_count: total.errors,
        })
    }

    // ── Individual phases, for finer-grained scheduling ────────────

    pub fn generate_cycle(&self, period: Period, scope: &BillingScope) -> BillingResult<PhaseReport> {
        self.transact(scope, |ctx| {
            InvoiceSubsystem::generate_cycle(ctx, period).map(|r| ((), r))
        })
        .map(|(_, r)| r)
    }

    pub fn apply_proration(
        &self,
        period: Period,
        scope: &BillingScope,
        force: bool,
    ) -> BillingResult<PhaseReport> {
        self.transact(scope, |ctx| {
            ProrationSubsystem::apply_proration(ctx, period, force).map(|r| ((), r))
        })
        .map(|(_, r)| r)
    }

    pub fn run_suspension_pass(&self, scope: &BillingScope) -> BillingResult<PhaseReport> {
        self.transact(scope, |ctx| SuspensionSubsystem::run_pass(ctx).map(|r| ((), r)))
            .map(|(_, r)| r)
    }

    // ── Ledger operations ──────────────────────────────────────────

    pub fn register_payment(&self, req: &PaymentRequest) -> BillingResult<PaymentRow> {
        self.transact(&BillingScope::all(), |ctx| {
            payment_ledger::register_payment(ctx, req)
        })
        .map(|(payment, _)| payment)
    }

    pub fn confirm_payment(&self, payment_id: &str) -> BillingResult<PaymentRow> {
        self.transact(&BillingScope::all(), |ctx| {
            payment_ledger::confirm_payment(ctx, payment_id)
        })
        .map(|(payment, _)| payment)
    }

    pub fn revert_payment(
        &self,
        payment_id: &str,
        reason: &str,
        reverted_by: &str,
    ) -> BillingResult<PhaseReport> {
        self.transact(&BillingScope::all(), |ctx| {
            payment_ledger::revert_payment(ctx, payment_id, reason, reverted_by).map(|r| ((), r))
        })
        .map(|(_, r)| r)
    }

    pub fn cancel_invoice(&self, invoice_id: &str, reason: &str) -> BillingResult<PhaseReport> {
        self.transact(&BillingScope::all(), |ctx| {
            InvoiceSubsystem::cancel_invoice(ctx, invoice_id, reason).map(|r| ((), r))
        })
        .map(|(_, r)| r)
    }

    pub fn grant_promise(
        &self,
        subscriber_id: &str,
        promise_date: NaiveDate,
        granted_by: &str,
    ) -> BillingResult<PromiseRow> {
        self.transact(&BillingScope::all(), |ctx| {
            promise_tracker::grant_promise(ctx, subscriber_id, promise_date, granted_by).map(
                |(promise, events)| {
                    let report = PhaseReport {
                        events,
                        ..PhaseReport::default()
                    };
                    (promise, report)
                },
            )
        })
        .map(|(promise, _)| promise)
    }

    /// Forced proration of the subscriber's current invoice; returns the
    /// debt to quote at the counter.
    pub fn quote(&self, subscriber_id: &str) -> BillingResult<Money> {
        self.transact(&BillingScope::all(), |ctx| {
            ProrationSubsystem::quote(ctx, subscriber_id)
        })
        .map(|(debt, _)| debt)
    }

    /// The retry worker's step: replay queued device operations.
    pub fn drain_pending_operations(&self, limit: usize) -> BillingResult<DrainReport> {
        self.enforcer.drain(&self.store, limit)
    }

    /// Recompute the balance invariant for every billable subscriber and
    /// return the ids where it does not hold.
    pub fn invariant_violations(&self) -> BillingResult<Vec<EntityId>> {
        let mut broken = Vec::new();
        for subscriber in self.store.billable_subscribers()? {
            let check = self.store.check_balance_invariant(&subscriber.subscriber_id)?;
            if !check.holds() {
                log::warn!(
                    "Balance invariant broken for {}: balance {} expected {}",
                    check.subscriber_id,
                    check.balance,
                    check.expected_balance()
                );
                broken.push(check.subscriber_id);
            }
        }
        Ok(broken)
    }

    /// Run one ledger operation as a single transaction with its audit
    /// entries, then drive any device actions it decided.
    fn transact<T>(
        &self,
        scope: &BillingScope,
        f: impl FnOnce(&CycleContext<'_>) -> BillingResult<(T, PhaseReport)>,
    ) -> BillingResult<(T, PhaseReport)> {
        let now = self.clock.now();
        let ctx = CycleContext {
            store: &self.store,
            config: &self.config,
            rates: self.rates.as_ref(),
            scope,
            now,
        };
        let (value, mut report) = self.store.atomically(|s| {
            let (value, report) = f(&ctx)?;
            append_events(s, &report.events, now)?;
            Ok((value, report))
        })?;

        enforce_decided(&self.store, &self.enforcer, &mut report, now);
        Ok((value, report))
    }
}

/// Drive the device actions a committed unit decided, then persist the
/// outcomes. Deferred actions count as errors of the unit.
fn enforce_decided(
    store: &BillingStore,
    enforcer: &ServiceEnforcer,
    report: &mut PhaseReport,
    now: NaiveDateTime,
) {
    let actions: Vec<DeviceAction> = std::mem::take(&mut report.device_actions);
    if actions.is_empty() {
        return;
    }
    let outcomes = enforcer.drive(store, &actions);
    let failed = outcomes.iter().filter(|o| o.result.is_err()).count() as u32;
    report.device_deferred += failed;
    report.errors += failed;

    let recorded = store.atomically(|s| {
        let enforcement = ServiceEnforcer::record(s, &outcomes, now)?;
        append_events(s, &enforcement.events, now)?;
        Ok(enforcement)
    });
    match recorded {
        Ok(enforcement) => report.events.extend(enforcement.events),
        Err(e) => log::error!(
            "Could not record {} device outcomes ({failed} to retry): {e}",
            outcomes.len()
        ),
    }
}

fn append_events(
    sink: &dyn AuditSink,
    events: &[LedgerEvent],
    now: NaiveDateTime,
) -> BillingResult<()> {
    for event in events {
        sink.append(&event.audit_record(now))?;
    }
    Ok(())
}

fn fill_counts(run: &mut CycleRunRow, total: &PhaseReport) {
    run.invoices = total.invoices_issued;
    run.prorated = total.prorated;
    run.suspended = total.suspended;
    run.restored = total.restored;
    run.error_count = total.errors;
}
