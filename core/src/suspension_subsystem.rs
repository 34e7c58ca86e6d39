//! Suspension subsystem: the service-lifecycle control loop.
//!
//! Execution order: last phase of the daily cycle.
//!
//! State machine per subscriber:
//!   active → suspended   balance > 0, an open invoice past its due date,
//!                        and no pending promise covering today
//!   suspended → active   balance ≤ 0
//!
//! Design:
//!   - Expired promises are broken first, so they no longer protect anyone.
//!   - The freeze window is read once per pass and blocks suspensions only.
//!   - Before suspending, the balance is re-read. A solvent subscriber gets
//!     credit applied and any invoice still overdue is corrected to paid.
//!   - The pass only decides device actions. The engine drives them once
//!     the pass has committed, so status changes stand whether or not the
//!     device call works; failed calls are queued for retry.

use crate::{
    error::BillingResult,
    event::{LedgerEvent, ServiceAction},
    payment_ledger::{apply_credit, device_action},
    promise_tracker,
    store::{BillingStore, InvoiceStatus, SubscriberStatus},
    subsystem::{CycleContext, CyclePhase, PhaseReport},
};
use rust_decimal::Decimal;

pub struct SuspensionSubsystem;

impl SuspensionSubsystem {
    pub fn new() -> Self {
        Self
    }

    pub fn run_pass(ctx: &CycleContext<'_>) -> BillingResult<PhaseReport> {
        let store = ctx.store;
        let today = ctx.today();
        let mut report = promise_tracker::expire_promises(ctx)?;

        let frozen = ctx.config.suspension.freeze.is_active(ctx.now);
        if frozen {
            log::warn!("Suspension freeze active at {}: no suspensions this pass", ctx.now);
        }

        // ── active → suspended ─────────────────────────────────────
        for subscriber_id in store.subscribers_with_overdue_invoices(today)? {
            let Some(subscriber) = store.subscriber(&subscriber_id)? else {
                continue;
            };
            if subscriber.deleted_at.is_some()
                || subscriber.status != SubscriberStatus::Active
                || !ctx.scope.includes(&subscriber)
            {
                continue;
            }
            if promise_tracker::is_covered(store, &subscriber_id, today)? {
                log::debug!("{subscriber_id}: overdue but covered by promise");
                continue;
            }
            match store.atomically(|s| suspend_if_due(ctx, s, &subscriber_id, frozen)) {
                Ok(outcome) => report.absorb(outcome),
                Err(e) => {
                    log::warn!("Suspension check for {subscriber_id} failed: {e}");
                    report.errors += 1;
                }
            }
        }

        // ── suspended → active ─────────────────────────────────────
        for subscriber in store.subscribers_with_status(SubscriberStatus::Suspended)? {
            if !ctx.scope.includes(&subscriber) || subscriber.balance > Decimal::ZERO {
                continue;
            }
            let subscriber_id = subscriber.subscriber_id.clone();
            match store.atomically(|s| restore(s, &subscriber_id)) {
                Ok(outcome) => report.absorb(outcome),
                Err(e) => {
                    log::warn!("Restoration of {subscriber_id} failed: {e}");
                    report.errors += 1;
                }
            }
        }

        log::info!(
            "Suspension pass {today}: {} suspended, {} restored, {} corrected, {} frozen, {} device actions decided",
            report.suspended,
            report.restored,
            report.corrected,
            report.skipped_frozen,
            report.device_actions.len()
        );
        Ok(report)
    }
}

impl Default for SuspensionSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

impl CyclePhase for SuspensionSubsystem {
    fn name(&self) -> &'static str {
        "suspension"
    }

    fn run(&mut self, ctx: &CycleContext<'_>) -> BillingResult<PhaseReport> {
        Self::run_pass(ctx)
    }
}

fn suspend_if_due(
    ctx: &CycleContext<'_>,
    store: &BillingStore,
    subscriber_id: &str,
    frozen: bool,
) -> BillingResult<PhaseReport> {
    let mut report = PhaseReport::default();
    let mut subscriber = store.require_subscriber(subscriber_id)?;

    // Safety net: a payment may have landed since the invoices were listed.
    if subscriber.balance <= Decimal::ZERO {
        let (_, events) = apply_credit(store, subscriber_id, ctx.now)?;
        report.events.extend(events);
        for inv in store.overdue_invoices(subscriber_id, ctx.today())? {
            store.set_invoice_status(&inv.invoice_id, InvoiceStatus::Paid)?;
            report.corrected += 1;
            report.events.push(LedgerEvent::OverdueCorrected {
                subscriber_id: subscriber_id.to_string(),
                invoice_id: inv.invoice_id,
            });
        }
        log::debug!("{subscriber_id}: solvent, not suspended");
        return Ok(report);
    }

    if frozen {
        report.skipped_frozen += 1;
        return Ok(report);
    }

    subscriber.status = SubscriberStatus::Suspended;
    store.save_subscriber(&mut subscriber)?;
    report.suspended += 1;
    report.events.push(LedgerEvent::SubscriberSuspended {
        subscriber_id: subscriber_id.to_string(),
        previous_status: SubscriberStatus::Active.as_str().into(),
        reason: format!("overdue with balance {}", subscriber.balance),
    });
    report
        .device_actions
        .push(device_action(&subscriber, ServiceAction::Suspend));
    log::debug!("{subscriber_id}: suspended (balance {})", subscriber.balance);
    Ok(report)
}

fn restore(store: &BillingStore, subscriber_id: &str) -> BillingResult<PhaseReport> {
    let mut report = PhaseReport::default();
    let mut subscriber = store.require_subscriber(subscriber_id)?;
    if subscriber.status != SubscriberStatus::Suspended || subscriber.balance > Decimal::ZERO {
        return Ok(report);
    }
    subscriber.status = SubscriberStatus::Active;
    store.save_subscriber(&mut subscriber)?;
    report.restored += 1;
    report.events.push(LedgerEvent::SubscriberRestored {
        subscriber_id: subscriber_id.to_string(),
        previous_status: SubscriberStatus::Suspended.as_str().into(),
        reason: format!("balance {} settled", subscriber.balance),
    });
    report
        .device_actions
        .push(device_action(&subscriber, ServiceAction::Restore));
    log::debug!("{subscriber_id}: restored");
    Ok(report)
}
