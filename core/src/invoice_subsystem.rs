//! Invoice subsystem: one invoice per subscriber per calendar month.
//!
//! Execution order: first phase of the daily cycle.
//!
//! Design:
//!   - Price: the subscriber's plan if it is active, else the stored flat fee.
//!     A price ≤ 0 issues nothing.
//!   - Calendar: router billing day / grace period, then the zone's, then
//!     the configured defaults. The day is clamped to the month.
//!   - Re-running for a period skips subscribers already invoiced for it.
//!   - Each subscriber runs in its own savepoint; a failure rolls back that
//!     subscriber only and is counted as a soft error.
//!   - Pending invoices whose issue date has arrived are promoted to unpaid.

use crate::{
    error::{BillingError, BillingResult},
    event::LedgerEvent,
    payment_ledger::{apply_credit, release_allocations},
    store::{BillingStore, InvoiceLineRow, InvoiceRow, InvoiceStatus, SubscriberRow},
    subsystem::{CycleContext, CyclePhase, PhaseReport},
    types::{Money, Period},
};
use chrono::Duration;
use rust_decimal::Decimal;

pub struct InvoiceSubsystem;

impl InvoiceSubsystem {
    pub fn new() -> Self {
        Self
    }

    /// Issue this period's invoices for every eligible subscriber in scope.
    pub fn generate_cycle(ctx: &CycleContext<'_>, period: Period) -> BillingResult<PhaseReport> {
        let store = ctx.store;
        let today = ctx.today();
        let mut report = PhaseReport::default();

        for inv in store.issuable_pending_invoices(today)? {
            let in_scope = store
                .subscriber(&inv.subscriber_id)?
                .is_some_and(|s| ctx.scope.includes(&s));
            if !in_scope {
                continue;
            }
            store.set_invoice_status(&inv.invoice_id, InvoiceStatus::Unpaid)?;
            report.invoices_promoted += 1;
            report.events.push(LedgerEvent::InvoiceStatusChanged {
                invoice_id: inv.invoice_id.clone(),
                subscriber_id: inv.subscriber_id.clone(),
                from: InvoiceStatus::Pending.as_str().into(),
                to: InvoiceStatus::Unpaid.as_str().into(),
                cause: "issue_date_reached".into(),
            });
        }

        let exchange_rate = ctx
            .rates
            .rate(&ctx.config.ledger_currency, &ctx.config.reporting_currency)?;

        for subscriber in store.billable_subscribers()? {
            if !ctx.scope.includes(&subscriber) {
                continue;
            }
            if store
                .invoice_for_period(&subscriber.subscriber_id, period)?
                .is_some()
            {
                continue;
            }
            let result = store.atomically(|s| issue_invoice(ctx, s, &subscriber, period, exchange_rate));
            match result {
                Ok(Some(events)) => {
                    report.invoices_issued += 1;
                    report.events.extend(events);
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Invoice for {} ({period}) failed: {e}", subscriber.subscriber_id);
                    report.errors += 1;
                }
            }
        }

        log::info!(
            "Invoice generation {period}: {} issued, {} promoted, {} errors",
            report.invoices_issued,
            report.invoices_promoted,
            report.errors
        );
        Ok(report)
    }

    /// Cancel an invoice. Its allocations return to credit, its total leaves
    /// the balance and the credit is re-applied. Paid invoices may be
    /// cancelled too; their coverage becomes credit.
    pub fn cancel_invoice(
        ctx: &CycleContext<'_>,
        invoice_id: &str,
        reason: &str,
    ) -> BillingResult<PhaseReport> {
        let store = ctx.store;
        let inv = store
            .invoice(invoice_id)?
            .ok_or_else(|| BillingError::InvoiceNotFound(invoice_id.to_string()))?;
        if inv.status == InvoiceStatus::Cancelled {
            return Err(BillingError::InvoiceAlreadyCancelled(invoice_id.to_string()));
        }
        let mut subscriber = store
            .subscriber(&inv.subscriber_id)?
            .ok_or_else(|| BillingError::SubscriberNotFound(inv.subscriber_id.clone()))?;

        release_allocations(store, invoice_id)?;
        store.set_invoice_status(invoice_id, InvoiceStatus::Cancelled)?;

        let previous = subscriber.balance;
        subscriber.balance -= inv.total_amount;
        store.save_subscriber(&mut subscriber)?;

        let mut report = PhaseReport::default();
        report.events.push(LedgerEvent::InvoiceCancelled {
            invoice_id: invoice_id.to_string(),
            subscriber_id: inv.subscriber_id.clone(),
            amount: inv.total_amount,
            reason: reason.to_string(),
        });
        report.events.push(LedgerEvent::BalanceChanged {
            subscriber_id: inv.subscriber_id.clone(),
            previous,
            new: subscriber.balance,
            cause: "invoice_cancelled".into(),
        });
        let (_, events) = apply_credit(store, &inv.subscriber_id, ctx.now)?;
        report.events.extend(events);
        log::info!("Invoice {invoice_id} cancelled: {reason}");
        Ok(report)
    }
}

impl Default for InvoiceSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

impl CyclePhase for InvoiceSubsystem {
    fn name(&self) -> &'static str {
        "invoice_generation"
    }

    fn run(&mut self, ctx: &CycleContext<'_>) -> BillingResult<PhaseReport> {
        Self::generate_cycle(ctx, ctx.period())
    }
}

/// Issue one subscriber's invoice. `Ok(None)` when the price is not positive.
fn issue_invoice(
    ctx: &CycleContext<'_>,
    store: &BillingStore,
    subscriber: &SubscriberRow,
    period: Period,
    exchange_rate: Decimal,
) -> BillingResult<Option<Vec<LedgerEvent>>> {
    let (price, description) = resolve_price(store, subscriber, period)?;
    if price <= Decimal::ZERO {
        log::debug!("{}: price {price} ≤ 0, nothing to invoice", subscriber.subscriber_id);
        return Ok(None);
    }
    let (billing_day, grace_days) = resolve_calendar(ctx, store, subscriber)?;
    let issue_date = period.clamped_day(billing_day);
    let due_date = issue_date + Duration::days(i64::from(grace_days));
    let today = ctx.today();

    let seq = store.next_invoice_seq()?;
    let inv = InvoiceRow {
        invoice_id: format!("INV-{}-{seq:06}", period.key().replace('-', "")),
        subscriber_id: subscriber.subscriber_id.clone(),
        period,
        issue_date,
        due_date,
        subtotal: price,
        total_amount: price,
        status: if issue_date > today {
            InvoiceStatus::Pending
        } else {
            InvoiceStatus::Unpaid
        },
        currency: ctx.config.ledger_currency.clone(),
        exchange_rate,
        seq,
        applied: Decimal::ZERO,
    };
    let lines = [InvoiceLineRow {
        line_no: 1,
        kind: "plan".into(),
        description,
        amount: price,
    }];
    store.insert_invoice(&inv, &lines, ctx.now)?;

    // Re-read: the row may have changed since the batch listing.
    let mut fresh = store.require_subscriber(&subscriber.subscriber_id)?;
    let previous = fresh.balance;
    fresh.balance += price;
    store.save_subscriber(&mut fresh)?;

    let mut events = vec![
        LedgerEvent::InvoiceIssued {
            invoice_id: inv.invoice_id.clone(),
            subscriber_id: inv.subscriber_id.clone(),
            period: period.key(),
            amount: price,
        },
        LedgerEvent::BalanceChanged {
            subscriber_id: inv.subscriber_id.clone(),
            previous,
            new: fresh.balance,
            cause: "invoice_issued".into(),
        },
    ];
    let (_, credit_events) = apply_credit(store, &inv.subscriber_id, ctx.now)?;
    events.extend(credit_events);
    log::debug!(
        "{} invoiced {price} for {period}, due {due_date}",
        inv.subscriber_id
    );
    Ok(Some(events))
}

fn resolve_price(
    store: &BillingStore,
    subscriber: &SubscriberRow,
    period: Period,
) -> BillingResult<(Money, String)> {
    if let Some(plan_id) = &subscriber.plan_id {
        if let Some(plan) = store.plan(plan_id)? {
            if plan.active {
                return Ok((plan.price, format!("{} {period}", plan.name)));
            }
        }
    }
    Ok((subscriber.monthly_fee, format!("Monthly service {period}")))
}

fn resolve_calendar(
    ctx: &CycleContext<'_>,
    store: &BillingStore,
    subscriber: &SubscriberRow,
) -> BillingResult<(u32, u32)> {
    let router = match &subscriber.router_id {
        Some(id) => store.router(id)?,
        None => None,
    };
    let zone_id = subscriber
        .zone_id
        .clone()
        .or_else(|| router.as_ref().and_then(|r| r.zone_id.clone()));
    let zone = match &zone_id {
        Some(id) => store.zone(id)?,
        None => None,
    };
    let defaults = &ctx.config.calendar;
    let billing_day = router
        .as_ref()
        .and_then(|r| r.billing_day)
        .or_else(|| zone.as_ref().and_then(|z| z.billing_day))
        .unwrap_or(defaults.default_billing_day);
    let grace = router
        .as_ref()
        .and_then(|r| r.grace_period_days)
        .or_else(|| zone.as_ref().and_then(|z| z.grace_period_days))
        .unwrap_or(defaults.default_grace_period_days);
    Ok((billing_day, grace))
}
