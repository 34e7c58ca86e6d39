//! Proration subsystem: time-based discount on the current month's invoice.
//!
//! Execution order: after InvoiceSubsystem.
//! Runs from `proration.start_day` onwards unless forced (quote at payment
//! time).
//!
//! Design:
//!   - remaining   = days_in_month − today + 1
//!   - denominator = days_in_month − grace_days
//!   - new_amount  = ceil(original × remaining / denominator)
//!   - `original` is the sum of the invoice's line items, never its
//!     current total, so re-runs converge on the same amount.
//!   - Applied only when new_amount < current total. Totals never rise.
//!   - Subscribers covered by a pending promise are exempt.

use crate::{
    error::BillingResult,
    event::LedgerEvent,
    payment_ledger::{apply_credit, trim_allocations},
    promise_tracker,
    scope::BillingScope,
    store::{BillingStore, InvoiceRow, InvoiceStatus, SubscriberStatus},
    subsystem::{CycleContext, CyclePhase, PhaseReport},
    types::{Money, Period},
};
use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;

/// Discounted amount for `today`, or `None` when no discount applies
/// (another month, or still inside the grace window).
pub fn prorated_amount(
    original: Money,
    period: Period,
    today: NaiveDate,
    grace_days: u32,
) -> Option<Money> {
    if Period::of(today) != period {
        return None;
    }
    let days = period.days_in_month();
    let remaining = days - today.day() + 1;
    let denominator = days.checked_sub(grace_days).filter(|d| *d > 0)?;
    if remaining >= denominator {
        return None;
    }
    let amount = (original * Decimal::from(remaining) / Decimal::from(denominator)).ceil();
    Some(amount.min(original))
}

pub struct ProrationSubsystem {
    force: bool,
}

impl ProrationSubsystem {
    pub fn new() -> Self {
        Self { force: false }
    }

    pub fn forced() -> Self {
        Self { force: true }
    }

    pub fn apply_proration(
        ctx: &CycleContext<'_>,
        period: Period,
        force: bool,
    ) -> BillingResult<PhaseReport> {
        let store = ctx.store;
        let today = ctx.today();
        let mut report = PhaseReport::default();

        if !force && today.day() < ctx.config.proration.start_day {
            log::debug!(
                "Proration skipped: day {} < start day {}",
                today.day(),
                ctx.config.proration.start_day
            );
            return Ok(report);
        }

        for inv in store.open_invoices_for_period(period)? {
            if inv.status != InvoiceStatus::Unpaid {
                continue;
            }
            let Some(subscriber) = store.subscriber(&inv.subscriber_id)? else {
                continue;
            };
            if subscriber.deleted_at.is_some()
                || subscriber.status == SubscriberStatus::Retired
                || !subscriber.billing_enabled
                || !ctx.scope.includes(&subscriber)
            {
                continue;
            }
            if promise_tracker::is_covered(store, &subscriber.subscriber_id, today)? {
                log::debug!("{}: promise active, no proration", subscriber.subscriber_id);
                continue;
            }

            match store.atomically(|s| prorate_invoice(ctx, s, &inv)) {
                Ok(Some(events)) => {
                    report.prorated += 1;
                    report.events.extend(events);
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Proration of {} failed: {e}", inv.invoice_id);
                    report.errors += 1;
                }
            }
        }

        log::info!(
            "Proration {period}: {} invoices reduced, {} errors",
            report.prorated,
            report.errors
        );
        Ok(report)
    }

    /// Forced proration of one subscriber's current invoice. Returns the
    /// debt after the discount.
    pub fn quote(ctx: &CycleContext<'_>, subscriber_id: &str) -> BillingResult<(Money, PhaseReport)> {
        ctx.store.require_subscriber(subscriber_id)?;
        let scope = BillingScope::only_subscriber(subscriber_id);
        let scoped = CycleContext {
            scope: &scope,
            ..*ctx
        };
        let report = Self::apply_proration(&scoped, ctx.period(), true)?;
        let debt = ctx.store.require_subscriber(subscriber_id)?.debt();
        Ok((debt, report))
    }
}

impl Default for ProrationSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

impl CyclePhase for ProrationSubsystem {
    fn name(&self) -> &'static str {
        "proration"
    }

    fn run(&mut self, ctx: &CycleContext<'_>) -> BillingResult<PhaseReport> {
        Self::apply_proration(ctx, ctx.period(), self.force)
    }
}

fn prorate_invoice(
    ctx: &CycleContext<'_>,
    store: &BillingStore,
    listed: &InvoiceRow,
) -> BillingResult<Option<Vec<LedgerEvent>>> {
    let original: Money = store
        .invoice_lines(&listed.invoice_id)?
        .iter()
        .map(|l| l.amount)
        .sum();
    let Some(new_total) =
        prorated_amount(original, listed.period, ctx.today(), ctx.config.proration.grace_days)
    else {
        return Ok(None);
    };
    let Some(inv) = store.invoice(&listed.invoice_id)? else {
        return Ok(None);
    };
    if new_total >= inv.total_amount {
        return Ok(None);
    }

    let delta = inv.total_amount - new_total;
    store.update_invoice_total(&inv.invoice_id, new_total)?;
    let mut events = vec![LedgerEvent::InvoiceProrated {
        invoice_id: inv.invoice_id.clone(),
        subscriber_id: inv.subscriber_id.clone(),
        previous_total: inv.total_amount,
        new_total,
    }];

    // Coverage beyond the new total goes back to its payments as credit.
    if inv.applied >= new_total {
        let excess = inv.applied - new_total;
        if excess > Decimal::ZERO {
            trim_allocations(store, &inv.invoice_id, excess)?;
        }
        store.set_invoice_status(&inv.invoice_id, InvoiceStatus::Paid)?;
        events.push(LedgerEvent::InvoiceStatusChanged {
            invoice_id: inv.invoice_id.clone(),
            subscriber_id: inv.subscriber_id.clone(),
            from: inv.status.as_str().into(),
            to: InvoiceStatus::Paid.as_str().into(),
            cause: "proration".into(),
        });
    }

    let mut subscriber = store.require_subscriber(&inv.subscriber_id)?;
    let previous = subscriber.balance;
    subscriber.balance -= delta;
    store.save_subscriber(&mut subscriber)?;
    events.push(LedgerEvent::BalanceChanged {
        subscriber_id: inv.subscriber_id.clone(),
        previous,
        new: subscriber.balance,
        cause: "proration".into(),
    });

    let (_, credit_events) = apply_credit(store, &inv.subscriber_id, ctx.now)?;
    events.extend(credit_events);
    log::debug!(
        "{} prorated {} -> {new_total}",
        inv.invoice_id,
        inv.total_amount
    );
    Ok(Some(events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn no_discount_inside_grace_window() {
        let period = Period::new(2026, 4).unwrap(); // 30 days
        assert_eq!(prorated_amount(dec!(90000), period, date(2026, 4, 6), 5), None);
    }

    #[test]
    fn discount_scales_with_remaining_days() {
        let period = Period::new(2026, 4).unwrap();
        // remaining 15, denominator 25
        assert_eq!(
            prorated_amount(dec!(90000), period, date(2026, 4, 16), 5),
            Some(dec!(54000))
        );
    }

    #[test]
    fn discount_rounds_up_to_whole_units() {
        let period = Period::new(2026, 4).unwrap();
        // 100 × 15 / 25 = 60; 101 × 15 / 25 = 60.6 → 61
        assert_eq!(prorated_amount(dec!(101), period, date(2026, 4, 16), 5), Some(dec!(61)));
    }

    #[test]
    fn other_months_are_untouched() {
        let period = Period::new(2026, 3).unwrap();
        assert_eq!(prorated_amount(dec!(100), period, date(2026, 4, 20), 5), None);
    }

    #[test]
    fn last_day_keeps_one_day() {
        let period = Period::new(2026, 2).unwrap(); // 28 days, denominator 23
        assert_eq!(prorated_amount(dec!(2300), period, date(2026, 2, 28), 5), Some(dec!(100)));
    }
}
