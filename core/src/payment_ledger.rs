//! Payment ledger: registers, confirms and reverts payments.
//!
//! Design:
//!   - Payment money reaches invoices only through allocations
//!     (payment_id, invoice_id, amount). An invoice is `paid` when its
//!     allocations cover its total; partial coverage leaves it open.
//!   - Money of a verified payment that is not allocated is the
//!     subscriber's credit. Credit is applied to the oldest open invoices,
//!     oldest credit first, after every ledger event.
//!   - balance == Σ outstanding(open invoices) − Σ unallocated(verified)
//!     holds after every function in this module returns.
//!   - Guards run before any write: partial → duplicate → nothing to pay.

use crate::{
    currency::convert,
    error::{BillingError, BillingResult},
    event::{LedgerEvent, ServiceAction},
    integrity::{fingerprint, IntegrityFields},
    network::DeviceAction,
    promise_tracker,
    store::{
        BillingStore, DeletedPaymentRow, InvoiceRow, InvoiceStatus, PaymentPartRow, PaymentRow,
        PaymentStatus, SubscriberRow, SubscriberStatus,
    },
    subsystem::{CycleContext, PhaseReport},
    tax::total_levy,
    types::{CurrencyCode, EntityId, Money},
};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Currency label of a payment whose parts were tendered in several currencies.
pub const MIXED: &str = "MIXED";

/// One tendered amount of a (possibly composite) payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenderedPart {
    pub amount: Money,
    pub currency: CurrencyCode,
    pub method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub subscriber_id: EntityId,
    pub parts: Vec<TenderedPart>,
    #[serde(default)]
    pub payment_date: Option<NaiveDate>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default = "default_registered_by")]
    pub registered_by: String,
    /// Record only; accounting waits for `confirm_payment`.
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub authorize_partial: bool,
    #[serde(default)]
    pub allow_duplicate: bool,
    #[serde(default)]
    pub allow_overpayment: bool,
    /// Restore service even if the balance stays positive.
    #[serde(default)]
    pub activate: bool,
}

fn default_registered_by() -> String {
    "system".into()
}

impl PaymentRequest {
    pub fn single(subscriber_id: &str, amount: Money, currency: &str, method: &str) -> Self {
        Self::mixed(
            subscriber_id,
            vec![TenderedPart {
                amount,
                currency: currency.to_string(),
                method: method.to_string(),
            }],
        )
    }

    pub fn mixed(subscriber_id: &str, parts: Vec<TenderedPart>) -> Self {
        Self {
            subscriber_id: subscriber_id.to_string(),
            parts,
            payment_date: None,
            reference: None,
            registered_by: default_registered_by(),
            pending: false,
            authorize_partial: false,
            allow_duplicate: false,
            allow_overpayment: false,
            activate: false,
        }
    }

    pub fn authorized(mut self) -> Self {
        self.authorize_partial = true;
        self
    }

    pub fn duplicate_allowed(mut self) -> Self {
        self.allow_duplicate = true;
        self
    }

    pub fn overpayment(mut self) -> Self {
        self.allow_overpayment = true;
        self
    }

    pub fn as_pending(mut self) -> Self {
        self.pending = true;
        self
    }

    pub fn activating(mut self) -> Self {
        self.activate = true;
        self
    }

    pub fn by(mut self, user: &str) -> Self {
        self.registered_by = user.to_string();
        self
    }

    pub fn dated(mut self, date: NaiveDate) -> Self {
        self.payment_date = Some(date);
        self
    }
}

// ── Register / confirm / revert ────────────────────────────────────

pub fn register_payment(
    ctx: &CycleContext<'_>,
    req: &PaymentRequest,
) -> BillingResult<(PaymentRow, PhaseReport)> {
    if req.parts.is_empty() {
        return Err(BillingError::InvalidPayment("payment has no parts".into()));
    }
    let store = ctx.store;
    let subscriber = store.require_subscriber(&req.subscriber_id)?;
    let scale = ctx.config.money_scale;
    let ledger_currency = ctx.config.ledger_currency.as_str();

    let mut parts = Vec::with_capacity(req.parts.len());
    let mut total = Decimal::ZERO;
    let mut tax_total = Decimal::ZERO;
    for (i, part) in req.parts.iter().enumerate() {
        if part.amount <= Decimal::ZERO {
            return Err(BillingError::InvalidPayment(format!(
                "part {} has non-positive amount {}",
                i + 1,
                part.amount
            )));
        }
        let currency = part.currency.to_ascii_uppercase();
        let (ledger_amount, rate) = convert(ctx.rates, part.amount, &currency, ledger_currency, scale)?;
        let tax_amount = total_levy(&ctx.config.tax, part.amount, &currency, &part.method, scale);
        total += ledger_amount;
        tax_total += ctx.config.round_money(tax_amount * rate);
        parts.push(PaymentPartRow {
            seq: i as u32 + 1,
            amount: part.amount,
            currency,
            method: part.method.clone(),
            exchange_rate: rate,
            ledger_amount,
            tax_amount,
        });
    }
    let currency = uniform(parts.iter().map(|p| p.currency.as_str())).unwrap_or(MIXED).to_string();
    let method = uniform(parts.iter().map(|p| p.method.as_str())).unwrap_or("mixed").to_string();

    // ── Guards, in order ──────────────────────────────────────────
    let debt = subscriber.debt();
    if total < debt && !req.authorize_partial {
        return Err(BillingError::PartialPaymentRequiresAuthorization { amount: total, debt });
    }
    if !req.allow_duplicate {
        let since = ctx.now - Duration::minutes(ctx.config.payments.duplicate_window_minutes);
        if let Some(existing) =
            store.recent_matching_payment(&subscriber.subscriber_id, total, &currency, since)?
        {
            return Err(BillingError::DuplicatePaymentSuspected {
                existing_payment_id: existing,
            });
        }
    }
    if subscriber.balance <= Decimal::ZERO
        && !has_outstanding(store, &subscriber.subscriber_id)?
        && !req.allow_overpayment
    {
        return Err(BillingError::NothingToPay {
            subscriber_id: subscriber.subscriber_id,
        });
    }

    let (base_amount, exchange_rate) = convert(
        ctx.rates,
        total,
        ledger_currency,
        &ctx.config.reporting_currency,
        scale,
    )?;
    let payment_date = req.payment_date.unwrap_or_else(|| ctx.today());
    let integrity_hash = fingerprint(&IntegrityFields {
        amount: total,
        currency: &currency,
        payment_date,
        subscriber_id: &subscriber.subscriber_id,
        method: &method,
    });
    let status = if req.pending {
        PaymentStatus::Pending
    } else {
        PaymentStatus::Verified
    };

    let mut payment = PaymentRow {
        payment_id: uuid::Uuid::new_v4().to_string(),
        subscriber_id: subscriber.subscriber_id.clone(),
        amount: total,
        currency,
        base_amount,
        exchange_rate,
        fx_variance: Decimal::ZERO,
        tax_amount: tax_total,
        method,
        status,
        payment_date,
        reference: req.reference.clone(),
        registered_by: req.registered_by.clone(),
        activate: req.activate,
        integrity_hash,
        created_at: ctx.now,
        parts,
    };
    store.insert_payment(&payment)?;

    let mut report = PhaseReport::default();
    report.events.push(LedgerEvent::PaymentRegistered {
        payment_id: payment.payment_id.clone(),
        subscriber_id: payment.subscriber_id.clone(),
        amount: payment.amount,
        currency: payment.currency.clone(),
        status: status.as_str().to_string(),
    });
    log::info!(
        "Payment {} of {} {} registered for {} ({status})",
        payment.payment_id,
        payment.amount,
        ledger_currency,
        payment.subscriber_id
    );

    if status == PaymentStatus::Verified {
        report.absorb(apply_payment_effects(ctx, &mut payment, req.activate)?);
    }
    Ok((payment, report))
}

/// Move a pending payment to verified and apply its accounting, once.
pub fn confirm_payment(
    ctx: &CycleContext<'_>,
    payment_id: &str,
) -> BillingResult<(PaymentRow, PhaseReport)> {
    let mut payment = ctx
        .store
        .payment(payment_id)?
        .ok_or_else(|| BillingError::PaymentNotFound(payment_id.to_string()))?;
    if payment.status != PaymentStatus::Pending {
        return Err(BillingError::PaymentNotPending {
            payment_id: payment_id.to_string(),
            status: payment.status.as_str().to_string(),
        });
    }
    ctx.store
        .set_payment_status(payment_id, PaymentStatus::Verified)?;
    payment.status = PaymentStatus::Verified;
    let activate = payment.activate;
    let report = apply_payment_effects(ctx, &mut payment, activate)?;
    Ok((payment, report))
}

/// Archive and delete a payment, undoing its accounting.
///
/// A verified payment's allocations are released newest invoice first,
/// its amount returns to the balance, and the subscriber is suspended
/// unconditionally. A payment still pending had no effects to undo.
pub fn revert_payment(
    ctx: &CycleContext<'_>,
    payment_id: &str,
    reason: &str,
    reverted_by: &str,
) -> BillingResult<PhaseReport> {
    let store = ctx.store;
    let payment = store
        .payment(payment_id)?
        .ok_or_else(|| BillingError::PaymentNotFound(payment_id.to_string()))?;
    let mut subscriber = store
        .subscriber(&payment.subscriber_id)?
        .ok_or_else(|| BillingError::SubscriberNotFound(payment.subscriber_id.clone()))?;
    let allocations = store.allocations_for_payment(payment_id)?;

    let snapshot = serde_json::to_string(&serde_json::json!({
        "payment": payment,
        "allocations": allocations,
    }))?;
    store.archive_payment(&DeletedPaymentRow {
        payment_id: payment.payment_id.clone(),
        subscriber_id: payment.subscriber_id.clone(),
        amount: payment.amount,
        currency: payment.currency.clone(),
        method: payment.method.clone(),
        status: payment.status,
        payment_date: payment.payment_date,
        integrity_hash: payment.integrity_hash.clone(),
        snapshot,
        reason: reason.to_string(),
        deleted_by: reverted_by.to_string(),
        deleted_at: ctx.now,
    })?;

    let mut report = PhaseReport::default();
    if payment.status == PaymentStatus::Verified {
        let mut touched: Vec<(InvoiceRow, Vec<i64>)> = Vec::new();
        for alloc in &allocations {
            match touched.iter_mut().find(|(inv, _)| inv.invoice_id == alloc.invoice_id) {
                Some((_, ids)) => ids.push(alloc.allocation_id),
                None => {
                    let inv = store
                        .invoice(&alloc.invoice_id)?
                        .ok_or_else(|| BillingError::InvoiceNotFound(alloc.invoice_id.clone()))?;
                    touched.push((inv, vec![alloc.allocation_id]));
                }
            }
        }
        // Reverse FIFO: newest invoice first.
        touched.sort_by(|(a, _), (b, _)| (b.issue_date, b.seq).cmp(&(a.issue_date, a.seq)));
        for (inv, allocation_ids) in &touched {
            for id in allocation_ids {
                store.delete_allocation(*id)?;
            }
            if inv.status == InvoiceStatus::Paid {
                let reopened = open_status(inv, ctx.today());
                store.set_invoice_status(&inv.invoice_id, reopened)?;
                report.events.push(LedgerEvent::InvoiceStatusChanged {
                    invoice_id: inv.invoice_id.clone(),
                    subscriber_id: inv.subscriber_id.clone(),
                    from: InvoiceStatus::Paid.as_str().into(),
                    to: reopened.as_str().into(),
                    cause: "payment_reverted".into(),
                });
            }
        }

        let previous = subscriber.balance;
        subscriber.balance += payment.amount;
        if subscriber.status != SubscriberStatus::Retired {
            if subscriber.status != SubscriberStatus::Suspended {
                report.events.push(LedgerEvent::SubscriberSuspended {
                    subscriber_id: subscriber.subscriber_id.clone(),
                    previous_status: subscriber.status.as_str().into(),
                    reason: format!("payment {payment_id} reverted"),
                });
                subscriber.status = SubscriberStatus::Suspended;
                report.suspended += 1;
            }
            report.device_actions.push(device_action(&subscriber, ServiceAction::Suspend));
        }
        store.save_subscriber(&mut subscriber)?;
        report.events.push(LedgerEvent::BalanceChanged {
            subscriber_id: subscriber.subscriber_id.clone(),
            previous,
            new: subscriber.balance,
            cause: "payment_reverted".into(),
        });
    }

    store.delete_payment(payment_id)?;
    if payment.status == PaymentStatus::Verified {
        let (_, events) = apply_credit(store, &subscriber.subscriber_id, ctx.now)?;
        report.events.extend(events);
    }

    report.events.push(LedgerEvent::PaymentReverted {
        payment_id: payment_id.to_string(),
        subscriber_id: payment.subscriber_id.clone(),
        amount: payment.amount,
        previous_status: payment.status.as_str().into(),
        reason: reason.to_string(),
        reverted_by: reverted_by.to_string(),
    });
    log::info!(
        "Payment {payment_id} of {} reverted by {reverted_by}: {reason}",
        payment.amount
    );
    Ok(report)
}

/// Balance, promise resolution, credit allocation, fx variance and the
/// restoration trigger, applied when a payment becomes verified.
fn apply_payment_effects(
    ctx: &CycleContext<'_>,
    payment: &mut PaymentRow,
    activate: bool,
) -> BillingResult<PhaseReport> {
    let store = ctx.store;
    let today = ctx.today();
    let mut report = PhaseReport::default();
    let mut subscriber = store.require_subscriber(&payment.subscriber_id)?;

    let previous = subscriber.balance;
    subscriber.balance -= payment.amount;
    report
        .events
        .extend(promise_tracker::resolve_on_payment(store, &mut subscriber, today, ctx.now)?);

    if subscriber.status == SubscriberStatus::Suspended
        && (subscriber.balance <= Decimal::ZERO || activate)
    {
        subscriber.status = SubscriberStatus::Active;
        report.restored += 1;
        report.events.push(LedgerEvent::SubscriberRestored {
            subscriber_id: subscriber.subscriber_id.clone(),
            previous_status: SubscriberStatus::Suspended.as_str().into(),
            reason: if activate {
                "activation requested with payment".into()
            } else {
                format!("payment {} settled the debt", payment.payment_id)
            },
        });
        report.device_actions.push(device_action(&subscriber, ServiceAction::Restore));
    }
    store.save_subscriber(&mut subscriber)?;

    let (allocated, events) = apply_credit(store, &subscriber.subscriber_id, ctx.now)?;
    report.events.extend(events);

    let mut fx_variance = Decimal::ZERO;
    for a in allocated.iter().filter(|a| a.payment_id == payment.payment_id) {
        if let Some(inv) = store.invoice(&a.invoice_id)? {
            fx_variance += a.amount * (payment.exchange_rate - inv.exchange_rate);
        }
    }
    let fx_variance = fx_variance
        .round_dp_with_strategy(ctx.config.money_scale, RoundingStrategy::MidpointAwayFromZero);
    store.set_payment_fx_variance(&payment.payment_id, fx_variance)?;
    payment.fx_variance = fx_variance;

    report.events.push(LedgerEvent::BalanceChanged {
        subscriber_id: subscriber.subscriber_id.clone(),
        previous,
        new: subscriber.balance,
        cause: "payment".into(),
    });
    report.events.push(LedgerEvent::PaymentConfirmed {
        payment_id: payment.payment_id.clone(),
        subscriber_id: subscriber.subscriber_id.clone(),
        amount: payment.amount,
        fx_variance,
    });
    Ok(report)
}

// ── Allocation helpers shared with invoicing and proration ─────────

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Allocated {
    pub payment_id: EntityId,
    pub invoice_id: EntityId,
    pub amount: Money,
}

/// Allocate unallocated credit to open invoices, oldest invoice first and
/// oldest credit first. Invoices whose outstanding reaches zero become paid.
pub(crate) fn apply_credit(
    store: &BillingStore,
    subscriber_id: &str,
    now: NaiveDateTime,
) -> BillingResult<(Vec<Allocated>, Vec<LedgerEvent>)> {
    let mut sources: VecDeque<(EntityId, Money)> = store.credit_sources(subscriber_id)?.into();
    let mut allocated = Vec::new();
    let mut events = Vec::new();

    for inv in store.open_invoices(subscriber_id)? {
        let mut need = inv.total_amount - inv.applied;
        while need > Decimal::ZERO {
            let Some((payment_id, available)) = sources.front_mut() else {
                break;
            };
            let take = need.min(*available);
            store.insert_allocation(payment_id, &inv.invoice_id, take, now)?;
            allocated.push(Allocated {
                payment_id: payment_id.clone(),
                invoice_id: inv.invoice_id.clone(),
                amount: take,
            });
            need -= take;
            *available -= take;
            if *available <= Decimal::ZERO {
                sources.pop_front();
            }
        }
        if need <= Decimal::ZERO {
            store.set_invoice_status(&inv.invoice_id, InvoiceStatus::Paid)?;
            events.push(LedgerEvent::InvoiceStatusChanged {
                invoice_id: inv.invoice_id.clone(),
                subscriber_id: subscriber_id.to_string(),
                from: inv.status.as_str().into(),
                to: InvoiceStatus::Paid.as_str().into(),
                cause: "payment".into(),
            });
        }
    }
    Ok((allocated, events))
}

/// Shrink an invoice's allocations by `excess`, newest allocation first.
/// The trimmed money returns to its payment as credit.
pub(crate) fn trim_allocations(
    store: &BillingStore,
    invoice_id: &str,
    mut excess: Money,
) -> BillingResult<()> {
    for alloc in store.allocations_for_invoice(invoice_id)?.into_iter().rev() {
        if excess <= Decimal::ZERO {
            break;
        }
        if alloc.amount <= excess {
            store.delete_allocation(alloc.allocation_id)?;
            excess -= alloc.amount;
        } else {
            store.update_allocation_amount(alloc.allocation_id, alloc.amount - excess)?;
            excess = Decimal::ZERO;
        }
    }
    Ok(())
}

/// Release every allocation on an invoice back to credit.
pub(crate) fn release_allocations(store: &BillingStore, invoice_id: &str) -> BillingResult<Money> {
    let mut released = Decimal::ZERO;
    for alloc in store.allocations_for_invoice(invoice_id)? {
        store.delete_allocation(alloc.allocation_id)?;
        released += alloc.amount;
    }
    Ok(released)
}

/// Status an open invoice takes: pending until its issue date, then unpaid.
pub(crate) fn open_status(inv: &InvoiceRow, today: NaiveDate) -> InvoiceStatus {
    if inv.issue_date > today {
        InvoiceStatus::Pending
    } else {
        InvoiceStatus::Unpaid
    }
}

pub(crate) fn device_action(subscriber: &SubscriberRow, action: ServiceAction) -> DeviceAction {
    DeviceAction {
        subscriber_id: subscriber.subscriber_id.clone(),
        service_ref: subscriber.service_ref.clone(),
        device_id: subscriber.router_id.clone(),
        action,
    }
}

fn has_outstanding(store: &BillingStore, subscriber_id: &str) -> BillingResult<bool> {
    Ok(store
        .open_invoices(subscriber_id)?
        .iter()
        .any(|inv| inv.outstanding() > Decimal::ZERO))
}

fn uniform<'a>(mut values: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let first = values.next()?;
    values.all(|v| v == first).then_some(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_detects_mixed_values() {
        assert_eq!(uniform(["USD", "USD"].into_iter()), Some("USD"));
        assert_eq!(uniform(["USD", "VES"].into_iter()), None);
        assert_eq!(uniform(std::iter::empty()), None);
    }
}
