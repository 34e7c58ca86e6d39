//! Promise tracker: collector-granted pay-by dates.
//!
//! pending → fulfilled   payment confirmed on or before the promise date
//! pending → broken      payment confirmed after it, or the date elapsed
//!                       and a suspension pass ran
//!
//! A broken promise increments the subscriber's consecutive-broken counter,
//! a fulfilled one resets it. The counter is informational; nothing in the
//! suspension logic reads it.

use crate::{
    error::{BillingError, BillingResult},
    event::LedgerEvent,
    store::{BillingStore, PromiseRow, PromiseStatus, SubscriberRow},
    subsystem::{CycleContext, PhaseReport},
};
use chrono::{NaiveDate, NaiveDateTime};

/// Create a pending promise, or move the date of the one already pending.
pub fn grant_promise(
    ctx: &CycleContext<'_>,
    subscriber_id: &str,
    promise_date: NaiveDate,
    granted_by: &str,
) -> BillingResult<(PromiseRow, Vec<LedgerEvent>)> {
    let today = ctx.today();
    if promise_date < today {
        return Err(BillingError::PromiseDateInPast {
            promise_date,
            today,
        });
    }
    let mut subscriber = ctx.store.require_subscriber(subscriber_id)?;

    let promise = match ctx.store.pending_promise(subscriber_id)? {
        Some(mut existing) => {
            ctx.store
                .update_promise_date(&existing.promise_id, promise_date, granted_by)?;
            existing.promise_date = promise_date;
            existing.granted_by = granted_by.to_string();
            existing
        }
        None => {
            let row = PromiseRow {
                promise_id: uuid::Uuid::new_v4().to_string(),
                subscriber_id: subscriber_id.to_string(),
                promise_date,
                status: PromiseStatus::Pending,
                granted_by: granted_by.to_string(),
                created_at: ctx.now,
                resolved_at: None,
            };
            ctx.store.insert_promise(&row)?;
            row
        }
    };

    subscriber.promise_date = Some(promise_date);
    ctx.store.save_subscriber(&mut subscriber)?;
    log::debug!("Promise {} for {subscriber_id} until {promise_date}", promise.promise_id);

    let events = vec![LedgerEvent::PromiseGranted {
        promise_id: promise.promise_id.clone(),
        subscriber_id: subscriber_id.to_string(),
        promise_date,
        granted_by: granted_by.to_string(),
    }];
    Ok((promise, events))
}

/// True when a pending promise still covers `today`.
pub fn is_covered(store: &BillingStore, subscriber_id: &str, today: NaiveDate) -> BillingResult<bool> {
    Ok(store
        .pending_promise(subscriber_id)?
        .is_some_and(|p| p.covers(today)))
}

/// Resolve the subscriber's pending promise because a payment was applied.
/// Mutates `subscriber` in memory; the caller saves it.
pub(crate) fn resolve_on_payment(
    store: &BillingStore,
    subscriber: &mut SubscriberRow,
    today: NaiveDate,
    now: NaiveDateTime,
) -> BillingResult<Vec<LedgerEvent>> {
    let Some(promise) = store.pending_promise(&subscriber.subscriber_id)? else {
        subscriber.promise_date = None;
        return Ok(Vec::new());
    };
    subscriber.promise_date = None;

    if today <= promise.promise_date {
        store.resolve_promise(&promise.promise_id, PromiseStatus::Fulfilled, now)?;
        subscriber.broken_promise_streak = 0;
        Ok(vec![LedgerEvent::PromiseFulfilled {
            promise_id: promise.promise_id,
            subscriber_id: subscriber.subscriber_id.clone(),
        }])
    } else {
        store.resolve_promise(&promise.promise_id, PromiseStatus::Broken, now)?;
        subscriber.broken_promise_streak += 1;
        Ok(vec![LedgerEvent::PromiseBroken {
            promise_id: promise.promise_id,
            subscriber_id: subscriber.subscriber_id.clone(),
            streak: subscriber.broken_promise_streak,
        }])
    }
}

/// Break every pending promise whose date is before today.
pub fn expire_promises(ctx: &CycleContext<'_>) -> BillingResult<PhaseReport> {
    let mut report = PhaseReport::default();
    for promise in ctx.store.expired_pending_promises(ctx.today())? {
        let Some(mut subscriber) = ctx.store.subscriber(&promise.subscriber_id)? else {
            continue;
        };
        if subscriber.deleted_at.is_some() || !ctx.scope.includes(&subscriber) {
            continue;
        }
        ctx.store
            .resolve_promise(&promise.promise_id, PromiseStatus::Broken, ctx.now)?;
        subscriber.promise_date = None;
        subscriber.broken_promise_streak += 1;
        ctx.store.save_subscriber(&mut subscriber)?;

        log::debug!(
            "Promise {} of {} expired (streak {})",
            promise.promise_id,
            subscriber.subscriber_id,
            subscriber.broken_promise_streak
        );
        report.promises_broken += 1;
        report.events.push(LedgerEvent::PromiseBroken {
            promise_id: promise.promise_id,
            subscriber_id: subscriber.subscriber_id.clone(),
            streak: subscriber.broken_promise_streak,
        });
    }
    Ok(report)
}
