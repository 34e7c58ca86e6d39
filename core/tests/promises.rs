//! Payment promises granted by collectors.

mod common;

use common::{d, Harness};
use netbill_core::{
    error::BillingError,
    payment_ledger::PaymentRequest,
    scope::BillingScope,
    store::{NewSubscriber, PromiseStatus, SubscriberStatus},
    types::Period,
};
use rust_decimal_macros::dec;

/// s1 owes 30 for April, due 2026-04-06; the clock is on 2026-04-07.
fn overdue() -> Harness {
    let h = Harness::on(d(2026, 4, 1));
    h.subscriber(NewSubscriber::new("s1", dec!(30)));
    h.engine
        .generate_cycle(Period::new(2026, 4).unwrap(), &BillingScope::all())
        .unwrap();
    h.set_date(d(2026, 4, 7));
    h
}

fn promise_status(h: &Harness) -> PromiseStatus {
    h.engine.store().promises_for_subscriber("s1").unwrap()[0].status
}

#[test]
fn promise_in_the_past_is_rejected() {
    let h = overdue();
    let err = h
        .engine
        .grant_promise("s1", d(2026, 4, 6), "collector-1")
        .unwrap_err();
    assert!(matches!(err, BillingError::PromiseDateInPast { .. }));
    assert!(h.engine.store().promises_for_subscriber("s1").unwrap().is_empty());
}

#[test]
fn granting_again_moves_the_pending_promise() {
    let h = overdue();
    let first = h.engine.grant_promise("s1", d(2026, 4, 10), "collector-1").unwrap();
    let second = h.engine.grant_promise("s1", d(2026, 4, 14), "collector-2").unwrap();

    assert_eq!(first.promise_id, second.promise_id);
    let promises = h.engine.store().promises_for_subscriber("s1").unwrap();
    assert_eq!(promises.len(), 1);
    assert_eq!(promises[0].promise_date, d(2026, 4, 14));
    assert_eq!(promises[0].granted_by, "collector-2");
    assert_eq!(h.get("s1").promise_date, Some(d(2026, 4, 14)));
}

#[test]
fn promise_protects_through_its_date() {
    let h = overdue();
    h.engine.grant_promise("s1", d(2026, 4, 9), "collector-1").unwrap();

    for day in [7, 8, 9] {
        h.set_date(d(2026, 4, day));
        let report = h.engine.run_suspension_pass(&BillingScope::all()).unwrap();
        assert_eq!(report.suspended, 0, "suspended on day {day}");
    }
    assert_eq!(promise_status(&h), PromiseStatus::Pending);

    h.set_date(d(2026, 4, 10));
    let report = h.engine.run_suspension_pass(&BillingScope::all()).unwrap();
    assert_eq!(report.promises_broken, 1);
    assert_eq!(report.suspended, 1);
    assert_eq!(promise_status(&h), PromiseStatus::Broken);
    let s1 = h.get("s1");
    assert_eq!(s1.status, SubscriberStatus::Suspended);
    assert_eq!(s1.broken_promise_streak, 1);
    assert_eq!(s1.promise_date, None);
}

#[test]
fn payment_on_time_fulfils_and_resets_the_streak() {
    let h = overdue();
    let mut s1 = h.get("s1");
    s1.broken_promise_streak = 2;
    h.engine.store().save_subscriber(&mut s1).unwrap();

    h.engine.grant_promise("s1", d(2026, 4, 9), "collector-1").unwrap();
    h.set_date(d(2026, 4, 9));
    h.engine
        .register_payment(&PaymentRequest::single("s1", dec!(30), "USD", "cash"))
        .unwrap();

    assert_eq!(promise_status(&h), PromiseStatus::Fulfilled);
    let s1 = h.get("s1");
    assert_eq!(s1.broken_promise_streak, 0);
    assert_eq!(s1.promise_date, None);
    assert_eq!(h.engine.store().audit_count("promise_fulfilled").unwrap(), 1);
}

#[test]
fn late_payment_breaks_the_promise() {
    let h = overdue();
    h.engine.grant_promise("s1", d(2026, 4, 8), "collector-1").unwrap();
    h.set_date(d(2026, 4, 9));
    h.engine
        .register_payment(&PaymentRequest::single("s1", dec!(30), "USD", "cash"))
        .unwrap();

    assert_eq!(promise_status(&h), PromiseStatus::Broken);
    assert_eq!(h.get("s1").broken_promise_streak, 1);
}

#[test]
fn consecutive_broken_promises_accumulate() {
    let h = overdue();
    h.engine.grant_promise("s1", d(2026, 4, 8), "collector-1").unwrap();
    h.set_date(d(2026, 4, 9));
    h.engine.run_suspension_pass(&BillingScope::all()).unwrap();

    h.engine.grant_promise("s1", d(2026, 4, 12), "collector-1").unwrap();
    h.set_date(d(2026, 4, 13));
    h.engine.run_suspension_pass(&BillingScope::all()).unwrap();

    assert_eq!(h.get("s1").broken_promise_streak, 2);
    let promises = h.engine.store().promises_for_subscriber("s1").unwrap();
    assert_eq!(promises.len(), 2);
    assert!(promises.iter().all(|p| p.status == PromiseStatus::Broken));
}
