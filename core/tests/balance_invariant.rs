//! Property test: the balance invariant survives any sequence of ledger
//! operations.
//!
//!   balance == Σ outstanding(open invoices) − Σ unallocated(verified payments)

mod common;

use common::{d, Harness};
use netbill_core::{
    payment_ledger::PaymentRequest,
    scope::BillingScope,
    store::NewSubscriber,
    types::Period,
};
use proptest::prelude::*;
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
enum Op {
    /// Advance to the first of the next month and run the daily cycle.
    NextMonth,
    /// Move to a day of the current month and run the daily cycle.
    Day(u32),
    Pay { amount: u32, pending: bool },
    Confirm(usize),
    Revert(usize),
    Cancel(usize),
    Quote,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => Just(Op::NextMonth),
        2 => (1u32..=28).prop_map(Op::Day),
        4 => (1u32..=150, any::<bool>()).prop_map(|(amount, pending)| Op::Pay { amount, pending }),
        1 => (0usize..8).prop_map(Op::Confirm),
        1 => (0usize..8).prop_map(Op::Revert),
        1 => (0usize..8).prop_map(Op::Cancel),
        1 => Just(Op::Quote),
    ]
}

fn apply(h: &mut Harness, month: &mut Period, op: &Op) {
    let store_payments = |h: &Harness| h.engine.store().payments_for_subscriber("s1").unwrap();
    match op {
        Op::NextMonth => {
            *month = if month.month == 12 {
                Period::new(month.year + 1, 1).unwrap()
            } else {
                Period::new(month.year, month.month + 1).unwrap()
            };
            h.set_date(month.first_day());
            h.engine.run_daily_cycle(&BillingScope::all()).unwrap();
        }
        Op::Day(day) => {
            h.set_date(month.clamped_day(*day));
            h.engine.run_daily_cycle(&BillingScope::all()).unwrap();
        }
        Op::Pay { amount, pending } => {
            let mut req = PaymentRequest::single("s1", Decimal::from(*amount), "USD", "cash")
                .authorized()
                .duplicate_allowed()
                .overpayment();
            if *pending {
                req = req.as_pending();
            }
            h.engine.register_payment(&req).unwrap();
        }
        Op::Confirm(i) => {
            let payments = store_payments(h);
            if let Some(p) = payments.get(i % payments.len().max(1)) {
                // Confirming a verified payment is a validation error.
                let _ = h.engine.confirm_payment(&p.payment_id);
            }
        }
        Op::Revert(i) => {
            let payments = store_payments(h);
            if let Some(p) = payments.get(i % payments.len().max(1)) {
                h.engine.revert_payment(&p.payment_id, "test", "prop").unwrap();
            }
        }
        Op::Cancel(i) => {
            let invoices = h.engine.store().invoices_for_subscriber("s1").unwrap();
            if let Some(inv) = invoices.get(i % invoices.len().max(1)) {
                let _ = h.engine.cancel_invoice(&inv.invoice_id, "test");
            }
        }
        Op::Quote => {
            h.engine.quote("s1").unwrap();
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn balance_invariant_holds_after_every_operation(ops in prop::collection::vec(op(), 1..30)) {
        let mut h = Harness::on(d(2026, 1, 1));
        h.router("r1", None, None);
        h.subscriber(NewSubscriber::new("s1", Decimal::from(90)).on_router("r1"));
        let mut month = Period::new(2026, 1).unwrap();
        h.engine.run_daily_cycle(&BillingScope::all()).unwrap();

        for op in &ops {
            apply(&mut h, &mut month, op);
            let check = h.engine.store().check_balance_invariant("s1").unwrap();
            prop_assert!(check.holds(), "after {:?}: {:?}", op, check);
        }
        prop_assert!(h.engine.invariant_violations().unwrap().is_empty());
    }
}
