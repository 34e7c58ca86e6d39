//! Payment ledger: registration guards, FIFO allocation, multi-currency
//! payments, pending confirmation and reversal.

mod common;

use common::{d, Harness};
use netbill_core::{
    currency::RateTable,
    error::BillingError,
    event::ServiceAction,
    integrity::{verify, IntegrityFields},
    payment_ledger::{PaymentRequest, TenderedPart, MIXED},
    scope::BillingScope,
    store::{InvoiceStatus, NewSubscriber, PaymentStatus, SubscriberStatus},
    types::Period,
};
use rust_decimal_macros::dec;

fn april() -> Period {
    Period::new(2026, 4).unwrap()
}

/// "s1" owes a single 100 USD invoice for April.
fn owing_100() -> Harness {
    let h = Harness::on(d(2026, 4, 1));
    h.subscriber(NewSubscriber::new("s1", dec!(100)));
    h.engine.generate_cycle(april(), &BillingScope::all()).unwrap();
    h
}

fn pay(subscriber_id: &str, amount: rust_decimal::Decimal) -> PaymentRequest {
    PaymentRequest::single(subscriber_id, amount, "USD", "cash")
}

fn status_of(h: &Harness, invoice_id: &str) -> InvoiceStatus {
    h.engine.store().invoice(invoice_id).unwrap().unwrap().status
}

// ─────────────────────────────────────────────────────────────────────────────
// Guards
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn partial_payment_needs_authorization() {
    let h = owing_100();

    let err = h.engine.register_payment(&pay("s1", dec!(60))).unwrap_err();
    assert!(matches!(
        err,
        BillingError::PartialPaymentRequiresAuthorization { .. }
    ));
    assert!(err.is_validation());
    assert_eq!(h.engine.store().payment_count().unwrap(), 0);
    assert_eq!(h.get("s1").balance, dec!(100));

    h.engine.register_payment(&pay("s1", dec!(60)).authorized()).unwrap();
    assert_eq!(h.get("s1").balance, dec!(40));
    h.assert_invariant("s1");
}

#[test]
fn guards_run_partial_then_duplicate() {
    let h = owing_100();
    h.engine.register_payment(&pay("s1", dec!(30)).authorized()).unwrap();

    // Both guards would fire; the partial guard is checked first.
    let err = h.engine.register_payment(&pay("s1", dec!(30))).unwrap_err();
    assert_eq!(err.code(), "PARTIAL_PAYMENT_REQUIRES_AUTHORIZATION");

    let err = h
        .engine
        .register_payment(&pay("s1", dec!(30)).authorized())
        .unwrap_err();
    assert!(matches!(err, BillingError::DuplicatePaymentSuspected { .. }));

    h.engine
        .register_payment(&pay("s1", dec!(30)).authorized().duplicate_allowed())
        .unwrap();
    assert_eq!(h.get("s1").balance, dec!(40));
}

#[test]
fn duplicate_window_expires() {
    let h = owing_100();
    h.engine.register_payment(&pay("s1", dec!(40)).authorized()).unwrap();
    h.later();
    h.engine.register_payment(&pay("s1", dec!(40)).authorized()).unwrap();
    assert_eq!(h.get("s1").balance, dec!(20));
}

#[test]
fn nothing_to_pay_unless_overpayment_allowed() {
    let h = owing_100();
    h.subscriber(NewSubscriber::new("s2", dec!(100)));

    let err = h.engine.register_payment(&pay("s2", dec!(10))).unwrap_err();
    assert!(matches!(err, BillingError::NothingToPay { .. }));

    h.engine.register_payment(&pay("s2", dec!(10)).overpayment()).unwrap();
    assert_eq!(h.get("s2").balance, dec!(-10));
    h.assert_invariant("s2");
}

#[test]
fn unknown_subscriber_and_empty_payment_are_rejected() {
    let h = owing_100();
    let err = h.engine.register_payment(&pay("ghost", dec!(10))).unwrap_err();
    assert_eq!(err.code(), "SUBSCRIBER_NOT_FOUND");

    let err = h
        .engine
        .register_payment(&PaymentRequest::mixed("s1", Vec::new()))
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidPayment(_)));

    let err = h.engine.register_payment(&pay("s1", dec!(-5))).unwrap_err();
    assert!(matches!(err, BillingError::InvalidPayment(_)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Allocation
// ─────────────────────────────────────────────────────────────────────────────

/// Three seeded invoices of 30, 50 and 20, oldest first.
fn three_invoices() -> (Harness, Vec<String>) {
    let h = Harness::on(d(2026, 4, 1));
    h.subscriber(NewSubscriber::new("s1", dec!(0)));
    let ids = vec![
        h.seed_invoice("s1", Period::new(2026, 1).unwrap(), dec!(30)),
        h.seed_invoice("s1", Period::new(2026, 2).unwrap(), dec!(50)),
        h.seed_invoice("s1", Period::new(2026, 3).unwrap(), dec!(20)),
    ];
    assert_eq!(h.get("s1").balance, dec!(100));
    (h, ids)
}

#[test]
fn fifo_payment_of_60_settles_only_the_oldest() {
    let (h, ids) = three_invoices();
    h.engine.register_payment(&pay("s1", dec!(60)).authorized()).unwrap();

    assert_eq!(status_of(&h, &ids[0]), InvoiceStatus::Paid);
    assert_eq!(status_of(&h, &ids[1]), InvoiceStatus::Unpaid);
    assert_eq!(status_of(&h, &ids[2]), InvoiceStatus::Unpaid);
    let second = h.engine.store().invoice(&ids[1]).unwrap().unwrap();
    assert_eq!(second.applied, dec!(30));
    assert_eq!(h.get("s1").balance, dec!(40));
    h.assert_invariant("s1");
}

#[test]
fn credit_from_simultaneous_payments_is_used_in_registration_order() {
    let h = Harness::on(d(2026, 4, 1));
    let mut first = Vec::new();
    for id in ["s1", "s2", "s3", "s4", "s5", "s6"] {
        h.subscriber(NewSubscriber::new(id, dec!(30)));
        let a = h.engine.register_payment(&pay(id, dec!(40)).overpayment()).unwrap();
        h.engine
            .register_payment(&pay(id, dec!(40)).overpayment().duplicate_allowed())
            .unwrap();
        first.push((id, a.payment_id));
    }

    h.engine.generate_cycle(april(), &BillingScope::all()).unwrap();
    for (id, payment_id) in &first {
        let payments = h.engine.store().payments_for_subscriber(id).unwrap();
        assert_eq!(&payments[0].payment_id, payment_id);
        let allocations = h.engine.store().allocations_for_payment(payment_id).unwrap();
        assert_eq!(allocations.len(), 1, "{id}: oldest credit not used first");
        assert_eq!(allocations[0].amount, dec!(30));
        assert_eq!(h.get(id).balance, dec!(-50));
        h.assert_invariant(id);
    }
}

#[test]
fn fifo_payment_of_80_settles_the_two_oldest() {
    let (h, ids) = three_invoices();
    h.engine.register_payment(&pay("s1", dec!(80)).authorized()).unwrap();

    assert_eq!(status_of(&h, &ids[0]), InvoiceStatus::Paid);
    assert_eq!(status_of(&h, &ids[1]), InvoiceStatus::Paid);
    assert_eq!(status_of(&h, &ids[2]), InvoiceStatus::Unpaid);
    assert_eq!(h.get("s1").balance, dec!(20));
    h.assert_invariant("s1");
}

#[test]
fn partial_coverage_is_completed_by_the_next_payment() {
    let (h, ids) = three_invoices();
    h.engine.register_payment(&pay("s1", dec!(60)).authorized()).unwrap();
    h.later();
    h.engine.register_payment(&pay("s1", dec!(40))).unwrap();

    for id in &ids {
        assert_eq!(status_of(&h, id), InvoiceStatus::Paid);
    }
    assert_eq!(h.get("s1").balance, dec!(0));
    h.assert_invariant("s1");
}

// ─────────────────────────────────────────────────────────────────────────────
// Currencies, levies and integrity
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn mixed_currency_payment_converts_each_part() {
    let h = owing_100();
    let payment = h
        .engine
        .register_payment(&PaymentRequest::mixed(
            "s1",
            vec![
                TenderedPart {
                    amount: dec!(50),
                    currency: "USD".into(),
                    method: "cash".into(),
                },
                TenderedPart {
                    amount: dec!(1825),
                    currency: "ves".into(),
                    method: "transfer".into(),
                },
            ],
        ))
        .unwrap();

    assert_eq!(payment.amount, dec!(100));
    assert_eq!(payment.currency, MIXED);
    assert_eq!(payment.method, "mixed");
    assert_eq!(payment.parts.len(), 2);
    assert_eq!(payment.parts[1].currency, "VES");
    assert_eq!(payment.parts[1].ledger_amount, dec!(50));
    // The levy applies to the USD part only: 3 % of 50.
    assert_eq!(payment.parts[0].tax_amount, dec!(1.50));
    assert_eq!(payment.parts[1].tax_amount, dec!(0));
    assert_eq!(payment.tax_amount, dec!(1.50));
    assert_eq!(payment.base_amount, dec!(3650));

    assert_eq!(h.get("s1").balance, dec!(0));
    assert_eq!(status_of(&h, "INV-202604-000001"), InvoiceStatus::Paid);
    h.assert_invariant("s1");
}

#[test]
fn fx_variance_reflects_rate_moves_since_issue() {
    let Harness { engine, clock, device } = owing_100();
    let engine = engine.with_rates(Box::new(
        RateTable::default().with_rate("USD", "VES", dec!(40)),
    ));
    let h = Harness { engine, clock, device };

    let payment = h.engine.register_payment(&pay("s1", dec!(100))).unwrap();
    assert_eq!(payment.exchange_rate, dec!(40));
    assert_eq!(payment.base_amount, dec!(4000));
    // 100 allocated × (40 − 36.50)
    assert_eq!(payment.fx_variance, dec!(350));
    let stored = h.engine.store().payment(&payment.payment_id).unwrap().unwrap();
    assert_eq!(stored.fx_variance, dec!(350));
}

#[test]
fn integrity_hash_covers_the_financial_fields() {
    let h = owing_100();
    let payment = h.engine.register_payment(&pay("s1", dec!(100))).unwrap();
    let fields = IntegrityFields {
        amount: payment.amount,
        currency: &payment.currency,
        payment_date: payment.payment_date,
        subscriber_id: &payment.subscriber_id,
        method: &payment.method,
    };
    assert!(verify(&fields, &payment.integrity_hash));

    let edited = IntegrityFields {
        amount: dec!(10),
        ..fields
    };
    assert!(!verify(&edited, &payment.integrity_hash));
}

// ─────────────────────────────────────────────────────────────────────────────
// Pending payments
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn pending_payment_waits_for_confirmation() {
    let h = owing_100();
    let payment = h
        .engine
        .register_payment(&pay("s1", dec!(100)).as_pending())
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(h.get("s1").balance, dec!(100));
    assert_eq!(status_of(&h, "INV-202604-000001"), InvoiceStatus::Unpaid);
    h.assert_invariant("s1");

    let confirmed = h.engine.confirm_payment(&payment.payment_id).unwrap();
    assert_eq!(confirmed.status, PaymentStatus::Verified);
    assert_eq!(h.get("s1").balance, dec!(0));
    assert_eq!(status_of(&h, "INV-202604-000001"), InvoiceStatus::Paid);
    h.assert_invariant("s1");

    let err = h.engine.confirm_payment(&payment.payment_id).unwrap_err();
    assert!(matches!(err, BillingError::PaymentNotPending { .. }));
    assert_eq!(h.engine.store().audit_count("payment_confirmed").unwrap(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Reversal
// ─────────────────────────────────────────────────────────────────────────────

fn reverted_from(h: &Harness, payment_id: &str) -> (Option<String>, Option<String>) {
    let audit = h.engine.store().audit_for_entity("payment", payment_id).unwrap();
    let record = audit
        .into_iter()
        .find(|r| r.operation == "payment_reverted")
        .unwrap();
    (record.previous_state, record.new_state)
}

#[test]
fn reverting_a_verified_payment_restores_the_debt_and_suspends() {
    let h = owing_100();
    let payment = h.engine.register_payment(&pay("s1", dec!(100))).unwrap();
    assert_eq!(h.get("s1").balance, dec!(0));

    let report = h
        .engine
        .revert_payment(&payment.payment_id, "bounced transfer", "supervisor")
        .unwrap();
    assert_eq!(report.suspended, 1);

    let s1 = h.get("s1");
    assert_eq!(s1.balance, dec!(100));
    assert_eq!(s1.status, SubscriberStatus::Suspended);
    assert_eq!(status_of(&h, "INV-202604-000001"), InvoiceStatus::Unpaid);
    assert!(h.engine.store().payment(&payment.payment_id).unwrap().is_none());
    h.assert_invariant("s1");

    let archived = h.engine.store().deleted_payments_for_subscriber("s1").unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].reason, "bounced transfer");
    assert_eq!(archived[0].deleted_by, "supervisor");
    assert_eq!(archived[0].integrity_hash, payment.integrity_hash);
    assert_eq!(
        reverted_from(&h, &payment.payment_id),
        (Some("verified".to_string()), Some("deleted".to_string()))
    );

    // No router: the suspension waits in the retry queue.
    let queued = h.engine.store().pending_operations().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind, ServiceAction::Suspend);
    assert_eq!(queued[0].device_id, None);
}

#[test]
fn reverting_releases_newest_invoice_first() {
    let (h, ids) = three_invoices();
    let first = h.engine.register_payment(&pay("s1", dec!(80)).authorized()).unwrap();
    h.later();
    h.engine.register_payment(&pay("s1", dec!(20))).unwrap();
    for id in &ids {
        assert_eq!(status_of(&h, id), InvoiceStatus::Paid);
    }

    h.engine
        .revert_payment(&first.payment_id, "chargeback", "supervisor")
        .unwrap();
    // The second payment keeps covering the newest invoice.
    assert_eq!(h.get("s1").balance, dec!(80));
    assert_eq!(status_of(&h, &ids[0]), InvoiceStatus::Unpaid);
    assert_eq!(status_of(&h, &ids[1]), InvoiceStatus::Unpaid);
    assert_eq!(status_of(&h, &ids[2]), InvoiceStatus::Paid);
    h.assert_invariant("s1");
}

#[test]
fn reverting_a_pending_payment_changes_nothing_else() {
    let h = owing_100();
    let payment = h
        .engine
        .register_payment(&pay("s1", dec!(100)).as_pending())
        .unwrap();

    let report = h
        .engine
        .revert_payment(&payment.payment_id, "entered twice", "clerk")
        .unwrap();
    assert_eq!(report.suspended, 0);
    let s1 = h.get("s1");
    assert_eq!(s1.balance, dec!(100));
    assert_eq!(s1.status, SubscriberStatus::Active);
    assert_eq!(h.engine.store().deleted_payments_for_subscriber("s1").unwrap().len(), 1);
    assert!(h.engine.store().pending_operations().unwrap().is_empty());
    assert_eq!(
        reverted_from(&h, &payment.payment_id),
        (Some("pending".to_string()), Some("deleted".to_string()))
    );
}

#[test]
fn reverting_unknown_payment_fails() {
    let h = owing_100();
    let err = h.engine.revert_payment("nope", "x", "y").unwrap_err();
    assert!(matches!(err, BillingError::PaymentNotFound(_)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Restoration through payment
// ─────────────────────────────────────────────────────────────────────────────

fn suspended_on_router() -> Harness {
    let h = Harness::on(d(2026, 4, 1));
    h.router("r1", None, None);
    h.subscriber(NewSubscriber::new("s1", dec!(100)).on_router("r1"));
    h.engine.generate_cycle(april(), &BillingScope::all()).unwrap();
    let mut s1 = h.get("s1");
    s1.status = SubscriberStatus::Suspended;
    h.engine.store().save_subscriber(&mut s1).unwrap();
    h
}

#[test]
fn settling_payment_restores_service() {
    let h = suspended_on_router();
    let _ = h.engine.register_payment(&pay("s1", dec!(100))).unwrap();

    assert_eq!(h.get("s1").status, SubscriberStatus::Active);
    assert_eq!(
        h.device.calls(),
        vec!["connect:r1", "restore:s1", "disconnect:r1"]
    );
    assert_eq!(h.engine.store().audit_count("device_action_applied").unwrap(), 1);
}

#[test]
fn partial_payment_restores_only_when_activation_requested() {
    let h = suspended_on_router();
    h.engine.register_payment(&pay("s1", dec!(40)).authorized()).unwrap();
    assert_eq!(h.get("s1").status, SubscriberStatus::Suspended);
    assert!(h.device.calls().is_empty());

    h.later();
    h.engine
        .register_payment(&pay("s1", dec!(10)).authorized().activating())
        .unwrap();
    let s1 = h.get("s1");
    assert_eq!(s1.status, SubscriberStatus::Active);
    assert_eq!(s1.balance, dec!(50));
    assert_eq!(h.device.count("restore:"), 1);
}

#[test]
fn confirming_an_activation_payment_restores_service() {
    let h = suspended_on_router();
    let payment = h
        .engine
        .register_payment(&pay("s1", dec!(40)).authorized().activating().as_pending())
        .unwrap();
    assert!(payment.activate);
    assert_eq!(h.get("s1").status, SubscriberStatus::Suspended);
    assert!(h.device.calls().is_empty());

    h.engine.confirm_payment(&payment.payment_id).unwrap();
    let s1 = h.get("s1");
    assert_eq!(s1.status, SubscriberStatus::Active);
    assert_eq!(s1.balance, dec!(60));
    assert_eq!(
        h.device.calls(),
        vec!["connect:r1", "restore:s1", "disconnect:r1"]
    );
}
