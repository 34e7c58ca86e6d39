//! Shared fixtures for the integration tests: a settable clock, an
//! in-memory engine and a device adapter that records what it was asked.

#![allow(dead_code)]

use chrono::{Duration, NaiveDate};
use netbill_core::{
    clock::{Clock, FixedClock},
    config::BillingConfig,
    network::{AdapterRegistry, DeviceError, NetworkServiceAdapter, ServiceEnforcer, Session},
    store::{
        BillingStore, InvoiceLineRow, InvoiceRow, InvoiceStatus, NewSubscriber, PlanRow,
        RouterRow, SubscriberRow, ZoneRow,
    },
    types::{Money, Period},
    ReconciliationEngine,
};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

pub const VENDOR: &str = "mikrotik";

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// Adapter that logs every call as "connect:r1", "suspend:ref", ... and can
/// be told to refuse connections to some devices.
#[derive(Default)]
pub struct RecordingAdapter {
    calls: Mutex<Vec<String>>,
    unreachable: Mutex<HashSet<String>>,
}

impl RecordingAdapter {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn set_unreachable(&self, device_id: &str, down: bool) {
        let mut set = self.unreachable.lock().unwrap();
        if down {
            set.insert(device_id.to_string());
        } else {
            set.remove(device_id);
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl NetworkServiceAdapter for RecordingAdapter {
    fn vendor(&self) -> &str {
        VENDOR
    }

    fn connect(&self, device: &RouterRow) -> Result<Session, DeviceError> {
        if self.unreachable.lock().unwrap().contains(&device.router_id) {
            return Err(DeviceError::Unreachable {
                device_id: device.router_id.clone(),
                reason: "connection timed out".into(),
            });
        }
        self.record(format!("connect:{}", device.router_id));
        Ok(Session {
            device_id: device.router_id.clone(),
            handle: device.host.clone(),
        })
    }

    fn suspend(&self, _session: &Session, subscriber_ref: &str) -> Result<bool, DeviceError> {
        self.record(format!("suspend:{subscriber_ref}"));
        Ok(true)
    }

    fn restore(&self, _session: &Session, subscriber_ref: &str) -> Result<bool, DeviceError> {
        self.record(format!("restore:{subscriber_ref}"));
        Ok(true)
    }

    fn disconnect(&self, session: Session) {
        self.record(format!("disconnect:{}", session.device_id));
    }
}

pub struct Harness {
    pub engine: ReconciliationEngine,
    pub clock: FixedClock,
    pub device: Arc<RecordingAdapter>,
}

impl Harness {
    /// In-memory engine with the test config, the clock at noon on `date`.
    pub fn on(date: NaiveDate) -> Self {
        init_logging();
        let clock = FixedClock::on(date);
        let device = Arc::new(RecordingAdapter::default());
        let engine = ReconciliationEngine::build_test(
            Box::new(clock.clone()),
            ServiceEnforcer::new(registry_for(&device)),
        )
        .expect("build test engine");
        Self {
            engine,
            clock,
            device,
        }
    }

    /// Same as `on`, with a caller-supplied config.
    pub fn with_config(date: NaiveDate, config: BillingConfig) -> Self {
        Self::with_store(date, BillingStore::in_memory().expect("open store"), config)
    }

    /// Same as `on`, over a caller-supplied store.
    pub fn with_store(date: NaiveDate, store: BillingStore, config: BillingConfig) -> Self {
        init_logging();
        let clock = FixedClock::on(date);
        let device = Arc::new(RecordingAdapter::default());
        store.migrate().expect("migrate");
        let engine = ReconciliationEngine::build(
            store,
            config,
            Box::new(clock.clone()),
            ServiceEnforcer::new(registry_for(&device)),
        );
        Self {
            engine,
            clock,
            device,
        }
    }

    pub fn set_date(&self, date: NaiveDate) {
        self.clock.set(date.and_hms_opt(12, 0, 0).unwrap());
    }

    /// Move past the duplicate-payment window.
    pub fn later(&self) {
        self.clock.advance(Duration::minutes(30));
    }

    pub fn router(&self, router_id: &str, billing_day: Option<u32>, grace: Option<u32>) {
        self.engine
            .store()
            .insert_router(&RouterRow {
                router_id: router_id.into(),
                name: format!("Router {router_id}"),
                vendor: VENDOR.into(),
                host: format!("10.0.0.{}", router_id.len()),
                zone_id: None,
                billing_day,
                grace_period_days: grace,
            })
            .unwrap();
    }

    pub fn zone(&self, zone_id: &str, billing_day: Option<u32>, grace: Option<u32>) {
        self.engine
            .store()
            .insert_zone(&ZoneRow {
                zone_id: zone_id.into(),
                name: format!("Zone {zone_id}"),
                billing_day,
                grace_period_days: grace,
            })
            .unwrap();
    }

    pub fn plan(&self, plan_id: &str, price: Money) {
        self.engine
            .store()
            .insert_plan(&PlanRow {
                plan_id: plan_id.into(),
                name: format!("Plan {plan_id}"),
                price,
                active: true,
            })
            .unwrap();
    }

    pub fn subscriber(&self, new: NewSubscriber) {
        self.engine
            .store()
            .insert_subscriber(&new, self.clock_now())
            .unwrap();
    }

    pub fn get(&self, subscriber_id: &str) -> SubscriberRow {
        self.engine.store().require_subscriber(subscriber_id).unwrap()
    }

    pub fn assert_invariant(&self, subscriber_id: &str) {
        let check = self
            .engine
            .store()
            .check_balance_invariant(subscriber_id)
            .unwrap();
        assert!(
            check.holds(),
            "balance invariant broken for {subscriber_id}: {check:?}"
        );
    }

    /// Seed an unpaid invoice of an arbitrary amount for `period`, as if
    /// imported from an earlier system. Moves the balance with it.
    pub fn seed_invoice(&self, subscriber_id: &str, period: Period, amount: Money) -> String {
        let store = self.engine.store();
        let seq = store.next_invoice_seq().unwrap();
        let invoice_id = format!("INV-{}-{seq:06}", period.key().replace('-', ""));
        let issue_date = period.first_day();
        store
            .insert_invoice(
                &InvoiceRow {
                    invoice_id: invoice_id.clone(),
                    subscriber_id: subscriber_id.into(),
                    period,
                    issue_date,
                    due_date: issue_date + Duration::days(5),
                    subtotal: amount,
                    total_amount: amount,
                    status: InvoiceStatus::Unpaid,
                    currency: "USD".into(),
                    exchange_rate: Decimal::new(3650, 2),
                    seq,
                    applied: Decimal::ZERO,
                },
                &[InvoiceLineRow {
                    line_no: 1,
                    kind: "plan".into(),
                    description: format!("Imported {period}"),
                    amount,
                }],
                self.clock_now(),
            )
            .unwrap();
        let mut subscriber = self.get(subscriber_id);
        subscriber.balance += amount;
        store.save_subscriber(&mut subscriber).unwrap();
        invoice_id
    }

    pub fn clock_now(&self) -> chrono::NaiveDateTime {
        self.clock.now()
    }
}

fn registry_for(device: &Arc<RecordingAdapter>) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(device.clone());
    registry
}

/// RUST_LOG=debug shows the engine's per-subscriber decisions.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A harness over a temporary database file. A second connection can
/// install triggers that make chosen writes fail, and can read back what
/// was actually committed.
pub struct OnDisk {
    harness: Harness,
    path: String,
}

impl OnDisk {
    pub fn on(date: NaiveDate) -> Self {
        let path = std::env::temp_dir()
            .join(format!("netbill-test-{}.db", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned();
        let store = BillingStore::open(&path).expect("open store file");
        let harness = Harness::with_store(date, store, BillingConfig::default_test());
        Self { harness, path }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn connect(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(&self.path).expect("second connection")
    }

    pub fn sql(&self, sql: &str) {
        self.connect().execute_batch(sql).expect("execute");
    }

    /// Evaluate a `SELECT COUNT(*)` through the second connection.
    pub fn count(&self, sql: &str) -> i64 {
        self.connect()
            .query_row(sql, [], |row| row.get(0))
            .expect("count")
    }
}

impl Deref for OnDisk {
    type Target = Harness;

    fn deref(&self) -> &Harness {
        &self.harness
    }
}

impl DerefMut for OnDisk {
    fn deref_mut(&mut self) -> &mut Harness {
        &mut self.harness
    }
}

impl Drop for OnDisk {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", self.path));
        }
    }
}
