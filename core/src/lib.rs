//! netbill-core: billing and service-lifecycle reconciliation for an ISP
//! back office.

pub mod clock;
pub mod command;
pub mod config;
pub mod currency;
pub mod engine;
pub mod error;
pub mod event;
pub mod integrity;
pub mod invoice_subsystem;
pub mod network;
pub mod payment_ledger;
pub mod promise_tracker;
pub mod proration_subsystem;
pub mod scope;
pub mod store;
pub mod subsystem;
pub mod suspension_subsystem;
pub mod tax;
pub mod types;

pub use engine::{CycleReport, ReconciliationEngine};
pub use error::{BillingError, BillingResult};
