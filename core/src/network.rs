//! Network-service enforcement: the capability contract the engine needs
//! from a device, the vendor registry, and the retry queue contract.
//!
//! RULE: the billing core never branches on vendor name. A router's
//! `vendor` column selects an adapter from the registry; everything else
//! talks to `dyn NetworkServiceAdapter`.
//!
//! Device failures never become `BillingError`s. They are logged, audited
//! as `DeviceActionDeferred` and handed to the `PendingOperationQueue`.

use crate::{
    error::BillingResult,
    event::{LedgerEvent, ServiceAction},
    store::{BillingStore, RouterRow},
    types::EntityId,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device '{device_id}' unreachable: {reason}")]
    Unreachable { device_id: EntityId, reason: String },

    #[error("device '{device_id}' rejected {action} for '{subscriber_ref}'")]
    Rejected {
        device_id: EntityId,
        subscriber_ref: String,
        action: &'static str,
    },

    #[error("device '{device_id}' failed: {reason}")]
    Command { device_id: EntityId, reason: String },

    #[error("no adapter registered for vendor '{0}'")]
    NoAdapter(String),

    #[error("subscriber has no network device")]
    NoDevice,

    #[error("device '{0}' not found")]
    UnknownDevice(EntityId),
}

/// An open connection to one device. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub device_id: EntityId,
    pub handle: String,
}

/// One vendor's device API. Implementations must treat suspend/restore of a
/// subscriber already in the target state as a successful no-op.
pub trait NetworkServiceAdapter: Send + Sync {
    fn vendor(&self) -> &str;

    fn connect(&self, device: &RouterRow) -> Result<Session, DeviceError>;

    /// `Ok(false)` means the device answered but did not apply the change.
    fn suspend(&self, session: &Session, subscriber_ref: &str) -> Result<bool, DeviceError>;

    fn restore(&self, session: &Session, subscriber_ref: &str) -> Result<bool, DeviceError>;

    fn disconnect(&self, session: Session);
}

/// Logs instead of touching hardware. Used by the runner when no vendor
/// integration is configured.
pub struct DryRunAdapter;

impl NetworkServiceAdapter for DryRunAdapter {
    fn vendor(&self) -> &str {
        "dry-run"
    }

    fn connect(&self, device: &RouterRow) -> Result<Session, DeviceError> {
        log::info!("[dry-run] connect {} ({})", device.router_id, device.host);
        Ok(Session {
            device_id: device.router_id.clone(),
            handle: format!("dry-run:{}", device.host),
        })
    }

    fn suspend(&self, session: &Session, subscriber_ref: &str) -> Result<bool, DeviceError> {
        log::info!("[dry-run] suspend {subscriber_ref} on {}", session.device_id);
        Ok(true)
    }

    fn restore(&self, session: &Session, subscriber_ref: &str) -> Result<bool, DeviceError> {
        log::info!("[dry-run] restore {subscriber_ref} on {}", session.device_id);
        Ok(true)
    }

    fn disconnect(&self, session: Session) {
        log::info!("[dry-run] disconnect {}", session.device_id);
    }
}

/// Vendor name → adapter, with an optional fallback for unknown vendors.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn NetworkServiceAdapter>>,
    fallback: Option<Arc<dyn NetworkServiceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn NetworkServiceAdapter>) {
        self.adapters
            .insert(adapter.vendor().to_ascii_lowercase(), adapter);
    }

    pub fn with_fallback(mut self, adapter: Arc<dyn NetworkServiceAdapter>) -> Self {
        self.fallback = Some(adapter);
        self
    }

    pub fn for_vendor(&self, vendor: &str) -> Option<Arc<dyn NetworkServiceAdapter>> {
        self.adapters
            .get(&vendor.to_ascii_lowercase())
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}

// ── Retry queue contract ───────────────────────────────────────────

/// A physical action that could not be applied and must be replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub subscriber_id: EntityId,
    pub device_id: Option<EntityId>,
    pub kind: ServiceAction,
    pub attributes: serde_json::Value,
    pub last_error: Option<String>,
}

pub trait PendingOperationQueue {
    fn enqueue(&self, op: &PendingOperation, now: NaiveDateTime) -> BillingResult<i64>;
}

// ── Enforcement ────────────────────────────────────────────────────

/// One subscriber's physical action decided by a ledger operation or a
/// suspension pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAction {
    pub subscriber_id: EntityId,
    pub service_ref: String,
    pub device_id: Option<EntityId>,
    pub action: ServiceAction,
}

/// What a device did with one action.
#[derive(Debug, Clone)]
pub struct DeviceOutcome {
    pub action: DeviceAction,
    pub result: Result<(), DeviceError>,
}

#[derive(Debug, Default)]
pub struct Enforcement {
    pub applied: u32,
    pub deferred: u32,
    pub events: Vec<LedgerEvent>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DrainReport {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
}

/// Drives the adapters for a batch of decided actions.
///
/// Actions are grouped per device so each device sees exactly one
/// connect/disconnect pair per batch. A device that cannot be reached
/// defers every action addressed to it; other devices are unaffected.
///
/// Device calls may block for as long as the adapter lets them, so they are
/// never made inside a store transaction: `drive` only reads router rows,
/// and the outcomes are persisted afterwards by `record`.
pub struct ServiceEnforcer {
    registry: AdapterRegistry,
}

impl ServiceEnforcer {
    pub fn new(registry: AdapterRegistry) -> Self {
        Self { registry }
    }

    pub fn dry_run() -> Self {
        Self::new(AdapterRegistry::new().with_fallback(Arc::new(DryRunAdapter)))
    }

    /// Call the devices. Returns one outcome per action, in input order.
    pub fn drive(&self, store: &BillingStore, actions: &[DeviceAction]) -> Vec<DeviceOutcome> {
        let mut by_device: BTreeMap<Option<&str>, Vec<usize>> = BTreeMap::new();
        for (i, action) in actions.iter().enumerate() {
            by_device
                .entry(action.device_id.as_deref())
                .or_default()
                .push(i);
        }

        let mut results: Vec<Option<Result<(), DeviceError>>> = vec![None; actions.len()];
        for (device_id, indices) in by_device {
            let batch: Vec<&DeviceAction> = indices.iter().map(|&i| &actions[i]).collect();
            for (i, result) in indices.into_iter().zip(self.run_on_device(store, device_id, &batch)) {
                results[i] = Some(result);
            }
        }

        actions
            .iter()
            .zip(results)
            .map(|(action, result)| DeviceOutcome {
                action: action.clone(),
                result: result.unwrap_or(Err(DeviceError::NoDevice)),
            })
            .collect()
    }

    /// Queue every failed outcome for retry and describe all of them as
    /// events. Meant to run inside one short transaction.
    pub fn record(
        queue: &dyn PendingOperationQueue,
        outcomes: &[DeviceOutcome],
        now: NaiveDateTime,
    ) -> BillingResult<Enforcement> {
        let mut out = Enforcement::default();
        for DeviceOutcome { action, result } in outcomes {
            match result {
                Ok(()) => {
                    out.applied += 1;
                    if let Some(device_id) = &action.device_id {
                        out.events.push(LedgerEvent::DeviceActionApplied {
                            subscriber_id: action.subscriber_id.clone(),
                            device_id: device_id.clone(),
                            action: action.action,
                        });
                    }
                }
                Err(e) => {
                    log::warn!(
                        "{} for {} deferred: {e}",
                        action.action.as_str(),
                        action.subscriber_id
                    );
                    queue.enqueue(
                        &PendingOperation {
                            subscriber_id: action.subscriber_id.clone(),
                            device_id: action.device_id.clone(),
                            kind: action.action,
                            attributes: serde_json::json!({
                                "service_ref": action.service_ref,
                            }),
                            last_error: Some(e.to_string()),
                        },
                        now,
                    )?;
                    out.deferred += 1;
                    out.events.push(LedgerEvent::DeviceActionDeferred {
                        subscriber_id: action.subscriber_id.clone(),
                        device_id: action.device_id.clone(),
                        action: action.action,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(out)
    }

    /// Replay up to `limit` queued operations, oldest first. The devices are
    /// called outside any transaction; the results are written in one.
    pub fn drain(&self, store: &BillingStore, limit: usize) -> BillingResult<DrainReport> {
        let mut op_ids = Vec::new();
        let mut actions = Vec::new();
        for op in store.queued_operations(limit)? {
            // Subscribers queued without a device may have been given one since.
            let device_id = match op.device_id {
                Some(d) => Some(d),
                None => store.subscriber(&op.subscriber_id)?.and_then(|s| s.router_id),
            };
            let service_ref = op
                .attributes
                .get("service_ref")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| op.subscriber_id.clone());
            op_ids.push(op.op_id);
            actions.push(DeviceAction {
                subscriber_id: op.subscriber_id,
                service_ref,
                device_id,
                action: op.kind,
            });
        }

        let outcomes = self.drive(store, &actions);
        let report = store.atomically(|s| {
            let mut report = DrainReport::default();
            for (op_id, outcome) in op_ids.iter().zip(&outcomes) {
                report.attempted += 1;
                match &outcome.result {
                    Ok(()) => {
                        s.mark_operation_done(*op_id)?;
                        report.succeeded += 1;
                    }
                    Err(e) => {
                        s.record_operation_failure(*op_id, &e.to_string())?;
                        report.failed += 1;
                    }
                }
            }
            Ok(report)
        })?;
        log::info!(
            "Drained {} pending operations: {} done, {} still queued",
            report.attempted,
            report.succeeded,
            report.failed
        );
        Ok(report)
    }

    /// One connect, every action, one disconnect. Returns one result per
    /// action in input order.
    fn run_on_device(
        &self,
        store: &BillingStore,
        device_id: Option<&str>,
        batch: &[&DeviceAction],
    ) -> Vec<Result<(), DeviceError>> {
        let fail_all =
            |e: DeviceError| -> Vec<Result<(), DeviceError>> { batch.iter().map(|_| Err(e.clone())).collect() };

        let Some(device_id) = device_id else {
            return fail_all(DeviceError::NoDevice);
        };
        let router = match store.router(device_id) {
            Ok(Some(router)) => router,
            Ok(None) => return fail_all(DeviceError::UnknownDevice(device_id.to_string())),
            Err(e) => {
                return fail_all(DeviceError::Command {
                    device_id: device_id.to_string(),
                    reason: format!("router lookup failed: {e}"),
                })
            }
        };
        let Some(adapter) = self.registry.for_vendor(&router.vendor) else {
            return fail_all(DeviceError::NoAdapter(router.vendor.clone()));
        };
        let session = match adapter.connect(&router) {
            Ok(s) => s,
            Err(e) => return fail_all(e),
        };

        let results = batch
            .iter()
            .map(|action| -> Result<(), DeviceError> {
                let applied = match action.action {
                    ServiceAction::Suspend => adapter.suspend(&session, &action.service_ref),
                    ServiceAction::Restore => adapter.restore(&session, &action.service_ref),
                }?;
                if applied {
                    Ok(())
                } else {
                    Err(DeviceError::Rejected {
                        device_id: router.router_id.clone(),
                        subscriber_ref: action.service_ref.clone(),
                        action: action.action.as_str(),
                    })
                }
            })
            .collect();
        adapter.disconnect(session);
        results
    }
}
