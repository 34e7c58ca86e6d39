//! Commands accepted by the runner's IPC mode, one JSON object per line.
//! Variants are added over time; never removed or reordered.

use crate::{
    engine::ReconciliationEngine,
    error::{BillingError, BillingResult},
    payment_ledger::PaymentRequest,
    scope::BillingScope,
    types::{EntityId, Period},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum LedgerCommand {
    // ── Cycle ─────────────────────────────────────
    RunCycle {
        #[serde(default)]
        scope: BillingScope,
    },
    GenerateCycle {
        period: String,
        #[serde(default)]
        scope: BillingScope,
    },
    ApplyProration {
        #[serde(default)]
        force: bool,
        #[serde(default)]
        scope: BillingScope,
    },
    SuspensionPass {
        #[serde(default)]
        scope: BillingScope,
    },
    DrainPending {
        #[serde(default = "default_drain_limit")]
        limit: usize,
    },

    // ── Ledger ────────────────────────────────────
    RegisterPayment(PaymentRequest),
    ConfirmPayment {
        payment_id: EntityId,
    },
    RevertPayment {
        payment_id: EntityId,
        reason: String,
        reverted_by: String,
    },
    CancelInvoice {
        invoice_id: EntityId,
        reason: String,
    },
    GrantPromise {
        subscriber_id: EntityId,
        promise_date: NaiveDate,
        granted_by: String,
    },
    Quote {
        subscriber_id: EntityId,
    },

    // ── Queries ───────────────────────────────────
    Subscriber {
        subscriber_id: EntityId,
    },
    Invoices {
        subscriber_id: EntityId,
    },
    Payments {
        subscriber_id: EntityId,
    },
}

fn default_drain_limit() -> usize {
    100
}

/// One response line.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CommandResponse {
    Ok {
        ok: bool,
        result: Value,
    },
    Err {
        ok: bool,
        code: &'static str,
        message: String,
        validation: bool,
    },
}

impl CommandResponse {
    pub fn from_result(result: BillingResult<Value>) -> Self {
        match result {
            Ok(result) => Self::Ok { ok: true, result },
            Err(e) => Self::Err {
                ok: false,
                code: e.code(),
                message: e.to_string(),
                validation: e.is_validation(),
            },
        }
    }
}

pub fn execute(engine: &mut ReconciliationEngine, command: LedgerCommand) -> BillingResult<Value> {
    let value = match command {
        LedgerCommand::RunCycle { scope } => serde_json::to_value(engine.run_daily_cycle(&scope)?)?,
        LedgerCommand::GenerateCycle { period, scope } => {
            let period = Period::parse(&period).ok_or_else(|| {
                BillingError::Other(anyhow::anyhow!("invalid period '{period}', expected YYYY-MM"))
            })?;
            serde_json::to_value(engine.generate_cycle(period, &scope)?)?
        }
        LedgerCommand::ApplyProration { force, scope } => {
            let period = Period::of(engine.today());
            serde_json::to_value(engine.apply_proration(period, &scope, force)?)?
        }
        LedgerCommand::SuspensionPass { scope } => {
            serde_json::to_value(engine.run_suspension_pass(&scope)?)?
        }
        LedgerCommand::DrainPending { limit } => {
            serde_json::to_value(engine.drain_pending_operations(limit)?)?
        }
        LedgerCommand::RegisterPayment(request) => {
            serde_json::to_value(engine.register_payment(&request)?)?
        }
        LedgerCommand::ConfirmPayment { payment_id } => {
            serde_json::to_value(engine.confirm_payment(&payment_id)?)?
        }
        LedgerCommand::RevertPayment {
            payment_id,
            reason,
            reverted_by,
        } => serde_json::to_value(engine.revert_payment(&payment_id, &reason, &reverted_by)?)?,
        LedgerCommand::CancelInvoice { invoice_id, reason } => {
            serde_json::to_value(engine.cancel_invoice(&invoice_id, &reason)?)?
        }
        LedgerCommand::GrantPromise {
            subscriber_id,
            promise_date,
            granted_by,
        } => serde_json::to_value(engine.grant_promise(&subscriber_id, promise_date, &granted_by)?)?,
        LedgerCommand::Quote { subscriber_id } => {
            json!({ "subscriber_id": subscriber_id, "debt": engine.quote(&subscriber_id)? })
        }
        LedgerCommand::Subscriber { subscriber_id } => {
            serde_json::to_value(engine.store().require_subscriber(&subscriber_id)?)?
        }
        LedgerCommand::Invoices { subscriber_id } => {
            serde_json::to_value(engine.store().invoices_for_subscriber(&subscriber_id)?)?
        }
        LedgerCommand::Payments { subscriber_id } => {
            serde_json::to_value(engine.store().payments_for_subscriber(&subscriber_id)?)?
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_commands() {
        let cmd: LedgerCommand =
            serde_json::from_str(r#"{"cmd":"confirm_payment","payment_id":"p1"}"#).unwrap();
        assert!(matches!(cmd, LedgerCommand::ConfirmPayment { payment_id } if payment_id == "p1"));

        let cmd: LedgerCommand = serde_json::from_str(
            r#"{"cmd":"register_payment","subscriber_id":"s1",
                "parts":[{"amount":"10.50","currency":"USD","method":"cash"}],
                "authorize_partial":true}"#,
        )
        .unwrap();
        match cmd {
            LedgerCommand::RegisterPayment(req) => {
                assert_eq!(req.parts.len(), 1);
                assert!(req.authorize_partial);
                assert_eq!(req.registered_by, "system");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn run_cycle_scope_defaults_to_all() {
        let cmd: LedgerCommand = serde_json::from_str(r#"{"cmd":"run_cycle"}"#).unwrap();
        assert!(matches!(cmd, LedgerCommand::RunCycle { scope } if scope == BillingScope::all()));
    }
}
