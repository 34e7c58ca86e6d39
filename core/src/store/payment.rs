use super::{
    money_col, AllocationRow, BillingStore, DeletedPaymentRow, PaymentPartRow, PaymentRow,
    PaymentStatus,
};
use crate::{
    error::BillingResult,
    types::{EntityId, Money},
};
use chrono::NaiveDateTime;
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::Serialize;

const PAYMENT_COLUMNS: &str = "payment_id, subscriber_id, amount, currency, base_amount,
     exchange_rate, fx_variance, tax_amount, method, status, payment_date, reference,
     registered_by, integrity_hash, created_at, activate";

/// Result of checking `balance == Σ outstanding − Σ unallocated credit`.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheck {
    pub subscriber_id: EntityId,
    pub balance: Money,
    pub outstanding: Money,
    pub credit: Money,
}

impl InvariantCheck {
    pub fn expected_balance(&self) -> Money {
        self.outstanding - self.credit
    }

    pub fn holds(&self) -> bool {
        self.balance == self.expected_balance()
    }
}

impl BillingStore {
    // ── Payment ────────────────────────────────────────────────────

    pub fn insert_payment(&self, p: &PaymentRow) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO payment
             (payment_id, subscriber_id, amount, currency, base_amount, exchange_rate,
              fx_variance, tax_amount, method, status, payment_date, reference,
              registered_by, integrity_hash, created_at, activate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                p.payment_id,
                p.subscriber_id,
                p.amount.to_string(),
                p.currency,
                p.base_amount.to_string(),
                p.exchange_rate.to_string(),
                p.fx_variance.to_string(),
                p.tax_amount.to_string(),
                p.method,
                p.status,
                p.payment_date,
                p.reference,
                p.registered_by,
                p.integrity_hash,
                p.created_at,
                p.activate,
            ],
        )?;
        for part in &p.parts {
            self.conn.execute(
                "INSERT INTO payment_part
                 (payment_id, seq, amount, currency, method, exchange_rate, ledger_amount, tax_amount)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    p.payment_id,
                    part.seq,
                    part.amount.to_string(),
                    part.currency,
                    part.method,
                    part.exchange_rate.to_string(),
                    part.ledger_amount.to_string(),
                    part.tax_amount.to_string(),
                ],
            )?;
        }
        Ok(())
    }

    pub fn payment(&self, payment_id: &str) -> BillingResult<Option<PaymentRow>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payment WHERE payment_id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![payment_id], Self::map_payment_row)
            .optional()?;
        match row {
            Some(p) => Ok(Some(self.with_parts(p)?)),
            None => Ok(None),
        }
    }

    pub fn payments_for_subscriber(&self, subscriber_id: &str) -> BillingResult<Vec<PaymentRow>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment WHERE subscriber_id = ?1
             ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![subscriber_id], Self::map_payment_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(|p| self.with_parts(p)).collect()
    }

    /// Most recent non-cancelled payment with the same subscriber, amount
    /// and currency created at or after `since`.
    pub fn recent_matching_payment(
        &self,
        subscriber_id: &str,
        amount: Money,
        currency: &str,
        since: NaiveDateTime,
    ) -> BillingResult<Option<EntityId>> {
        let mut stmt = self.conn.prepare(
            "SELECT payment_id, amount FROM payment
             WHERE subscriber_id = ?1 AND currency = ?2 AND status != 'cancelled'
               AND created_at >= ?3
             ORDER BY created_at DESC, rowid DESC",
        )?;
        let candidates = stmt
            .query_map(params![subscriber_id, currency, since], |row| {
                Ok((row.get::<_, String>(0)?, money_col(row, 1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(candidates
            .into_iter()
            .find(|(_, a)| *a == amount)
            .map(|(id, _)| id))
    }

    pub fn set_payment_status(&self, payment_id: &str, status: PaymentStatus) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE payment SET status = ?1 WHERE payment_id = ?2",
            params![status, payment_id],
        )?;
        Ok(())
    }

    pub fn set_payment_fx_variance(&self, payment_id: &str, fx: Money) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE payment SET fx_variance = ?1 WHERE payment_id = ?2",
            params![fx.to_string(), payment_id],
        )?;
        Ok(())
    }

    /// Remove a payment row with its parts and allocations.
    pub fn delete_payment(&self, payment_id: &str) -> BillingResult<()> {
        self.conn.execute(
            "DELETE FROM payment_allocation WHERE payment_id = ?1",
            params![payment_id],
        )?;
        self.conn.execute(
            "DELETE FROM payment_part WHERE payment_id = ?1",
            params![payment_id],
        )?;
        self.conn
            .execute("DELETE FROM payment WHERE payment_id = ?1", params![payment_id])?;
        Ok(())
    }

    pub fn payment_count(&self) -> BillingResult<i64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM payment", [], |row| row.get(0))?;
        Ok(n)
    }

    // ── Allocation ─────────────────────────────────────────────────

    pub fn insert_allocation(
        &self,
        payment_id: &str,
        invoice_id: &str,
        amount: Money,
        now: NaiveDateTime,
    ) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO payment_allocation (payment_id, invoice_id, amount, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![payment_id, invoice_id, amount.to_string(), now],
        )?;
        Ok(())
    }

    pub fn allocations_for_payment(&self, payment_id: &str) -> BillingResult<Vec<AllocationRow>> {
        self.query_allocations(
            "SELECT allocation_id, payment_id, invoice_id, amount, created_at
             FROM payment_allocation WHERE payment_id = ?1 ORDER BY allocation_id ASC",
            payment_id,
        )
    }

    pub fn allocations_for_invoice(&self, invoice_id: &str) -> BillingResult<Vec<AllocationRow>> {
        self.query_allocations(
            "SELECT allocation_id, payment_id, invoice_id, amount, created_at
             FROM payment_allocation WHERE invoice_id = ?1 ORDER BY allocation_id ASC",
            invoice_id,
        )
    }

    pub fn allocated_to_invoice(&self, invoice_id: &str) -> BillingResult<Money> {
        Ok(self
            .allocations_for_invoice(invoice_id)?
            .iter()
            .map(|a| a.amount)
            .sum())
    }

    pub fn update_allocation_amount(&self, allocation_id: i64, amount: Money) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE payment_allocation SET amount = ?1 WHERE allocation_id = ?2",
            params![amount.to_string(), allocation_id],
        )?;
        Ok(())
    }

    pub fn delete_allocation(&self, allocation_id: i64) -> BillingResult<()> {
        self.conn.execute(
            "DELETE FROM payment_allocation WHERE allocation_id = ?1",
            params![allocation_id],
        )?;
        Ok(())
    }

    /// Verified payments of a subscriber that still carry unallocated money,
    /// oldest first, with the unallocated amount.
    pub fn credit_sources(&self, subscriber_id: &str) -> BillingResult<Vec<(EntityId, Money)>> {
        let mut out = Vec::new();
        for p in self.payments_for_subscriber(subscriber_id)? {
            if p.status != PaymentStatus::Verified {
                continue;
            }
            let allocated: Money = self
                .allocations_for_payment(&p.payment_id)?
                .iter()
                .map(|a| a.amount)
                .sum();
            let unallocated = p.amount - allocated;
            if unallocated > Decimal::ZERO {
                out.push((p.payment_id, unallocated));
            }
        }
        Ok(out)
    }

    /// Recompute the balance invariant for one subscriber from first principles.
    pub fn check_balance_invariant(&self, subscriber_id: &str) -> BillingResult<InvariantCheck> {
        let subscriber = self.require_subscriber(subscriber_id)?;
        let outstanding: Money = self
            .open_invoices(subscriber_id)?
            .iter()
            .map(|inv| inv.total_amount - inv.applied)
            .sum();
        let credit: Money = self
            .credit_sources(subscriber_id)?
            .iter()
            .map(|(_, amount)| *amount)
            .sum();
        Ok(InvariantCheck {
            subscriber_id: subscriber_id.to_string(),
            balance: subscriber.balance,
            outstanding,
            credit,
        })
    }

    fn query_allocations(&self, sql: &str, key: &str) -> BillingResult<Vec<AllocationRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![key], |row| {
                Ok(AllocationRow {
                    allocation_id: row.get(0)?,
                    payment_id: row.get(1)?,
                    invoice_id: row.get(2)?,
                    amount: money_col(row, 3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Deleted-payment archive ────────────────────────────────────

    pub fn archive_payment(&self, d: &DeletedPaymentRow) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO deleted_payment
             (payment_id, subscriber_id, amount, currency, method, status, payment_date,
              integrity_hash, snapshot, reason, deleted_by, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                d.payment_id,
                d.subscriber_id,
                d.amount.to_string(),
                d.currency,
                d.method,
                d.status,
                d.payment_date,
                d.integrity_hash,
                d.snapshot,
                d.reason,
                d.deleted_by,
                d.deleted_at,
            ],
        )?;
        Ok(())
    }

    pub fn deleted_payments_for_subscriber(
        &self,
        subscriber_id: &str,
    ) -> BillingResult<Vec<DeletedPaymentRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT payment_id, subscriber_id, amount, currency, method, status, payment_date,
                    integrity_hash, snapshot, reason, deleted_by, deleted_at
             FROM deleted_payment WHERE subscriber_id = ?1 ORDER BY deleted_at ASC",
        )?;
        let rows = stmt
            .query_map(params![subscriber_id], |row| {
                Ok(DeletedPaymentRow {
                    payment_id: row.get(0)?,
                    subscriber_id: row.get(1)?,
                    amount: money_col(row, 2)?,
                    currency: row.get(3)?,
                    method: row.get(4)?,
                    status: row.get(5)?,
                    payment_date: row.get(6)?,
                    integrity_hash: row.get(7)?,
                    snapshot: row.get(8)?,
                    reason: row.get(9)?,
                    deleted_by: row.get(10)?,
                    deleted_at: row.get(11)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn with_parts(&self, mut p: PaymentRow) -> BillingResult<PaymentRow> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, amount, currency, method, exchange_rate, ledger_amount, tax_amount
             FROM payment_part WHERE payment_id = ?1 ORDER BY seq ASC",
        )?;
        p.parts = stmt
            .query_map(params![p.payment_id], |row| {
                Ok(PaymentPartRow {
                    seq: row.get(0)?,
                    amount: money_col(row, 1)?,
                    currency: row.get(2)?,
                    method: row.get(3)?,
                    exchange_rate: money_col(row, 4)?,
                    ledger_amount: money_col(row, 5)?,
                    tax_amount: money_col(row, 6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(p)
    }

    fn map_payment_row(row: &Row<'_>) -> rusqlite::Result<PaymentRow> {
        Ok(PaymentRow {
            payment_id: row.get(0)?,
            subscriber_id: row.get(1)?,
            amount: money_col(row, 2)?,
            currency: row.get(3)?,
            base_amount: money_col(row, 4)?,
            exchange_rate: money_col(row, 5)?,
            fx_variance: money_col(row, 6)?,
            tax_amount: money_col(row, 7)?,
            method: row.get(8)?,
            status: row.get(9)?,
            payment_date: row.get(10)?,
            reference: row.get(11)?,
            registered_by: row.get(12)?,
            integrity_hash: row.get(13)?,
            created_at: row.get(14)?,
            activate: row.get(15)?,
            parts: Vec::new(),
        })
    }
}
