use super::{money_col, period_col, BillingStore, InvoiceLineRow, InvoiceRow, InvoiceStatus};
use crate::{error::BillingResult, types::Period};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, OptionalExtension, Row};

const INVOICE_COLUMNS: &str = "invoice_id, subscriber_id, period, issue_date, due_date,
     subtotal, total_amount, status, currency, exchange_rate, seq";

impl BillingStore {
    // ── Invoice ────────────────────────────────────────────────────

    /// Next value of the global issue-order counter.
    pub fn next_invoice_seq(&self) -> BillingResult<i64> {
        let seq: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM invoice",
            [],
            |row| row.get(0),
        )?;
        Ok(seq)
    }

    pub fn insert_invoice(
        &self,
        inv: &InvoiceRow,
        lines: &[InvoiceLineRow],
        now: NaiveDateTime,
    ) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO invoice
             (invoice_id, subscriber_id, period, issue_date, due_date, subtotal,
              total_amount, status, currency, exchange_rate, seq, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                inv.invoice_id,
                inv.subscriber_id,
                inv.period.key(),
                inv.issue_date,
                inv.due_date,
                inv.subtotal.to_string(),
                inv.total_amount.to_string(),
                inv.status,
                inv.currency,
                inv.exchange_rate.to_string(),
                inv.seq,
                now,
            ],
        )?;
        for line in lines {
            self.conn.execute(
                "INSERT INTO invoice_line (invoice_id, line_no, kind, description, amount)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    inv.invoice_id,
                    line.line_no,
                    line.kind,
                    line.description,
                    line.amount.to_string(),
                ],
            )?;
        }
        Ok(())
    }

    pub fn invoice(&self, invoice_id: &str) -> BillingResult<Option<InvoiceRow>> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoice WHERE invoice_id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![invoice_id], Self::map_invoice_row)
            .optional()?;
        match row {
            Some(inv) => Ok(Some(self.with_applied(inv)?)),
            None => Ok(None),
        }
    }

    pub fn invoice_for_period(
        &self,
        subscriber_id: &str,
        period: Period,
    ) -> BillingResult<Option<InvoiceRow>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoice WHERE subscriber_id = ?1 AND period = ?2"
        );
        let row = self
            .conn
            .query_row(&sql, params![subscriber_id, period.key()], Self::map_invoice_row)
            .optional()?;
        match row {
            Some(inv) => Ok(Some(self.with_applied(inv)?)),
            None => Ok(None),
        }
    }

    pub fn invoice_lines(&self, invoice_id: &str) -> BillingResult<Vec<InvoiceLineRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT line_no, kind, description, amount FROM invoice_line
             WHERE invoice_id = ?1 ORDER BY line_no ASC",
        )?;
        let rows = stmt
            .query_map(params![invoice_id], |row| {
                Ok(InvoiceLineRow {
                    line_no: row.get(0)?,
                    kind: row.get(1)?,
                    description: row.get(2)?,
                    amount: money_col(row, 3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Open (pending or unpaid) invoices of one subscriber, oldest first.
    pub fn open_invoices(&self, subscriber_id: &str) -> BillingResult<Vec<InvoiceRow>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoice
             WHERE subscriber_id = ?1 AND status IN ('pending', 'unpaid')
             ORDER BY issue_date ASC, seq ASC"
        );
        self.query_invoices(&sql, params![subscriber_id])
    }

    /// Open invoices of every subscriber for one period, in issue order.
    pub fn open_invoices_for_period(&self, period: Period) -> BillingResult<Vec<InvoiceRow>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoice
             WHERE period = ?1 AND status IN ('pending', 'unpaid')
             ORDER BY seq ASC"
        );
        self.query_invoices(&sql, params![period.key()])
    }

    /// Open invoices whose due date is strictly before `today`.
    pub fn overdue_invoices(
        &self,
        subscriber_id: &str,
        today: NaiveDate,
    ) -> BillingResult<Vec<InvoiceRow>> {
        Ok(self
            .open_invoices(subscriber_id)?
            .into_iter()
            .filter(|inv| inv.due_date < today)
            .collect())
    }

    /// Subscribers that hold at least one open invoice past its due date.
    pub fn subscribers_with_overdue_invoices(
        &self,
        today: NaiveDate,
    ) -> BillingResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT subscriber_id FROM invoice
             WHERE status IN ('pending', 'unpaid') AND due_date < ?1
             ORDER BY subscriber_id ASC",
        )?;
        let rows = stmt
            .query_map(params![today], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Pending invoices whose issue date has arrived.
    pub fn issuable_pending_invoices(&self, today: NaiveDate) -> BillingResult<Vec<InvoiceRow>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoice
             WHERE status = 'pending' AND issue_date <= ?1
             ORDER BY seq ASC"
        );
        self.query_invoices(&sql, params![today])
    }

    pub fn invoices_for_subscriber(&self, subscriber_id: &str) -> BillingResult<Vec<InvoiceRow>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoice WHERE subscriber_id = ?1
             ORDER BY issue_date ASC, seq ASC"
        );
        self.query_invoices(&sql, params![subscriber_id])
    }

    pub fn update_invoice_total(
        &self,
        invoice_id: &str,
        total_amount: crate::types::Money,
    ) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE invoice SET total_amount = ?1 WHERE invoice_id = ?2",
            params![total_amount.to_string(), invoice_id],
        )?;
        Ok(())
    }

    pub fn set_invoice_status(&self, invoice_id: &str, status: InvoiceStatus) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE invoice SET status = ?1 WHERE invoice_id = ?2",
            params![status, invoice_id],
        )?;
        Ok(())
    }

    pub fn invoice_count(&self) -> BillingResult<i64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM invoice", [], |row| row.get(0))?;
        Ok(n)
    }

    fn query_invoices(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> BillingResult<Vec<InvoiceRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, Self::map_invoice_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(|inv| self.with_applied(inv)).collect()
    }

    fn with_applied(&self, mut inv: InvoiceRow) -> BillingResult<InvoiceRow> {
        inv.applied = self.allocated_to_invoice(&inv.invoice_id)?;
        Ok(inv)
    }

    fn map_invoice_row(row: &Row<'_>) -> rusqlite::Result<InvoiceRow> {
        Ok(InvoiceRow {
            invoice_id: row.get(0)?,
            subscriber_id: row.get(1)?,
            period: period_col(row, 2)?,
            issue_date: row.get(3)?,
            due_date: row.get(4)?,
            subtotal: money_col(row, 5)?,
            total_amount: money_col(row, 6)?,
            status: row.get(7)?,
            currency: row.get(8)?,
            exchange_rate: money_col(row, 9)?,
            seq: row.get(10)?,
            applied: rust_decimal::Decimal::ZERO,
        })
    }
}
