use super::{BillingStore, PromiseRow, PromiseStatus};
use crate::error::BillingResult;
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, OptionalExtension, Row};

const PROMISE_COLUMNS: &str =
    "promise_id, subscriber_id, promise_date, status, granted_by, created_at, resolved_at";

impl BillingStore {
    pub fn insert_promise(&self, p: &PromiseRow) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO payment_promise
             (promise_id, subscriber_id, promise_date, status, granted_by, created_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                p.promise_id,
                p.subscriber_id,
                p.promise_date,
                p.status,
                p.granted_by,
                p.created_at,
                p.resolved_at,
            ],
        )?;
        Ok(())
    }

    /// The subscriber's unresolved promise, if any. At most one exists.
    pub fn pending_promise(&self, subscriber_id: &str) -> BillingResult<Option<PromiseRow>> {
        let sql = format!(
            "SELECT {PROMISE_COLUMNS} FROM payment_promise
             WHERE subscriber_id = ?1 AND status = 'pending'
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = self
            .conn
            .query_row(&sql, params![subscriber_id], Self::map_promise_row)
            .optional()?;
        Ok(row)
    }

    pub fn update_promise_date(
        &self,
        promise_id: &str,
        promise_date: NaiveDate,
        granted_by: &str,
    ) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE payment_promise SET promise_date = ?1, granted_by = ?2 WHERE promise_id = ?3",
            params![promise_date, granted_by, promise_id],
        )?;
        Ok(())
    }

    pub fn resolve_promise(
        &self,
        promise_id: &str,
        status: PromiseStatus,
        now: NaiveDateTime,
    ) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE payment_promise SET status = ?1, resolved_at = ?2 WHERE promise_id = ?3",
            params![status, now, promise_id],
        )?;
        Ok(())
    }

    /// Pending promises whose date is strictly before `today`.
    pub fn expired_pending_promises(&self, today: NaiveDate) -> BillingResult<Vec<PromiseRow>> {
        let sql = format!(
            "SELECT {PROMISE_COLUMNS} FROM payment_promise
             WHERE status = 'pending' AND promise_date < ?1
             ORDER BY promise_date ASC, promise_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![today], Self::map_promise_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn promises_for_subscriber(&self, subscriber_id: &str) -> BillingResult<Vec<PromiseRow>> {
        let sql = format!(
            "SELECT {PROMISE_COLUMNS} FROM payment_promise
             WHERE subscriber_id = ?1 ORDER BY created_at ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![subscriber_id], Self::map_promise_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_promise_row(row: &Row<'_>) -> rusqlite::Result<PromiseRow> {
        Ok(PromiseRow {
            promise_id: row.get(0)?,
            subscriber_id: row.get(1)?,
            promise_date: row.get(2)?,
            status: row.get(3)?,
            granted_by: row.get(4)?,
            created_at: row.get(5)?,
            resolved_at: row.get(6)?,
        })
    }
}
