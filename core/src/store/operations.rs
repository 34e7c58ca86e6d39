use super::{BillingStore, CycleRunRow, OperationStatus, PendingOperationRow, RunStatus};
use crate::{
    error::BillingResult,
    event::{AuditRecord, AuditSink},
    network::{PendingOperation, PendingOperationQueue},
};
use chrono::NaiveDateTime;
use rusqlite::{params, Row};

const OPERATION_COLUMNS: &str =
    "op_id, subscriber_id, device_id, kind, attributes, status, attempts, last_error, created_at";

const CYCLE_RUN_COLUMNS: &str = "run_id, run_date, status, invoices, prorated, suspended,
     restored, error_count, error, started_at, finished_at";

// ── Audit log ──────────────────────────────────────────────────────

impl AuditSink for BillingStore {
    fn append(&self, record: &AuditRecord) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO audit_log
             (operation, category, entity_type, entity_id, description,
              previous_state, new_state, payload, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.operation,
                record.category,
                record.entity_type,
                record.entity_id,
                record.description,
                record.previous_state,
                record.new_state,
                record.payload,
                record.timestamp,
            ],
        )?;
        Ok(())
    }
}

impl BillingStore {
    pub fn audit_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> BillingResult<Vec<AuditRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, operation, category, entity_type, entity_id, description,
                    previous_state, new_state, payload, timestamp
             FROM audit_log WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![entity_type, entity_id], |row| {
                Ok(AuditRecord {
                    id: row.get(0)?,
                    operation: row.get(1)?,
                    category: row.get(2)?,
                    entity_type: row.get(3)?,
                    entity_id: row.get(4)?,
                    description: row.get(5)?,
                    previous_state: row.get(6)?,
                    new_state: row.get(7)?,
                    payload: row.get(8)?,
                    timestamp: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn audit_count(&self, operation: &str) -> BillingResult<i64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE operation = ?1",
            params![operation],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    // ── Pending device operations ──────────────────────────────────

    /// Queued operations, oldest first.
    pub fn queued_operations(&self, limit: usize) -> BillingResult<Vec<PendingOperationRow>> {
        let sql = format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_operation
             WHERE status = 'queued' ORDER BY op_id ASC LIMIT ?1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64], Self::map_operation_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn pending_operations(&self) -> BillingResult<Vec<PendingOperationRow>> {
        let sql = format!("SELECT {OPERATION_COLUMNS} FROM pending_operation ORDER BY op_id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Self::map_operation_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_operation_done(&self, op_id: i64) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE pending_operation SET status = ?1, attempts = attempts + 1 WHERE op_id = ?2",
            params![OperationStatus::Done, op_id],
        )?;
        Ok(())
    }

    pub fn record_operation_failure(&self, op_id: i64, error: &str) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE pending_operation SET attempts = attempts + 1, last_error = ?1 WHERE op_id = ?2",
            params![error, op_id],
        )?;
        Ok(())
    }

    fn map_operation_row(row: &Row<'_>) -> rusqlite::Result<PendingOperationRow> {
        let raw: String = row.get(4)?;
        let attributes = serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(PendingOperationRow {
            op_id: row.get(0)?,
            subscriber_id: row.get(1)?,
            device_id: row.get(2)?,
            kind: row.get(3)?,
            attributes,
            status: row.get(5)?,
            attempts: row.get(6)?,
            last_error: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    // ── Cycle runs ─────────────────────────────────────────────────

    pub fn insert_cycle_run(&self, run: &CycleRunRow) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO cycle_run
             (run_id, run_date, status, invoices, prorated, suspended, restored,
              error_count, error, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.run_id,
                run.run_date,
                run.status,
                run.invoices,
                run.prorated,
                run.suspended,
                run.restored,
                run.error_count,
                run.error,
                run.started_at,
                run.finished_at,
            ],
        )?;
        Ok(())
    }

    pub fn finish_cycle_run(&self, run: &CycleRunRow) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE cycle_run SET status = ?1, invoices = ?2, prorated = ?3, suspended = ?4,
                 restored = ?5, error_count = ?6, error = ?7, finished_at = ?8
             WHERE run_id = ?9",
            params![
                run.status,
                run.invoices,
                run.prorated,
                run.suspended,
                run.restored,
                run.error_count,
                run.error,
                run.finished_at,
                run.run_id,
            ],
        )?;
        Ok(())
    }

    pub fn cycle_runs(&self) -> BillingResult<Vec<CycleRunRow>> {
        let sql = format!("SELECT {CYCLE_RUN_COLUMNS} FROM cycle_run ORDER BY started_at ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CycleRunRow {
                    run_id: row.get(0)?,
                    run_date: row.get(1)?,
                    status: row.get::<_, RunStatus>(2)?,
                    invoices: row.get(3)?,
                    prorated: row.get(4)?,
                    suspended: row.get(5)?,
                    restored: row.get(6)?,
                    error_count: row.get(7)?,
                    error: row.get(8)?,
                    started_at: row.get(9)?,
                    finished_at: row.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl PendingOperationQueue for BillingStore {
    fn enqueue(&self, op: &PendingOperation, now: NaiveDateTime) -> BillingResult<i64> {
        self.conn.execute(
            "INSERT INTO pending_operation
             (subscriber_id, device_id, kind, attributes, status, attempts, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, 'queued', 0, ?5, ?6)",
            params![
                op.subscriber_id,
                op.device_id,
                op.kind,
                op.attributes.to_string(),
                op.last_error,
                now,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}
