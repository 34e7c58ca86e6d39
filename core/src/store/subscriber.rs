use super::{
    money_col, BillingStore, NewSubscriber, PlanRow, RouterRow, SubscriberRow, SubscriberStatus,
    ZoneRow,
};
use crate::error::{BillingError, BillingResult};
use chrono::NaiveDateTime;
use rusqlite::{params, OptionalExtension, Row};

const SUBSCRIBER_COLUMNS: &str = "subscriber_id, name, status, balance, monthly_fee, plan_id,
     router_id, zone_id, collector_id, service_ref, promise_date, broken_promise_streak,
     billing_enabled, deleted_at, version";

impl BillingStore {
    // ── Topology ───────────────────────────────────────────────────

    pub fn insert_zone(&self, zone: &ZoneRow) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO zone (zone_id, name, billing_day, grace_period_days)
             VALUES (?1, ?2, ?3, ?4)",
            params![zone.zone_id, zone.name, zone.billing_day, zone.grace_period_days],
        )?;
        Ok(())
    }

    pub fn zone(&self, zone_id: &str) -> BillingResult<Option<ZoneRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT zone_id, name, billing_day, grace_period_days FROM zone WHERE zone_id = ?1",
                params![zone_id],
                |row| {
                    Ok(ZoneRow {
                        zone_id: row.get(0)?,
                        name: row.get(1)?,
                        billing_day: row.get(2)?,
                        grace_period_days: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn insert_router(&self, router: &RouterRow) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO router (router_id, name, vendor, host, zone_id, billing_day, grace_period_days)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                router.router_id,
                router.name,
                router.vendor,
                router.host,
                router.zone_id,
                router.billing_day,
                router.grace_period_days,
            ],
        )?;
        Ok(())
    }

    pub fn router(&self, router_id: &str) -> BillingResult<Option<RouterRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT router_id, name, vendor, host, zone_id, billing_day, grace_period_days
                 FROM router WHERE router_id = ?1",
                params![router_id],
                |row| {
                    Ok(RouterRow {
                        router_id: row.get(0)?,
                        name: row.get(1)?,
                        vendor: row.get(2)?,
                        host: row.get(3)?,
                        zone_id: row.get(4)?,
                        billing_day: row.get(5)?,
                        grace_period_days: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn insert_plan(&self, plan: &PlanRow) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO plan (plan_id, name, price, active) VALUES (?1, ?2, ?3, ?4)",
            params![plan.plan_id, plan.name, plan.price.to_string(), plan.active],
        )?;
        Ok(())
    }

    pub fn plan(&self, plan_id: &str) -> BillingResult<Option<PlanRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT plan_id, name, price, active FROM plan WHERE plan_id = ?1",
                params![plan_id],
                |row| {
                    Ok(PlanRow {
                        plan_id: row.get(0)?,
                        name: row.get(1)?,
                        price: money_col(row, 2)?,
                        active: row.get::<_, i32>(3)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn set_plan_active(&self, plan_id: &str, active: bool) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE plan SET active = ?1 WHERE plan_id = ?2",
            params![active, plan_id],
        )?;
        Ok(())
    }

    // ── Subscriber ─────────────────────────────────────────────────

    pub fn insert_subscriber(&self, s: &NewSubscriber, now: NaiveDateTime) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO subscriber (
                subscriber_id, name, status, balance, monthly_fee, plan_id, router_id,
                zone_id, collector_id, service_ref, billing_enabled, created_at
            ) VALUES (?1, ?2, 'active', '0', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                s.subscriber_id,
                s.name,
                s.monthly_fee.to_string(),
                s.plan_id,
                s.router_id,
                s.zone_id,
                s.collector_id,
                s.service_ref,
                s.billing_enabled,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn subscriber(&self, subscriber_id: &str) -> BillingResult<Option<SubscriberRow>> {
        let sql = format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscriber WHERE subscriber_id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![subscriber_id], Self::map_subscriber_row)
            .optional()?;
        Ok(row)
    }

    /// Like `subscriber()`, but a missing or soft-deleted row is an error.
    pub fn require_subscriber(&self, subscriber_id: &str) -> BillingResult<SubscriberRow> {
        match self.subscriber(subscriber_id)? {
            Some(s) if s.deleted_at.is_none() => Ok(s),
            _ => Err(BillingError::SubscriberNotFound(subscriber_id.to_string())),
        }
    }

    /// Subscribers eligible for invoicing: billing enabled, not retired,
    /// not soft-deleted.
    pub fn billable_subscribers(&self) -> BillingResult<Vec<SubscriberRow>> {
        let sql = format!(
            "SELECT {SUBSCRIBER_COLUMNS} FROM subscriber
             WHERE billing_enabled = 1 AND status != 'retired' AND deleted_at IS NULL
             ORDER BY subscriber_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Self::map_subscriber_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn subscribers_with_status(
        &self,
        status: SubscriberStatus,
    ) -> BillingResult<Vec<SubscriberRow>> {
        let sql = format!(
            "SELECT {SUBSCRIBER_COLUMNS} FROM subscriber
             WHERE status = ?1 AND deleted_at IS NULL
             ORDER BY router_id ASC, subscriber_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![status], Self::map_subscriber_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Persist the mutable part of a subscriber under optimistic concurrency.
    /// Fails with `ConcurrentModification` if the row changed since it was
    /// read; on success `s.version` is bumped to match the stored row.
    pub fn save_subscriber(&self, s: &mut SubscriberRow) -> BillingResult<()> {
        let updated = self.conn.execute(
            "UPDATE subscriber
             SET status = ?1, balance = ?2, promise_date = ?3, broken_promise_streak = ?4,
                 version = version + 1
             WHERE subscriber_id = ?5 AND version = ?6",
            params![
                s.status,
                s.balance.to_string(),
                s.promise_date,
                s.broken_promise_streak,
                s.subscriber_id,
                s.version,
            ],
        )?;
        if updated == 0 {
            return Err(BillingError::ConcurrentModification(s.subscriber_id.clone()));
        }
        s.version += 1;
        Ok(())
    }

    /// Soft delete by an external collaborator. The engine excludes the
    /// subscriber from all further processing.
    pub fn soft_delete_subscriber(
        &self,
        subscriber_id: &str,
        now: NaiveDateTime,
    ) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE subscriber SET deleted_at = ?1, version = version + 1 WHERE subscriber_id = ?2",
            params![now, subscriber_id],
        )?;
        Ok(())
    }

    pub fn set_billing_enabled(&self, subscriber_id: &str, enabled: bool) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE subscriber SET billing_enabled = ?1, version = version + 1
             WHERE subscriber_id = ?2",
            params![enabled, subscriber_id],
        )?;
        Ok(())
    }

    fn map_subscriber_row(row: &Row<'_>) -> rusqlite::Result<SubscriberRow> {
        Ok(SubscriberRow {
            subscriber_id: row.get(0)?,
            name: row.get(1)?,
            status: row.get(2)?,
            balance: money_col(row, 3)?,
            monthly_fee: money_col(row, 4)?,
            plan_id: row.get(5)?,
            router_id: row.get(6)?,
            zone_id: row.get(7)?,
            collector_id: row.get(8)?,
            service_ref: row.get(9)?,
            promise_date: row.get(10)?,
            broken_promise_streak: row.get(11)?,
            billing_enabled: row.get::<_, i32>(12)? != 0,
            deleted_at: row.get(13)?,
            version: row.get(14)?,
        })
    }
}
