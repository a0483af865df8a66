// 📊 Group dashboard - collection standing at a glance
//
// Computed on demand from the store. Callers that want caching hold a
// DashboardCache and invalidate a group's entry whenever they settle a
// payment; nothing here refreshes implicitly.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::domain::{cycle, group};
use crate::fees;

/// Feed length for the recent-payments panel.
const RECENT_PAYMENTS_LIMIT: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentPayment {
    pub member_id: i64,
    pub member_name: String,
    pub amount: i64,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dashboard {
    pub group_id: i64,
    pub group_name: String,

    /// Period of the ACTIVE cycle; None when no cycle is open
    pub period: Option<String>,

    pub total_members: i64,
    pub paid_count: i64,
    pub pending_count: i64,
    pub overdue_count: i64,

    /// Sum of settled obligation amounts for the active period
    pub collected: i64,

    /// Percent of members settled, rounded to two decimals
    pub payment_rate: f64,

    /// Latest settled payments across all periods, newest first
    pub recent_payments: Vec<RecentPayment>,

    pub computed_at: DateTime<Utc>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Compute a group's dashboard. A group with no ACTIVE cycle gets a
/// zeroed dashboard rather than an error, so a closed-season group
/// still renders.
pub fn compute(conn: &Connection, group_id: i64, as_of: DateTime<Utc>) -> Result<Dashboard> {
    let group = match group::find_by_id(conn, group_id)? {
        Some(group) => group,
        None => bail!("group {} not found", group_id),
    };

    let active = cycle::find_active(conn, group_id)?;
    let (period, paid_count, pending_count, overdue_count, collected, payment_rate) =
        match &active {
            Some(cycle) => {
                let report = fees::report(conn, group_id, &cycle.period, as_of)?;
                let rate = if report.total_members == 0 {
                    0.0
                } else {
                    round2(report.paid_count as f64 * 100.0 / report.total_members as f64)
                };
                (
                    Some(cycle.period.clone()),
                    report.paid_count as i64,
                    report.pending_count as i64,
                    report.overdue_count as i64,
                    report.collected,
                    rate,
                )
            }
            None => (None, 0, 0, 0, 0, 0.0),
        };

    let total_members: i64 = conn.query_row(
        "SELECT COUNT(*) FROM members WHERE group_id = ?1",
        params![group_id],
        |row| row.get(0),
    )?;

    let recent_payments = if active.is_some() {
        recent_payments(conn, group_id)?
    } else {
        Vec::new()
    };

    Ok(Dashboard {
        group_id,
        group_name: group.name,
        period,
        total_members,
        paid_count,
        pending_count,
        overdue_count,
        collected,
        payment_rate,
        recent_payments,
        computed_at: Utc::now(),
    })
}

fn recent_payments(conn: &Connection, group_id: i64) -> Result<Vec<RecentPayment>> {
    let mut stmt = conn.prepare(
        "SELECT m.id, m.name, o.amount, o.paid_at
         FROM obligations o
         JOIN members m ON m.id = o.member_id
         WHERE m.group_id = ?1 AND o.status = 'PAID'
         ORDER BY o.paid_at DESC
         LIMIT ?2",
    )?;

    let rows = stmt.query_map(params![group_id, RECENT_PAYMENTS_LIMIT], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut payments = Vec::new();
    for row in rows {
        let (member_id, member_name, amount, paid_at) = row?;
        let paid_at = DateTime::parse_from_rfc3339(&paid_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| anyhow::anyhow!("bad paid_at on settled obligation: {}", e))?;

        payments.push(RecentPayment {
            member_id,
            member_name,
            amount,
            paid_at,
        });
    }

    Ok(payments)
}

// ============================================================================
// DASHBOARD CACHE
// ============================================================================

/// Per-group dashboard cache with explicit invalidation. Whoever
/// settles a payment calls invalidate for that group; readers get the
/// cached copy until then.
#[derive(Default)]
pub struct DashboardCache {
    inner: Mutex<HashMap<i64, Dashboard>>,
}

impl DashboardCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compute(
        &self,
        conn: &Connection,
        group_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Dashboard> {
        if let Some(cached) = self.inner.lock().unwrap().get(&group_id) {
            return Ok(cached.clone());
        }

        let dashboard = compute(conn, group_id, as_of)?;
        self.inner
            .lock()
            .unwrap()
            .insert(group_id, dashboard.clone());

        Ok(dashboard)
    }

    pub fn invalidate(&self, group_id: i64) {
        self.inner.lock().unwrap().remove(&group_id);
    }
}
