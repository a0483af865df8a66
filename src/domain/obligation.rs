// Obligation - one member's dues for one period
//
// Stored status is only ever PENDING or PAID. Overdue is derived at
// read time from due_date so that obligations never need a background
// job to flip status. paid_at is stamped once by the compare-and-set
// in mark_paid and never rewritten.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObligationStatus {
    Pending,
    Paid,
}

impl ObligationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObligationStatus::Pending => "PENDING",
            ObligationStatus::Paid => "PAID",
        }
    }

    pub fn parse(s: &str) -> Option<ObligationStatus> {
        match s {
            "PENDING" => Some(ObligationStatus::Pending),
            "PAID" => Some(ObligationStatus::Paid),
            _ => None,
        }
    }
}

impl ToSql for ObligationStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for ObligationStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        ObligationStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown obligation status: {}", s).into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Obligation {
    pub id: i64,
    pub member_id: i64,
    pub period: String,

    /// Amount owed for the period, in currency minor units
    pub amount: i64,

    pub status: ObligationStatus,
    pub due_date: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Obligation {
    /// Pending past its due date. Derived, never stored.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == ObligationStatus::Pending
            && self.due_date.map_or(false, |due| due < now)
    }
}

fn parse_timestamp(col: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match value {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    col,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
    }
}

fn row_to_obligation(row: &Row) -> rusqlite::Result<Obligation> {
    Ok(Obligation {
        id: row.get(0)?,
        member_id: row.get(1)?,
        period: row.get(2)?,
        amount: row.get(3)?,
        status: row.get(4)?,
        due_date: parse_timestamp(5, row.get(5)?)?,
        paid_at: parse_timestamp(6, row.get(6)?)?,
    })
}

const OBLIGATION_COLUMNS: &str = "id, member_id, period, amount, status, due_date, paid_at";

/// Create one PENDING obligation per group member for a period, at the
/// given amount. Members who already carry one for the period are left
/// untouched. Returns the number of obligations created.
pub fn schedule_for_cycle(
    conn: &Connection,
    group_id: i64,
    period: &str,
    amount: i64,
    due_date: Option<DateTime<Utc>>,
) -> Result<usize> {
    let created = conn.execute(
        "INSERT OR IGNORE INTO obligations (member_id, period, amount, status, due_date)
         SELECT id, ?2, ?3, 'PENDING', ?4 FROM members WHERE group_id = ?1 ORDER BY id",
        params![group_id, period, amount, due_date.map(|d| d.to_rfc3339())],
    )?;

    Ok(created)
}

pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Obligation>> {
    let obligation = conn
        .query_row(
            &format!("SELECT {} FROM obligations WHERE id = ?1", OBLIGATION_COLUMNS),
            params![id],
            row_to_obligation,
        )
        .optional()?;

    Ok(obligation)
}

/// The member's PENDING obligation for a period, if any.
pub fn find_pending(conn: &Connection, member_id: i64, period: &str) -> Result<Option<Obligation>> {
    let obligation = conn
        .query_row(
            &format!(
                "SELECT {} FROM obligations
                 WHERE member_id = ?1 AND period = ?2 AND status = 'PENDING'",
                OBLIGATION_COLUMNS
            ),
            params![member_id, period],
            row_to_obligation,
        )
        .optional()?;

    Ok(obligation)
}

/// The member's obligation for a period regardless of status.
pub fn find_by_member_and_period(
    conn: &Connection,
    member_id: i64,
    period: &str,
) -> Result<Option<Obligation>> {
    let obligation = conn
        .query_row(
            &format!(
                "SELECT {} FROM obligations WHERE member_id = ?1 AND period = ?2",
                OBLIGATION_COLUMNS
            ),
            params![member_id, period],
            row_to_obligation,
        )
        .optional()?;

    Ok(obligation)
}

/// Settle an obligation if and only if it is still PENDING. The status
/// guard in the WHERE clause is the whole concurrency story: two
/// writers racing on the same obligation see exactly one true here.
pub fn mark_paid(conn: &Connection, obligation_id: i64, paid_at: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE obligations SET status = 'PAID', paid_at = ?2
         WHERE id = ?1 AND status = 'PENDING'",
        params![obligation_id, paid_at.to_rfc3339()],
    )?;

    Ok(changed > 0)
}

pub fn list_by_member(conn: &Connection, member_id: i64) -> Result<Vec<Obligation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM obligations WHERE member_id = ?1 ORDER BY period ASC",
        OBLIGATION_COLUMNS
    ))?;

    let obligations = stmt
        .query_map(params![member_id], row_to_obligation)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(obligations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::domain::{group, member};
    use chrono::Duration;

    fn setup() -> (Connection, i64) {
        let conn = db::open_in_memory().unwrap();
        let g = group::create(&conn, "Hiking Club", 10000, "110-123-456789").unwrap();
        (conn, g.id)
    }

    #[test]
    fn test_schedule_covers_every_member_once() {
        let (conn, group_id) = setup();
        member::add(&conn, group_id, "Kim Minsu", None, None, false).unwrap();
        member::add(&conn, group_id, "Lee Jung", None, None, false).unwrap();

        let created = schedule_for_cycle(&conn, group_id, "2025-06", 10000, None).unwrap();
        assert_eq!(created, 2);

        // Re-running schedules nothing new
        let created = schedule_for_cycle(&conn, group_id, "2025-06", 10000, None).unwrap();
        assert_eq!(created, 0);
    }

    #[test]
    fn test_mark_paid_settles_exactly_once() {
        let (conn, group_id) = setup();
        let m = member::add(&conn, group_id, "Kim Minsu", None, None, false).unwrap();
        schedule_for_cycle(&conn, group_id, "2025-06", 10000, None).unwrap();

        let obligation = find_pending(&conn, m.id, "2025-06").unwrap().unwrap();
        let paid_at = Utc::now();

        assert!(mark_paid(&conn, obligation.id, paid_at).unwrap());
        assert!(!mark_paid(&conn, obligation.id, paid_at).unwrap());

        let settled = find_by_id(&conn, obligation.id).unwrap().unwrap();
        assert_eq!(settled.status, ObligationStatus::Paid);
        assert_eq!(settled.paid_at.unwrap().to_rfc3339(), paid_at.to_rfc3339());
    }

    #[test]
    fn test_find_pending_skips_settled() {
        let (conn, group_id) = setup();
        let m = member::add(&conn, group_id, "Kim Minsu", None, None, false).unwrap();
        schedule_for_cycle(&conn, group_id, "2025-06", 10000, None).unwrap();

        let obligation = find_pending(&conn, m.id, "2025-06").unwrap().unwrap();
        mark_paid(&conn, obligation.id, Utc::now()).unwrap();

        assert!(find_pending(&conn, m.id, "2025-06").unwrap().is_none());
        assert!(find_by_member_and_period(&conn, m.id, "2025-06")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_overdue_is_derived_from_due_date() {
        let now = Utc::now();
        let base = Obligation {
            id: 1,
            member_id: 1,
            period: "2025-06".to_string(),
            amount: 10000,
            status: ObligationStatus::Pending,
            due_date: Some(now - Duration::days(1)),
            paid_at: None,
        };

        assert!(base.is_overdue(now));

        let not_due = Obligation {
            due_date: Some(now + Duration::days(1)),
            ..base.clone()
        };
        assert!(!not_due.is_overdue(now));

        let no_due_date = Obligation {
            due_date: None,
            ..base.clone()
        };
        assert!(!no_due_date.is_overdue(now));

        let settled = Obligation {
            status: ObligationStatus::Paid,
            ..base
        };
        assert!(!settled.is_overdue(now));
    }
}
