// 📋 Fee reporting - per-member dues standing for one period
//
// Persisted obligation status is only PENDING or PAID; OVERDUE is
// computed here from the due date at read time. A member without an
// obligation row for the period shows as PENDING with amount 0 rather
// than being dropped from the report.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::domain::{group, ObligationStatus};

/// Display state of one member's dues. Paid and Pending mirror the
/// stored status; Overdue never exists in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeState {
    Paid,
    Pending,
    Overdue,
}

impl FeeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeState::Paid => "PAID",
            FeeState::Pending => "PENDING",
            FeeState::Overdue => "OVERDUE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberFeeStatus {
    pub member_id: i64,
    pub member_name: String,

    /// Amount owed; 0 when no obligation was scheduled for the member
    pub amount: i64,

    pub state: FeeState,
    pub due_date: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeReport {
    pub group_id: i64,
    pub period: String,
    pub total_members: usize,
    pub paid_count: usize,
    pub pending_count: usize,
    pub overdue_count: usize,

    /// Sum of settled obligation amounts
    pub collected: i64,

    /// Sum of all scheduled obligation amounts
    pub expected: i64,

    /// Whole-percent share of members settled, truncated
    pub payment_rate: i64,

    pub entries: Vec<MemberFeeStatus>,
}

fn parse_opt_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Build the fee standing of every group member for one period.
/// `as_of` anchors the overdue comparison so reports are reproducible.
pub fn report(
    conn: &Connection,
    group_id: i64,
    period: &str,
    as_of: DateTime<Utc>,
) -> Result<FeeReport> {
    if group::find_by_id(conn, group_id)?.is_none() {
        bail!("group {} not found", group_id);
    }

    let mut stmt = conn.prepare(
        "SELECT m.id, m.name, o.amount, o.status, o.due_date, o.paid_at
         FROM members m
         LEFT JOIN obligations o ON o.member_id = m.id AND o.period = ?2
         WHERE m.group_id = ?1
         ORDER BY m.id ASC",
    )?;

    let rows = stmt.query_map(params![group_id, period], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<i64>>(2)?,
            row.get::<_, Option<ObligationStatus>>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (member_id, member_name, amount, status, due_date, paid_at) = row?;
        let due_date = parse_opt_timestamp(due_date);
        let paid_at = parse_opt_timestamp(paid_at);

        let state = match status {
            Some(ObligationStatus::Paid) => FeeState::Paid,
            Some(ObligationStatus::Pending) => match due_date {
                Some(due) if due < as_of => FeeState::Overdue,
                _ => FeeState::Pending,
            },
            // Never scheduled: owes nothing yet, shown as pending
            None => FeeState::Pending,
        };

        entries.push(MemberFeeStatus {
            member_id,
            member_name,
            amount: amount.unwrap_or(0),
            state,
            due_date,
            paid_at,
        });
    }

    let total_members = entries.len();
    let paid_count = entries.iter().filter(|e| e.state == FeeState::Paid).count();
    let overdue_count = entries.iter().filter(|e| e.state == FeeState::Overdue).count();
    let pending_count = total_members - paid_count - overdue_count;

    let collected: i64 = entries
        .iter()
        .filter(|e| e.state == FeeState::Paid)
        .map(|e| e.amount)
        .sum();
    let expected: i64 = entries.iter().map(|e| e.amount).sum();

    let payment_rate = if total_members == 0 {
        0
    } else {
        (paid_count as i64 * 100) / total_members as i64
    };

    Ok(FeeReport {
        group_id,
        period: period.to_string(),
        total_members,
        paid_count,
        pending_count,
        overdue_count,
        collected,
        expected,
        payment_rate,
        entries,
    })
}
