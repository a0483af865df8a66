// Group - a dues-collecting member group
//
// The account_label is the routing key for inbound deposit notifications:
// exact match only, unique across groups, immutable once reconciliation
// starts depending on it.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,

    /// Display name (e.g. "Alumni Hiking Club")
    pub name: String,

    /// Flat per-member dues for one period, in currency minor units
    pub fee: i64,

    /// Destination-account identifier notifications are routed by
    pub account_label: String,
}

fn row_to_group(row: &Row) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        fee: row.get(2)?,
        account_label: row.get(3)?,
    })
}

/// Create a group. The account label must be unique across all groups.
pub fn create(conn: &Connection, name: &str, fee: i64, account_label: &str) -> Result<Group> {
    conn.execute(
        "INSERT INTO groups (name, fee, account_label) VALUES (?1, ?2, ?3)",
        params![name, fee, account_label],
    )?;

    Ok(Group {
        id: conn.last_insert_rowid(),
        name: name.to_string(),
        fee,
        account_label: account_label.to_string(),
    })
}

pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Group>> {
    let group = conn
        .query_row(
            "SELECT id, name, fee, account_label FROM groups WHERE id = ?1",
            params![id],
            row_to_group,
        )
        .optional()?;

    Ok(group)
}

/// Resolve a group by the destination account of a notification.
/// Exact match only; absence is a normal outcome, not an error.
pub fn find_by_account(conn: &Connection, account_label: &str) -> Result<Option<Group>> {
    let group = conn
        .query_row(
            "SELECT id, name, fee, account_label FROM groups WHERE account_label = ?1",
            params![account_label],
            row_to_group,
        )
        .optional()?;

    Ok(group)
}

pub fn list(conn: &Connection) -> Result<Vec<Group>> {
    let mut stmt = conn.prepare("SELECT id, name, fee, account_label FROM groups ORDER BY id")?;

    let groups = stmt
        .query_map([], row_to_group)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(groups)
}
