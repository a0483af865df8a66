// Notification - append-only record of inbound deposit notices
//
// Every notice is persisted before any matching happens, and nothing
// ever updates a notification except the settlement stamp. Duplicate
// payloads are legal rows: the fingerprint exists to let reports point
// out repeats, not to reject them.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// An inbound deposit notice as delivered by the bank webhook or CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositNotice {
    /// Depositor name as printed on the transfer
    pub payer_name: String,

    /// Transferred amount in currency minor units
    pub amount: i64,

    /// Account the deposit landed on
    pub destination_account: String,

    /// When the deposit happened; defaults to now when omitted
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

/// A persisted notification row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,

    /// Caller-facing identifier assigned at ingest
    pub receipt: String,

    pub payer_name: String,
    pub amount: i64,
    pub destination_account: String,
    pub received_at: DateTime<Utc>,

    /// Content hash of the payload, for spotting repeats in reports
    pub fingerprint: String,

    /// Set once when this notification fully settled an obligation
    pub settled_obligation_id: Option<i64>,
}

/// Content fingerprint over the payload fields and the effective
/// receipt time. Identical payloads share a fingerprint.
pub fn fingerprint(notice: &DepositNotice, received_at: DateTime<Utc>) -> String {
    let canonical = format!(
        "{}|{}|{}|{}",
        notice.payer_name,
        notice.amount,
        notice.destination_account,
        received_at.to_rfc3339()
    );
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

fn row_to_notification(row: &Row) -> rusqlite::Result<Notification> {
    let received_at: String = row.get(5)?;
    let received_at = DateTime::parse_from_rfc3339(&received_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Notification {
        id: row.get(0)?,
        receipt: row.get(1)?,
        payer_name: row.get(2)?,
        amount: row.get(3)?,
        destination_account: row.get(4)?,
        received_at,
        fingerprint: row.get(6)?,
        settled_obligation_id: row.get(7)?,
    })
}

const NOTIFICATION_COLUMNS: &str =
    "id, receipt, payer_name, amount, destination_account, received_at, fingerprint, settled_obligation_id";

/// Persist a notice verbatim and hand back the stored row. The receipt
/// is a fresh UUID; received_at is the effective time the caller
/// resolved (payload value, or ingest time when absent).
pub fn append(
    conn: &Connection,
    notice: &DepositNotice,
    received_at: DateTime<Utc>,
) -> Result<Notification> {
    let receipt = Uuid::new_v4().to_string();
    let fingerprint = fingerprint(notice, received_at);

    conn.execute(
        "INSERT INTO notifications
         (receipt, payer_name, amount, destination_account, received_at, fingerprint)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            receipt,
            notice.payer_name,
            notice.amount,
            notice.destination_account,
            received_at.to_rfc3339(),
            fingerprint,
        ],
    )?;

    Ok(Notification {
        id: conn.last_insert_rowid(),
        receipt,
        payer_name: notice.payer_name.clone(),
        amount: notice.amount,
        destination_account: notice.destination_account.clone(),
        received_at,
        fingerprint,
        settled_obligation_id: None,
    })
}

/// Record which obligation this notification settled. Only called on a
/// full settle; partial and unmatched notifications keep NULL here.
pub fn stamp_settlement(conn: &Connection, notification_id: i64, obligation_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE notifications SET settled_obligation_id = ?2 WHERE id = ?1",
        params![notification_id, obligation_id],
    )?;

    Ok(())
}

pub fn find_by_receipt(conn: &Connection, receipt: &str) -> Result<Option<Notification>> {
    let notification = conn
        .query_row(
            &format!(
                "SELECT {} FROM notifications WHERE receipt = ?1",
                NOTIFICATION_COLUMNS
            ),
            params![receipt],
            row_to_notification,
        )
        .optional()?;

    Ok(notification)
}

/// How many stored notifications share a fingerprint. Anything above 1
/// marks the payload as a repeat.
pub fn count_by_fingerprint(conn: &Connection, fingerprint: &str) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE fingerprint = ?1",
        params![fingerprint],
        |row| row.get(0),
    )?;

    Ok(count)
}

/// Most recent notifications first.
pub fn list_recent(conn: &Connection, limit: i64) -> Result<Vec<Notification>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM notifications ORDER BY id DESC LIMIT ?1",
        NOTIFICATION_COLUMNS
    ))?;

    let notifications = stmt
        .query_map(params![limit], row_to_notification)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(notifications)
}
