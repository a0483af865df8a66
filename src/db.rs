// SQLite store - schema setup and connection helpers
// Every repository in domain/ operates on a Connection produced here.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Default busy timeout for file-backed databases. Concurrent ingestion
/// (webhook + CLI, or parallel webhook deliveries) serializes on SQLite's
/// write lock; waiting beats surfacing SQLITE_BUSY to the caller.
const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Open (or create) a file-backed database, ready for use.
pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database at {:?}", path))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    setup_database(&conn)?;
    Ok(conn)
}

/// In-memory database with the full schema, for tests and dry runs.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL mode for crash recovery; a notification must survive a crash
    // mid-pipeline even when the match that followed it is lost.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Groups - one row per member group; account_label routes notifications
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS groups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            fee INTEGER NOT NULL,
            account_label TEXT UNIQUE NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Members - group roster; names are NOT unique within a group
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS members (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id INTEGER NOT NULL REFERENCES groups(id),
            name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            is_admin INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Collection cycles - at most one ACTIVE per group (creation-side invariant)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cycles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id INTEGER NOT NULL REFERENCES groups(id),
            period TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(group_id, period)
        )",
        [],
    )?;

    // ==========================================================================
    // Obligations - one per (member, period); PENDING/PAID persisted,
    // OVERDUE is derived at read time and never written
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS obligations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            member_id INTEGER NOT NULL REFERENCES members(id),
            period TEXT NOT NULL,
            amount INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            due_date TEXT,
            paid_at TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(member_id, period)
        )",
        [],
    )?;

    // ==========================================================================
    // Notification log - append-only audit trail; settled_obligation_id is
    // the only field ever updated (match provenance)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            receipt TEXT UNIQUE NOT NULL,
            payer_name TEXT NOT NULL,
            amount INTEGER NOT NULL,
            destination_account TEXT NOT NULL,
            received_at TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            settled_obligation_id INTEGER REFERENCES obligations(id),
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_members_group_name ON members(group_id, name)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cycles_group_status ON cycles(group_id, status)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_obligations_period ON obligations(period, status)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_fingerprint ON notifications(fingerprint)",
        [],
    )?;

    Ok(())
}
