// 📥 Roster import - load members from a CSV file
//
// Expected columns: name,email,phone,admin
// A row whose email or phone already belongs to a group member is
// skipped, so re-importing the same file enrolls nobody twice.

use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use csv::ReaderBuilder;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::domain::{group, member};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedRow {
    /// 1-indexed line in the source file, counting the header
    pub line: usize,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportReport {
    pub rows: usize,
    pub added: usize,
    pub skipped: Vec<SkippedRow>,
}

fn non_empty(field: Option<&str>) -> Option<String> {
    field
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn parse_admin_flag(field: Option<&str>) -> bool {
    matches!(
        field.map(str::trim).map(str::to_lowercase).as_deref(),
        Some("true") | Some("1") | Some("yes")
    )
}

/// Import a member roster into a group. Returns what was added and
/// what was skipped, line by line.
pub fn import_roster(conn: &Connection, group_id: i64, path: &Path) -> Result<ImportReport> {
    if group::find_by_id(conn, group_id)?.is_none() {
        bail!("group {} not found", group_id);
    }

    let file = File::open(path)
        .with_context(|| format!("Failed to open roster file: {}", path.display()))?;

    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);

    let mut rows = 0;
    let mut added = 0;
    let mut skipped = Vec::new();

    for (idx, result) in reader.records().enumerate() {
        // +2 because: 1-indexed + header row
        let line = idx + 2;
        let record = result
            .with_context(|| format!("Failed to parse CSV line {} in {}", line, path.display()))?;
        rows += 1;

        let name = record.get(0).unwrap_or("").trim().to_string();
        let email = non_empty(record.get(1));
        let phone = non_empty(record.get(2));
        let is_admin = parse_admin_flag(record.get(3));

        if name.is_empty() {
            skipped.push(SkippedRow {
                line,
                name,
                reason: "empty name".to_string(),
            });
            continue;
        }

        if let Some(existing) =
            member::find_duplicate(conn, group_id, email.as_deref(), phone.as_deref(), None)?
        {
            skipped.push(SkippedRow {
                line,
                name,
                reason: format!("shares contact info with member {}", existing.id),
            });
            continue;
        }

        member::add(
            conn,
            group_id,
            &name,
            email.as_deref(),
            phone.as_deref(),
            is_admin,
        )?;
        added += 1;
    }

    Ok(ImportReport {
        rows,
        added,
        skipped,
    })
}
