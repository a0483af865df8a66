// Member - a person enrolled in a group
//
// The name is the matching key for deposit notifications, so it is stored
// exactly as entered. Same-name members within one group are legal; the
// reconciliation pipeline disambiguates them by obligation status and id
// order, never by guessing here.

use anyhow::{bail, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: i64,
    pub group_id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub is_admin: bool,
}

fn row_to_member(row: &Row) -> rusqlite::Result<Member> {
    Ok(Member {
        id: row.get(0)?,
        group_id: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        is_admin: row.get(5)?,
    })
}

/// Enroll a member. A contact point (email or phone) already held by
/// another member of the group is refused; same names are fine.
pub fn add(
    conn: &Connection,
    group_id: i64,
    name: &str,
    email: Option<&str>,
    phone: Option<&str>,
    is_admin: bool,
) -> Result<Member> {
    if let Some(existing) = find_duplicate(conn, group_id, email, phone, None)? {
        bail!(
            "contact info already enrolled for member {} ({})",
            existing.id,
            existing.name
        );
    }

    conn.execute(
        "INSERT INTO members (group_id, name, email, phone, is_admin) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![group_id, name, email, phone, is_admin],
    )?;

    Ok(Member {
        id: conn.last_insert_rowid(),
        group_id,
        name: name.to_string(),
        email: email.map(String::from),
        phone: phone.map(String::from),
        is_admin,
    })
}

pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Member>> {
    let member = conn
        .query_row(
            "SELECT id, group_id, name, email, phone, is_admin FROM members WHERE id = ?1",
            params![id],
            row_to_member,
        )
        .optional()?;

    Ok(member)
}

/// All members of a group whose name matches the payer name exactly,
/// in ascending id order. Id order is what makes same-name
/// disambiguation deterministic downstream.
pub fn find_by_group_and_name(conn: &Connection, group_id: i64, name: &str) -> Result<Vec<Member>> {
    let mut stmt = conn.prepare(
        "SELECT id, group_id, name, email, phone, is_admin FROM members
         WHERE group_id = ?1 AND name = ?2 ORDER BY id ASC",
    )?;

    let members = stmt
        .query_map(params![group_id, name], row_to_member)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(members)
}

pub fn list_by_group(conn: &Connection, group_id: i64) -> Result<Vec<Member>> {
    let mut stmt = conn.prepare(
        "SELECT id, group_id, name, email, phone, is_admin FROM members
         WHERE group_id = ?1 ORDER BY id ASC",
    )?;

    let members = stmt
        .query_map(params![group_id], row_to_member)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(members)
}

pub fn count_by_group(conn: &Connection, group_id: i64) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM members WHERE group_id = ?1",
        params![group_id],
        |row| row.get(0),
    )?;

    Ok(count)
}

/// An existing member in the group sharing a contact point with the
/// candidate. `exclude` leaves one member id out of the search so an
/// update does not collide with its own row.
pub fn find_duplicate(
    conn: &Connection,
    group_id: i64,
    email: Option<&str>,
    phone: Option<&str>,
    exclude: Option<i64>,
) -> Result<Option<Member>> {
    if let Some(email) = email.filter(|e| !e.is_empty()) {
        let member = conn
            .query_row(
                "SELECT id, group_id, name, email, phone, is_admin FROM members
                 WHERE group_id = ?1 AND email = ?2 AND (?3 IS NULL OR id != ?3)",
                params![group_id, email, exclude],
                row_to_member,
            )
            .optional()?;
        if member.is_some() {
            return Ok(member);
        }
    }

    if let Some(phone) = phone.filter(|p| !p.is_empty()) {
        let member = conn
            .query_row(
                "SELECT id, group_id, name, email, phone, is_admin FROM members
                 WHERE group_id = ?1 AND phone = ?2 AND (?3 IS NULL OR id != ?3)",
                params![group_id, phone, exclude],
                row_to_member,
            )
            .optional()?;
        if member.is_some() {
            return Ok(member);
        }
    }

    Ok(None)
}

/// Update a member's name and contact info. The duplicate-contact check
/// applies, with the member's own row excluded.
pub fn update(
    conn: &Connection,
    member_id: i64,
    name: &str,
    email: Option<&str>,
    phone: Option<&str>,
) -> Result<Member> {
    let member = match find_by_id(conn, member_id)? {
        Some(m) => m,
        None => bail!("member {} not found", member_id),
    };

    if let Some(existing) =
        find_duplicate(conn, member.group_id, email, phone, Some(member_id))?
    {
        bail!(
            "contact info already enrolled for member {} ({})",
            existing.id,
            existing.name
        );
    }

    conn.execute(
        "UPDATE members SET name = ?2, email = ?3, phone = ?4 WHERE id = ?1",
        params![member_id, name, email, phone],
    )?;

    Ok(Member {
        id: member_id,
        group_id: member.group_id,
        name: name.to_string(),
        email: email.map(String::from),
        phone: phone.map(String::from),
        is_admin: member.is_admin,
    })
}

/// Remove a member. Admins cannot be removed, and neither can members
/// with settled payment history (their obligations anchor notification
/// provenance). Pending obligations are discarded with the member.
pub fn remove(conn: &Connection, member_id: i64) -> Result<()> {
    let member = match find_by_id(conn, member_id)? {
        Some(m) => m,
        None => bail!("member {} not found", member_id),
    };

    if member.is_admin {
        bail!("member {} is an admin and cannot be removed", member_id);
    }

    let settled: i64 = conn.query_row(
        "SELECT COUNT(*) FROM obligations WHERE member_id = ?1 AND status = 'PAID'",
        params![member_id],
        |row| row.get(0),
    )?;
    if settled > 0 {
        bail!(
            "member {} has {} settled obligation(s) and cannot be removed",
            member_id,
            settled
        );
    }

    conn.execute(
        "DELETE FROM obligations WHERE member_id = ?1",
        params![member_id],
    )?;
    conn.execute("DELETE FROM members WHERE id = ?1", params![member_id])?;

    Ok(())
}
