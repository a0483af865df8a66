// 🔔 Payment reminders - nudge members who still owe
//
// Delivery is behind the ReminderSender trait so the actual channel
// (SMS gateway, email, a terminal) stays out of the targeting logic.
// Phone numbers are stored human-formatted and normalized to digits
// only at send time.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{group, member};
use crate::fees::{self, FeeState};

/// One reminder ready for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub member_id: i64,
    pub member_name: String,

    /// Digits-only phone number
    pub phone: String,

    pub group_name: String,
    pub period: String,
    pub amount: i64,
    pub state: FeeState,
}

impl Reminder {
    pub fn message(&self) -> String {
        match self.state {
            FeeState::Overdue => format!(
                "[{}] Your {} dues of {} are overdue. Please settle as soon as possible.",
                self.group_name, self.period, self.amount
            ),
            _ => format!(
                "[{}] Your {} dues of {} are still unpaid. Please transfer to the group account.",
                self.group_name, self.period, self.amount
            ),
        }
    }
}

pub trait ReminderSender {
    fn send(&self, reminder: &Reminder) -> Result<()>;
}

/// Prints reminders to stdout. Stands in for a real delivery channel.
pub struct ConsoleSender;

impl ReminderSender for ConsoleSender {
    fn send(&self, reminder: &Reminder) -> Result<()> {
        println!("  📨 {} → {}", reminder.phone, reminder.message());
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemindReport {
    /// Unpaid entries considered for a reminder
    pub considered: usize,
    pub sent: usize,

    /// (member_id, reason) pairs for entries that could not be reminded
    pub skipped: Vec<(i64, String)>,
}

/// Strip formatting from a stored phone number. "010-1234-5678"
/// becomes "01012345678".
pub fn normalize_phone(phone: &str) -> String {
    phone.trim().replace('-', "")
}

/// Send a reminder to every member still owing for the period.
/// Members with nothing scheduled or no phone on file are skipped.
pub fn remind_unpaid(
    conn: &Connection,
    group_id: i64,
    period: &str,
    as_of: DateTime<Utc>,
    sender: &dyn ReminderSender,
) -> Result<RemindReport> {
    let group = match group::find_by_id(conn, group_id)? {
        Some(group) => group,
        None => bail!("group {} not found", group_id),
    };
    let report = fees::report(conn, group_id, period, as_of)?;

    let roster: std::collections::HashMap<i64, member::Member> =
        member::list_by_group(conn, group_id)?
            .into_iter()
            .map(|m| (m.id, m))
            .collect();

    let mut considered = 0;
    let mut sent = 0;
    let mut skipped = Vec::new();

    for entry in &report.entries {
        if entry.state == FeeState::Paid {
            continue;
        }
        if entry.amount == 0 {
            // Nothing scheduled for this member yet
            continue;
        }
        considered += 1;

        let phone = roster
            .get(&entry.member_id)
            .and_then(|m| m.phone.as_deref())
            .map(normalize_phone)
            .filter(|p| !p.is_empty());

        let phone = match phone {
            Some(phone) => phone,
            None => {
                skipped.push((entry.member_id, "no phone on file".to_string()));
                continue;
            }
        };

        let reminder = Reminder {
            member_id: entry.member_id,
            member_name: entry.member_name.clone(),
            phone,
            group_name: group.name.clone(),
            period: period.to_string(),
            amount: entry.amount,
            state: entry.state,
        };

        sender.send(&reminder)?;
        info!(
            member_id = reminder.member_id,
            period = %reminder.period,
            state = reminder.state.as_str(),
            "reminder sent"
        );
        sent += 1;
    }

    Ok(RemindReport {
        considered,
        sent,
        skipped,
    })
}
