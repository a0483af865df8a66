// ⚖️ Reconciliation Engine - match deposit notices to member dues
//
// Fixed pipeline order:
//   1. persist the notice (own commit, audit row survives anything below)
//   2. resolve the group by destination account
//   3. resolve the single ACTIVE cycle
//   4. collect members whose name equals the payer name, in id order
//   5. first candidate with a PENDING obligation takes the deposit
//   6. settle (amount >= required) or record a partial
//
// Every stage that finds nothing is a normal terminal outcome, not an
// error. Hard failures are reserved for the store and for a group that
// carries more than one ACTIVE cycle.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{cycle, group, member, notification, obligation};
use crate::domain::{DepositNotice, Notification};

// ============================================================================
// MATCH OUTCOME
// ============================================================================

/// Terminal state of one notice's trip through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    /// Full settle: the obligation flipped PENDING to PAID
    Settled {
        group_id: i64,
        member_id: i64,
        obligation_id: i64,
        amount: i64,
    },

    /// Deposit below the required amount; nothing was mutated
    Partial {
        group_id: i64,
        member_id: i64,
        obligation_id: i64,
        paid: i64,
        required: i64,
    },

    /// Name matched, but no candidate still owes for the period.
    /// Covers replays of a settled notice and the loser of a settle
    /// race alike.
    AlreadySettled { group_id: i64 },

    /// Payer name matched no member of the resolved group
    NoMemberMatch { group_id: i64 },

    /// Group exists but has no ACTIVE cycle
    NoActiveCycle { group_id: i64 },

    /// Destination account matched no group
    NoGroupMatch,
}

impl MatchOutcome {
    pub fn is_settled(&self) -> bool {
        matches!(self, MatchOutcome::Settled { .. })
    }

    /// The group the notice resolved to, where it got that far.
    /// Callers use this to invalidate per-group dashboards.
    pub fn group_id(&self) -> Option<i64> {
        match self {
            MatchOutcome::Settled { group_id, .. }
            | MatchOutcome::Partial { group_id, .. }
            | MatchOutcome::AlreadySettled { group_id }
            | MatchOutcome::NoMemberMatch { group_id }
            | MatchOutcome::NoActiveCycle { group_id } => Some(*group_id),
            MatchOutcome::NoGroupMatch => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MatchOutcome::Settled { .. } => "SETTLED",
            MatchOutcome::Partial { .. } => "PARTIAL",
            MatchOutcome::AlreadySettled { .. } => "ALREADY_SETTLED",
            MatchOutcome::NoMemberMatch { .. } => "NO_MEMBER_MATCH",
            MatchOutcome::NoActiveCycle { .. } => "NO_ACTIVE_CYCLE",
            MatchOutcome::NoGroupMatch => "NO_GROUP_MATCH",
        }
    }
}

// ============================================================================
// INGEST RESULT / ERROR
// ============================================================================

/// What the caller gets back for one ingested notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReceipt {
    /// Identifier of the stored notification, quotable in support queries
    pub receipt: String,

    pub notification_id: i64,
    pub received_at: DateTime<Utc>,
    pub outcome: MatchOutcome,
}

#[derive(Debug, Error)]
pub enum IngestError {
    /// More than one ACTIVE cycle for a group. The pipeline refuses to
    /// guess which one applies; an operator has to close the extras.
    /// The notice is already logged when this fires; `receipt` points
    /// at the stored row.
    #[error("group {group_id} has {count} active cycles, expected at most one")]
    CycleInvariant {
        group_id: i64,
        count: i64,
        receipt: String,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for IngestError {
    fn from(e: rusqlite::Error) -> Self {
        IngestError::Store(e.into())
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

pub struct ReconciliationEngine;

impl ReconciliationEngine {
    pub fn new() -> Self {
        ReconciliationEngine
    }

    /// Ingest one deposit notice: persist it, then run the matching
    /// pipeline inside a single write transaction.
    ///
    /// The notification row commits on its own before matching starts,
    /// so a failed or unmatched run never loses the notice.
    pub fn ingest(
        &self,
        conn: &mut Connection,
        notice: DepositNotice,
    ) -> Result<IngestReceipt, IngestError> {
        let received_at = notice.received_at.unwrap_or_else(Utc::now);

        let stored = notification::append(conn, &notice, received_at)?;
        info!(
            receipt = %stored.receipt,
            payer = %stored.payer_name,
            amount = stored.amount,
            account = %stored.destination_account,
            "deposit notice recorded"
        );

        // IMMEDIATE takes the write lock up front, so the reads below
        // see the same state the settle writes against.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = self.resolve(&tx, &stored)?;
        tx.commit()?;

        Ok(IngestReceipt {
            receipt: stored.receipt,
            notification_id: stored.id,
            received_at,
            outcome,
        })
    }

    fn resolve(
        &self,
        conn: &Connection,
        stored: &Notification,
    ) -> Result<MatchOutcome, IngestError> {
        let group = match group::find_by_account(conn, &stored.destination_account)? {
            Some(group) => group,
            None => {
                info!(account = %stored.destination_account, "no group for destination account");
                return Ok(MatchOutcome::NoGroupMatch);
            }
        };

        let active = cycle::count_active(conn, group.id)?;
        if active > 1 {
            return Err(IngestError::CycleInvariant {
                group_id: group.id,
                count: active,
                receipt: stored.receipt.clone(),
            });
        }
        let cycle = match cycle::find_active(conn, group.id)? {
            Some(cycle) => cycle,
            None => {
                info!(group_id = group.id, "no active cycle for group");
                return Ok(MatchOutcome::NoActiveCycle { group_id: group.id });
            }
        };

        let candidates = member::find_by_group_and_name(conn, group.id, &stored.payer_name)?;
        if candidates.is_empty() {
            warn!(
                group_id = group.id,
                payer = %stored.payer_name,
                "payer name matches no member"
            );
            return Ok(MatchOutcome::NoMemberMatch { group_id: group.id });
        }
        debug!(
            group_id = group.id,
            period = %cycle.period,
            candidates = candidates.len(),
            "name candidates collected"
        );

        // First pending wins. Candidates arrive in id order, so two
        // same-named members resolve the same way every run.
        let mut matched = None;
        for candidate in &candidates {
            if let Some(obligation) = obligation::find_pending(conn, candidate.id, &cycle.period)? {
                matched = Some((candidate, obligation));
                break;
            }
        }
        let (member, obligation) = match matched {
            Some(pair) => pair,
            None => {
                warn!(
                    group_id = group.id,
                    payer = %stored.payer_name,
                    candidates = candidates.len(),
                    "every name match is already settled for the period"
                );
                return Ok(MatchOutcome::AlreadySettled { group_id: group.id });
            }
        };

        if stored.amount < obligation.amount {
            info!(
                obligation_id = obligation.id,
                paid = stored.amount,
                required = obligation.amount,
                "partial payment, obligation stays pending"
            );
            return Ok(MatchOutcome::Partial {
                group_id: group.id,
                member_id: member.id,
                obligation_id: obligation.id,
                paid: stored.amount,
                required: obligation.amount,
            });
        }

        // Compare-and-set: flips only if still PENDING. paid_at is the
        // notice's effective receipt time, not the settle time.
        if !obligation::mark_paid(conn, obligation.id, stored.received_at)? {
            warn!(
                obligation_id = obligation.id,
                "obligation was settled by another writer"
            );
            return Ok(MatchOutcome::AlreadySettled { group_id: group.id });
        }

        notification::stamp_settlement(conn, stored.id, obligation.id)?;
        info!(
            obligation_id = obligation.id,
            member_id = member.id,
            amount = stored.amount,
            "obligation settled"
        );

        Ok(MatchOutcome::Settled {
            group_id: group.id,
            member_id: member.id,
            obligation_id: obligation.id,
            amount: stored.amount,
        })
    }
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::domain::ObligationStatus;
    use chrono::Duration;

    const ACCOUNT: &str = "110-123-456789";
    const FEE: i64 = 10000;

    fn notice(payer: &str, amount: i64) -> DepositNotice {
        DepositNotice {
            payer_name: payer.to_string(),
            amount,
            destination_account: ACCOUNT.to_string(),
            received_at: None,
        }
    }

    /// Group with an ACTIVE 2025-06 cycle and obligations scheduled for
    /// the given members.
    fn seed(conn: &Connection, members: &[&str]) -> i64 {
        let g = group::create(conn, "Hiking Club", FEE, ACCOUNT).unwrap();
        for name in members {
            member::add(conn, g.id, name, None, None, false).unwrap();
        }
        cycle::open(conn, g.id, "2025-06").unwrap();
        obligation::schedule_for_cycle(conn, g.id, "2025-06", FEE, None).unwrap();
        g.id
    }

    fn notification_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM notifications", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_no_group_match_still_logs_notice() {
        let mut conn = db::open_in_memory().unwrap();
        seed(&conn, &["Kim Minsu"]);

        let mut stray = notice("Kim Minsu", FEE);
        stray.destination_account = "999-000-111222".to_string();

        let receipt = ReconciliationEngine::new().ingest(&mut conn, stray).unwrap();

        assert_eq!(receipt.outcome, MatchOutcome::NoGroupMatch);
        assert_eq!(notification_count(&conn), 1);

        // Obligation store untouched
        let paid: i64 = conn
            .query_row("SELECT COUNT(*) FROM obligations WHERE status = 'PAID'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(paid, 0);
    }

    #[test]
    fn test_no_active_cycle() {
        let mut conn = db::open_in_memory().unwrap();
        let group_id = seed(&conn, &["Kim Minsu"]);
        let active = cycle::find_active(&conn, group_id).unwrap().unwrap();
        cycle::close(&conn, active.id).unwrap();

        let receipt = ReconciliationEngine::new()
            .ingest(&mut conn, notice("Kim Minsu", FEE))
            .unwrap();

        assert_eq!(receipt.outcome, MatchOutcome::NoActiveCycle { group_id });
        assert_eq!(notification_count(&conn), 1);
    }

    #[test]
    fn test_no_member_match() {
        let mut conn = db::open_in_memory().unwrap();
        let group_id = seed(&conn, &["Kim Minsu"]);

        let receipt = ReconciliationEngine::new()
            .ingest(&mut conn, notice("Park Unknown", FEE))
            .unwrap();

        assert_eq!(receipt.outcome, MatchOutcome::NoMemberMatch { group_id });
        assert_eq!(notification_count(&conn), 1);
    }

    #[test]
    fn test_exact_amount_settles_with_provenance() {
        let mut conn = db::open_in_memory().unwrap();
        let group_id = seed(&conn, &["Kim Minsu"]);

        let sent_at = Utc::now() - Duration::hours(3);
        let mut paid_notice = notice("Kim Minsu", FEE);
        paid_notice.received_at = Some(sent_at);

        let receipt = ReconciliationEngine::new()
            .ingest(&mut conn, paid_notice)
            .unwrap();

        let obligation_id = match receipt.outcome {
            MatchOutcome::Settled {
                group_id: g,
                obligation_id,
                amount,
                ..
            } => {
                assert_eq!(g, group_id);
                assert_eq!(amount, FEE);
                obligation_id
            }
            other => panic!("expected settle, got {:?}", other),
        };

        // paid_at carries the notice's own timestamp
        let settled = obligation::find_by_id(&conn, obligation_id).unwrap().unwrap();
        assert_eq!(settled.status, ObligationStatus::Paid);
        assert_eq!(settled.paid_at.unwrap().to_rfc3339(), sent_at.to_rfc3339());

        // Notification points back at what it settled
        let stored = notification::find_by_receipt(&conn, &receipt.receipt)
            .unwrap()
            .unwrap();
        assert_eq!(stored.settled_obligation_id, Some(obligation_id));

        println!("✅ settled obligation {} at {}", obligation_id, sent_at);
    }

    #[test]
    fn test_overpayment_settles() {
        let mut conn = db::open_in_memory().unwrap();
        seed(&conn, &["Kim Minsu"]);

        let receipt = ReconciliationEngine::new()
            .ingest(&mut conn, notice("Kim Minsu", FEE + 5000))
            .unwrap();

        assert!(receipt.outcome.is_settled());
    }

    #[test]
    fn test_partial_payment_leaves_pending() {
        let mut conn = db::open_in_memory().unwrap();
        let group_id = seed(&conn, &["Kim Minsu"]);

        let receipt = ReconciliationEngine::new()
            .ingest(&mut conn, notice("Kim Minsu", 5000))
            .unwrap();

        match receipt.outcome {
            MatchOutcome::Partial {
                group_id: g,
                paid,
                required,
                obligation_id,
                ..
            } => {
                assert_eq!(g, group_id);
                assert_eq!(paid, 5000);
                assert_eq!(required, FEE);

                let o = obligation::find_by_id(&conn, obligation_id).unwrap().unwrap();
                assert_eq!(o.status, ObligationStatus::Pending);
                assert!(o.paid_at.is_none());
            }
            other => panic!("expected partial, got {:?}", other),
        }

        // No provenance stamp on a partial
        let stored = notification::find_by_receipt(&conn, &receipt.receipt)
            .unwrap()
            .unwrap();
        assert!(stored.settled_obligation_id.is_none());
    }

    #[test]
    fn test_same_name_first_pending_wins() {
        let mut conn = db::open_in_memory().unwrap();
        let group_id = seed(&conn, &["Kim Minsu", "Kim Minsu"]);
        let engine = ReconciliationEngine::new();

        let candidates = member::find_by_group_and_name(&conn, group_id, "Kim Minsu").unwrap();
        assert_eq!(candidates.len(), 2);

        // First deposit settles the lower id
        let first = engine.ingest(&mut conn, notice("Kim Minsu", FEE)).unwrap();
        match first.outcome {
            MatchOutcome::Settled { member_id, .. } => assert_eq!(member_id, candidates[0].id),
            other => panic!("expected settle, got {:?}", other),
        }

        // Second deposit falls through to the remaining pending one
        let second = engine.ingest(&mut conn, notice("Kim Minsu", FEE)).unwrap();
        match second.outcome {
            MatchOutcome::Settled { member_id, .. } => assert_eq!(member_id, candidates[1].id),
            other => panic!("expected settle, got {:?}", other),
        }

        // Third has nobody left to settle
        let third = engine.ingest(&mut conn, notice("Kim Minsu", FEE)).unwrap();
        assert_eq!(third.outcome, MatchOutcome::AlreadySettled { group_id });
    }

    #[test]
    fn test_replay_does_not_resettle() {
        let mut conn = db::open_in_memory().unwrap();
        let group_id = seed(&conn, &["Kim Minsu"]);
        let engine = ReconciliationEngine::new();

        let sent_at = Utc::now() - Duration::minutes(30);
        let mut original = notice("Kim Minsu", FEE);
        original.received_at = Some(sent_at);

        let first = engine.ingest(&mut conn, original.clone()).unwrap();
        assert!(first.outcome.is_settled());

        let replay = engine.ingest(&mut conn, original).unwrap();
        assert_eq!(replay.outcome, MatchOutcome::AlreadySettled { group_id });

        // paid_at unchanged, both notices stored, same fingerprint
        let obligation_id = match first.outcome {
            MatchOutcome::Settled { obligation_id, .. } => obligation_id,
            _ => unreachable!(),
        };
        let settled = obligation::find_by_id(&conn, obligation_id).unwrap().unwrap();
        assert_eq!(settled.paid_at.unwrap().to_rfc3339(), sent_at.to_rfc3339());

        assert_eq!(notification_count(&conn), 2);
        let stored = notification::find_by_receipt(&conn, &replay.receipt)
            .unwrap()
            .unwrap();
        assert_eq!(
            notification::count_by_fingerprint(&conn, &stored.fingerprint).unwrap(),
            2
        );
    }

    #[test]
    fn test_two_active_cycles_is_an_error() {
        let mut conn = db::open_in_memory().unwrap();
        let group_id = seed(&conn, &["Kim Minsu"]);

        // cycle::open refuses this, so corrupt the table directly
        conn.execute(
            "INSERT INTO cycles (group_id, period, status) VALUES (?1, '2025-07', 'ACTIVE')",
            rusqlite::params![group_id],
        )
        .unwrap();

        let err = ReconciliationEngine::new()
            .ingest(&mut conn, notice("Kim Minsu", FEE))
            .unwrap_err();

        let receipt = match err {
            IngestError::CycleInvariant {
                group_id: g,
                count,
                receipt,
            } => {
                assert_eq!(g, group_id);
                assert_eq!(count, 2);
                receipt
            }
            other => panic!("expected cycle invariant error, got {:?}", other),
        };

        // The audit row still landed, and the error points at it
        assert_eq!(notification_count(&conn), 1);
        let stored = notification::find_by_receipt(&conn, &receipt).unwrap().unwrap();
        assert_eq!(stored.payer_name, "Kim Minsu");
        assert!(stored.settled_obligation_id.is_none());
    }

    #[test]
    fn test_wire_notice_without_timestamp_defaults_to_ingest_time() {
        let mut conn = db::open_in_memory().unwrap();
        seed(&conn, &["Kim Minsu"]);

        // Webhook payload shape, received_at omitted
        let wire: DepositNotice = serde_json::from_str(
            r#"{ "payer_name": "Kim Minsu", "amount": 10000,
                 "destination_account": "110-123-456789" }"#,
        )
        .unwrap();

        let before = Utc::now();
        let receipt = ReconciliationEngine::new().ingest(&mut conn, wire).unwrap();
        let after = Utc::now();

        assert!(receipt.outcome.is_settled());
        assert!(receipt.received_at >= before && receipt.received_at <= after);

        // The stored row and the settled obligation both carry the default
        let stored = notification::find_by_receipt(&conn, &receipt.receipt)
            .unwrap()
            .unwrap();
        assert_eq!(stored.received_at.to_rfc3339(), receipt.received_at.to_rfc3339());

        let obligation_id = match receipt.outcome {
            MatchOutcome::Settled { obligation_id, .. } => obligation_id,
            _ => unreachable!(),
        };
        let settled = obligation::find_by_id(&conn, obligation_id).unwrap().unwrap();
        assert_eq!(
            settled.paid_at.unwrap().to_rfc3339(),
            receipt.received_at.to_rfc3339()
        );
    }

    #[test]
    fn test_concurrent_notices_settle_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dues.db");

        {
            let conn = db::open_database(&path).unwrap();
            seed(&conn, &["Kim Minsu"]);
        }

        let mut handles = Vec::new();
        for _ in 0..2 {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                let mut conn = db::open_database(&path).unwrap();
                ReconciliationEngine::new()
                    .ingest(&mut conn, notice("Kim Minsu", FEE))
                    .unwrap()
            }));
        }

        let receipts: Vec<IngestReceipt> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let settled = receipts.iter().filter(|r| r.outcome.is_settled()).count();
        assert_eq!(settled, 1);
        for receipt in &receipts {
            if !receipt.outcome.is_settled() {
                assert!(matches!(receipt.outcome, MatchOutcome::AlreadySettled { .. }));
            }
        }

        let conn = db::open_database(&path).unwrap();
        let paid: i64 = conn
            .query_row("SELECT COUNT(*) FROM obligations WHERE status = 'PAID'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(paid, 1);
        assert_eq!(notification_count(&conn), 2);

        let stamped: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM notifications WHERE settled_obligation_id IS NOT NULL",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(stamped, 1);

        println!("✅ exactly one PAID transition across {} writers", receipts.len());
    }
}
