// Dues Ledger - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod config;
pub mod dashboard;
pub mod db;
pub mod domain;
pub mod fees;
pub mod import;
pub mod reconciliation;
pub mod reminder;

// Re-export commonly used types
pub use dashboard::{Dashboard, DashboardCache, RecentPayment};
pub use db::{open_database, open_in_memory, setup_database};
pub use domain::{
    Cycle, CycleStatus, DepositNotice, Group, Member, Notification, Obligation, ObligationStatus,
};
pub use fees::{FeeReport, FeeState, MemberFeeStatus};
pub use import::{ImportReport, SkippedRow};
pub use reconciliation::{IngestError, IngestReceipt, MatchOutcome, ReconciliationEngine};
pub use reminder::{ConsoleSender, Reminder, ReminderSender, RemindReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
