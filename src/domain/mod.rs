// Domain entities and their repositories
//
// Each entity module pairs the model with thin, single-statement repository
// functions over a rusqlite Connection. None of them contain matching logic;
// the reconciliation pipeline composes them.

pub mod cycle;
pub mod group;
pub mod member;
pub mod notification;
pub mod obligation;

pub use cycle::{Cycle, CycleStatus};
pub use group::Group;
pub use member::Member;
pub use notification::{DepositNotice, Notification};
pub use obligation::{Obligation, ObligationStatus};
