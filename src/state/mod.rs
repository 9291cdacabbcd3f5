//! State module for run, page, change and delivery lifecycles
//!
//! # Components
//!
//! - `RunStatus`: Lifecycle of a crawl run (pending, running, terminal states)
//! - `PageState` / `PageIssue`: Liveness of a tracked page and non-fatal problems
//! - `ChangeType` / `ChangeKind`: Classification of a detected change
//! - `DeliveryState`, `Channel`, `TaskKind`: Notification task bookkeeping

mod change;
mod delivery;
mod page_state;
mod run_status;

// Re-export main types
pub use change::{ChangeKind, ChangeType};
pub use delivery::{Channel, DeliveryState, TaskKind};
pub use page_state::{PageIssue, PageState};
pub use run_status::RunStatus;
