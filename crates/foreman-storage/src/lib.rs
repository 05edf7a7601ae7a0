//! Foreman Storage crate - SQLite persistence for items, plans, the retry
//! queue, alert windows, and the job ledger.
//!
//! Provides a WAL-mode SQLite database with migrations, the item store with
//! collision-safe moves, and a process lock on the data directory.

pub mod db;
pub mod items;
pub mod ledger;
pub mod lock;
pub mod migrations;
pub mod plans;
pub mod queue;

pub use db::Database;
pub use items::{ItemStore, MoveRecord, MoveResult, ReceiveOutcome, StageCounts, StageEntry};
pub use ledger::JobLedger;
pub use lock::StoreLock;
pub use plans::PlanInsert;
pub use queue::{AlertWindows, FailedTaskQueue, QueueStats};
