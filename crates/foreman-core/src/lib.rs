//! Foreman core: shared types, configuration, errors, the event dispatcher,
//! document formats, and the structured journal.

pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod journal;
pub mod types;

pub use config::ForemanConfig;
pub use error::{ForemanError, Result};
pub use events::{topics, DomainEvent, EventDispatcher, EventRecord, Payload};
pub use journal::{AuditEntry, ErrorEntry, Journal, Severity};
pub use types::*;
