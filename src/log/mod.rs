//! Mutation log implementation.
//!
//! Each subject has an in-memory, append-only log of change events
//! indexed by store index, optionally backed by a durable journal.

mod journal;
mod mutation_log;

pub use journal::{Journal, JournalConfig, JournalEntry};
pub use mutation_log::{LogConfig, MutationLog, Since};
