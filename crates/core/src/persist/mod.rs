//! Crash-safe runtime snapshot and append-only journals.

pub mod journal;
pub mod snapshot;

pub use journal::{FeedbackEvent, FeedbackKind, FeedbackLog, Journal, JournalError};
pub use snapshot::{Cursors, RuntimeSnapshot, SnapshotError, SnapshotFile, SNAPSHOT_VERSION};
