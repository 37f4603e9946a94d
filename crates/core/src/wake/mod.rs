//! Low-frequency wake loops: cron jobs and idle intents.

pub mod cron;
pub mod idle;
pub mod intent;
pub mod store;

pub use cron::{CronFire, CronWake};
pub use idle::{IdleAction, IdleWake};
pub use store::{CronStore, IntentStore, JsonListStore};

/// Errors surfaced by a wake tick. The loops log them and keep ticking.
#[derive(Debug, thiserror::Error)]
pub enum WakeError {
    #[error(transparent)]
    Store(#[from] crate::trigger::StoreError),
    #[error(transparent)]
    Journal(#[from] crate::persist::JournalError),
    #[error(transparent)]
    Input(#[from] crate::io::input::InputClosed),
}
