//! vigil: an always-on agent runtime.
//!
//! Triggers, cron jobs and idle intents turn into tasks or system inputs;
//! the dispatcher runs tasks under a concurrency bound and a daily token
//! budget; state survives restarts through an atomic snapshot.

pub mod activity;
pub mod boot;
pub mod config;
pub mod dispatch;
pub mod evolve;
pub mod io;
pub mod persist;
pub mod runtime;
pub mod trigger;
pub mod types;
pub mod wake;
