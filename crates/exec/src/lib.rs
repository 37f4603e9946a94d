//! Execution seam for dispatched tasks.
//!
//! The dispatcher in `vigil-core` only knows [`runner::TaskRunner`]; concrete
//! backends (model providers, subprocesses, remote agents) live behind it.

pub mod command;
pub mod runner;

pub use command::CommandRunner;
pub use runner::{MockRunner, RunError, RunOutput, RunRequest, TaskRunner, Usage};
