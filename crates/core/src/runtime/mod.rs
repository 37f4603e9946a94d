mod scheduler;
mod shutdown;
mod trigger_loop;

pub use scheduler::{
    DataLayout, ExitStatus, RESTART_EXIT_CODE, Runtime, RuntimeBuilder, RuntimeError, RuntimeHandle,
    RuntimeOutputs,
};
pub use shutdown::ShutdownGuard;
pub use trigger_loop::TriggerLoop;
pub use crate::types::DispatchStatus;
