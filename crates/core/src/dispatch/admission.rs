use chrono::{DateTime, Utc};

use crate::activity::Load;
use crate::types::{Task, TaskKind, TaskStatus};

/// Why a candidate is not admitted this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotPending,
    AlreadyRunning,
    Deferred,
    /// `system_evolve` needs the runtime otherwise idle.
    EvolveNotIdle,
    EvolveOutstanding,
}

/// Admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionResult {
    Admitted,
    Rejected(Rejection),
}

/// Runtime facts admission depends on, excluding the candidate itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissionView {
    pub load: Load,
    /// Another `system_evolve` task is pending or running.
    pub other_evolve: bool,
}

/// Check whether `task` may start now. Budget is checked separately so a
/// deferral can be reported.
pub fn check(
    task: &Task,
    already_running: bool,
    view: &AdmissionView,
    now: DateTime<Utc>,
) -> AdmissionResult {
    if task.status != TaskStatus::Pending {
        return AdmissionResult::Rejected(Rejection::NotPending);
    }
    if already_running {
        return AdmissionResult::Rejected(Rejection::AlreadyRunning);
    }
    if task.defer_until.is_some_and(|t| t > now) {
        return AdmissionResult::Rejected(Rejection::Deferred);
    }
    if task.kind == TaskKind::SystemEvolve {
        if view.other_evolve {
            return AdmissionResult::Rejected(Rejection::EvolveOutstanding);
        }
        // the candidate itself is the only pending task allowed
        if !view.load.is_idle_besides(1) {
            return AdmissionResult::Rejected(Rejection::EvolveNotIdle);
        }
    }
    AdmissionResult::Admitted
}
