use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::dispatch::queue::TaskBoard;
use crate::io::input::InputSender;
use crate::io::output::{self, ResultSender};

/// Last-activity timestamps of the manager and the worker pool, plus manager busy state.
#[derive(Debug)]
pub struct ActivityClock {
    inner: Mutex<Activity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activity {
    pub last_manager: DateTime<Utc>,
    pub last_worker: DateTime<Utc>,
    /// Manager turns currently in flight.
    pub manager_inflight: usize,
    /// A manager wake has been requested but not yet served.
    pub wake_pending: bool,
}

impl Activity {
    pub fn last_active(&self) -> DateTime<Utc> {
        self.last_manager.max(self.last_worker)
    }
}

impl ActivityClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(Activity {
                last_manager: now,
                last_worker: now,
                manager_inflight: 0,
                wake_pending: false,
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Activity) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn touch_manager(&self, now: DateTime<Utc>) {
        self.with(|a| a.last_manager = a.last_manager.max(now));
    }

    pub fn touch_worker(&self, now: DateTime<Utc>) {
        self.with(|a| a.last_worker = a.last_worker.max(now));
    }

    pub fn manager_started(&self, now: DateTime<Utc>) {
        self.with(|a| {
            a.manager_inflight += 1;
            a.wake_pending = false;
            a.last_manager = a.last_manager.max(now);
        });
    }

    pub fn manager_finished(&self, now: DateTime<Utc>) {
        self.with(|a| {
            a.manager_inflight = a.manager_inflight.saturating_sub(1);
            a.last_manager = a.last_manager.max(now);
        });
    }

    pub fn request_wake(&self) {
        self.with(|a| a.wake_pending = true);
    }

    pub fn snapshot(&self) -> Activity {
        self.with(|a| *a)
    }
}

/// Point-in-time view of everything that keeps the runtime busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Load {
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub pending_inputs: usize,
    pub pending_results: usize,
    pub manager_busy: bool,
    pub wake_pending: bool,
}

impl Load {
    pub fn is_idle(&self) -> bool {
        self.is_idle_besides(0)
    }

    /// Idle apart from `own` pending tasks the caller accounts for itself.
    pub fn is_idle_besides(&self, own: usize) -> bool {
        self.pending_tasks <= own
            && self.running_tasks == 0
            && self.pending_inputs == 0
            && self.pending_results == 0
            && !self.manager_busy
            && !self.wake_pending
    }
}

/// Samples [`Load`] from the queue, the channels and the activity clock.
#[derive(Debug, Clone)]
pub struct LoadProbe {
    pub board: TaskBoard,
    pub inputs: InputSender,
    pub results: ResultSender,
    pub activity: Arc<ActivityClock>,
}

impl LoadProbe {
    pub fn sample(&self) -> Load {
        let activity = self.activity.snapshot();
        let (pending_tasks, running_tasks) = self.board.counts();
        Load {
            pending_tasks,
            running_tasks,
            pending_inputs: self.inputs.pending(),
            pending_results: output::pending(&self.results),
            manager_busy: activity.manager_inflight > 0,
            wake_pending: activity.wake_pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn last_active_is_latest_of_both() {
        let t0 = Utc::now();
        let clock = ActivityClock::new(t0);
        clock.touch_worker(t0 + Duration::seconds(5));
        clock.touch_manager(t0 + Duration::seconds(2));
        assert_eq!(clock.snapshot().last_active(), t0 + Duration::seconds(5));
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let t0 = Utc::now();
        let clock = ActivityClock::new(t0);
        clock.touch_manager(t0 - Duration::seconds(30));
        assert_eq!(clock.snapshot().last_manager, t0);
    }

    #[test]
    fn manager_turn_marks_busy_and_serves_wake() {
        let t0 = Utc::now();
        let clock = ActivityClock::new(t0);
        clock.request_wake();
        assert!(clock.snapshot().wake_pending);
        clock.manager_started(t0);
        let a = clock.snapshot();
        assert_eq!(a.manager_inflight, 1);
        assert!(!a.wake_pending);
        clock.manager_finished(t0);
        assert_eq!(clock.snapshot().manager_inflight, 0);
    }

    #[test]
    fn any_load_means_busy() {
        assert!(Load::default().is_idle());
        let busy = Load {
            pending_inputs: 1,
            ..Load::default()
        };
        assert!(!busy.is_idle());
        let busy = Load {
            manager_busy: true,
            ..Load::default()
        };
        assert!(!busy.is_idle());
    }
}
