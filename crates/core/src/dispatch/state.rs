use std::collections::{HashMap, HashSet};

use tokio_util::sync::CancellationToken;

use crate::dispatch::budget::TokenBudget;

/// Dispatcher-owned runtime state. Only the dispatch loop writes it.
#[derive(Debug)]
pub struct DispatchState {
    running: HashSet<String>,
    cancels: HashMap<String, CancellationToken>,
    pub budget: TokenBudget,
    /// Admission estimate charged when a runner reports no usage.
    estimates: HashMap<String, u64>,
    /// Tasks already reported as budget-deferred.
    deferred: HashSet<String>,
}

impl DispatchState {
    pub fn new(budget: TokenBudget) -> Self {
        Self {
            running: HashSet::new(),
            cancels: HashMap::new(),
            budget,
            estimates: HashMap::new(),
            deferred: HashSet::new(),
        }
    }

    /// Track a task as running and issue its cancellation token.
    pub fn register(&mut self, task_id: &str, estimate: u64) -> CancellationToken {
        if let Some(old) = self.cancels.remove(task_id) {
            old.cancel();
        }
        let token = CancellationToken::new();
        self.running.insert(task_id.to_string());
        self.cancels.insert(task_id.to_string(), token.clone());
        self.estimates.insert(task_id.to_string(), estimate);
        self.deferred.remove(task_id);
        token
    }

    /// Forget a finished task. Returns its admission estimate.
    pub fn release(&mut self, task_id: &str) -> u64 {
        self.running.remove(task_id);
        self.cancels.remove(task_id);
        self.estimates.remove(task_id).unwrap_or(0)
    }

    /// Sum of admission estimates held by tasks still in flight.
    pub fn reserved(&self) -> u64 {
        self.estimates
            .values()
            .fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.running.contains(task_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.running.iter().cloned().collect()
    }

    /// Cancel a running task's token. Returns whether one was live.
    pub fn cancel(&mut self, task_id: &str) -> bool {
        match self.cancels.get(task_id) {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for token in self.cancels.values() {
            token.cancel();
        }
    }

    /// Returns `true` the first time a task is deferred.
    pub fn mark_deferred(&mut self, task_id: &str) -> bool {
        self.deferred.insert(task_id.to_string())
    }

    pub fn forget_deferred(&mut self, task_id: &str) {
        self.deferred.remove(task_id);
    }
}
