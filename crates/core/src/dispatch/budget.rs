use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Persisted daily token counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetState {
    /// UTC date the counter belongs to.
    pub date: NaiveDate,
    pub spent: u64,
}

impl Default for BudgetState {
    fn default() -> Self {
        Self {
            date: Utc::now().date_naive(),
            spent: 0,
        }
    }
}

/// Admission cost estimate: roughly two characters per token, with a floor.
pub fn estimate_cost(prompt: &str, min_tokens: u64) -> u64 {
    let chars = prompt.chars().count() as u64;
    chars.div_ceil(2).max(min_tokens)
}

/// Daily token budget. A limit of 0 disables it.
#[derive(Debug, Clone)]
pub struct TokenBudget {
    state: BudgetState,
    limit: u64,
}

impl TokenBudget {
    pub fn new(state: BudgetState, limit: u64) -> Self {
        Self { state, limit }
    }

    /// Reset the counter when the UTC date changed. Returns whether it rolled.
    pub fn roll(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if self.state.date == today {
            return false;
        }
        tracing::info!(previous = %self.state.date, spent = self.state.spent, "token budget rolled over");
        self.state = BudgetState {
            date: today,
            spent: 0,
        };
        true
    }

    pub fn is_exhausted(&self) -> bool {
        self.limit > 0 && self.state.spent >= self.limit
    }

    pub fn fits(&self, cost: u64) -> bool {
        self.fits_with(0, cost)
    }

    /// Like [`fits`](Self::fits), counting `reserved` tokens already promised
    /// to running tasks.
    pub fn fits_with(&self, reserved: u64, cost: u64) -> bool {
        self.limit == 0
            || self
                .state
                .spent
                .saturating_add(reserved)
                .saturating_add(cost)
                <= self.limit
    }

    pub fn charge(&mut self, tokens: u64) {
        self.state.spent = self.state.spent.saturating_add(tokens);
    }

    pub fn state(&self) -> BudgetState {
        self.state
    }

    pub fn spent(&self) -> u64 {
        self.state.spent
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}
