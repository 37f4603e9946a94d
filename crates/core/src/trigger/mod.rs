//! Trigger state machine: durable rules that turn into tasks.

pub mod condition;
pub mod engine;
pub mod settle;
pub mod store;

pub use condition::{BuiltinEvaluator, ConditionEvaluator, EvalError, EvalOutcome, Evaluation};
pub use engine::{EngineOptions, TickOutcome, process_triggers};
pub use settle::settle;
pub use store::{FileTriggerStore, MemoryTriggerStore, StoreError, TriggerStore};
