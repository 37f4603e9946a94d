use chrono::{DateTime, Utc};

use crate::types::Trigger;

/// Closed result of evaluating a conditional trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Fired,
    NotFired,
    /// The predicate cannot be decided locally; a model has to judge `prompt`.
    NeedsJudgment { prompt: String },
}

/// Evaluation result plus the evaluator's updated opaque state.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutcome {
    pub result: Evaluation,
    pub state: serde_json::Value,
}

impl EvalOutcome {
    pub fn new(result: Evaluation, state: serde_json::Value) -> Self {
        Self { result, state }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("unsupported condition: {0}")]
    Unsupported(String),
    #[error("condition evaluation failed: {0}")]
    Failed(String),
}

/// Predicate language seam. The engine only consumes the result contract.
#[async_trait::async_trait]
pub trait ConditionEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        trigger: &Trigger,
        condition: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<EvalOutcome, EvalError>;
}

/// Handles constant and `llm_eval` conditions:
///
/// - `true` / `false`
/// - `{"type": "constant", "value": bool}`
/// - `{"type": "llm_eval", "prompt": "..."}` (defaults to the trigger prompt)
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinEvaluator;

#[async_trait::async_trait]
impl ConditionEvaluator for BuiltinEvaluator {
    async fn evaluate(
        &self,
        trigger: &Trigger,
        condition: &serde_json::Value,
        _now: DateTime<Utc>,
    ) -> Result<EvalOutcome, EvalError> {
        let state = trigger.state.eval.clone();
        let verdict = |fired: bool| {
            if fired {
                Evaluation::Fired
            } else {
                Evaluation::NotFired
            }
        };

        if let Some(b) = condition.as_bool() {
            return Ok(EvalOutcome::new(verdict(b), state));
        }

        match condition.get("type").and_then(|t| t.as_str()) {
            Some("constant") => {
                let value = condition
                    .get("value")
                    .and_then(|v| v.as_bool())
                    .ok_or_else(|| EvalError::Unsupported("constant without boolean value".into()))?;
                Ok(EvalOutcome::new(verdict(value), state))
            }
            Some("llm_eval") => {
                let prompt = condition
                    .get("prompt")
                    .and_then(|p| p.as_str())
                    .unwrap_or(&trigger.prompt)
                    .to_string();
                Ok(EvalOutcome::new(Evaluation::NeedsJudgment { prompt }, state))
            }
            Some(other) => Err(EvalError::Unsupported(other.to_string())),
            None => Err(EvalError::Unsupported(condition.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn eval(condition: serde_json::Value) -> Result<EvalOutcome, EvalError> {
        let trigger = Trigger::conditional("c", "fallback prompt", condition.clone());
        BuiltinEvaluator.evaluate(&trigger, &condition, Utc::now()).await
    }

    #[tokio::test]
    async fn constants() {
        assert_eq!(eval(json!(true)).await.unwrap().result, Evaluation::Fired);
        assert_eq!(eval(json!(false)).await.unwrap().result, Evaluation::NotFired);
        assert_eq!(
            eval(json!({"type": "constant", "value": true})).await.unwrap().result,
            Evaluation::Fired
        );
    }

    #[tokio::test]
    async fn llm_eval_asks_for_judgment() {
        let out = eval(json!({"type": "llm_eval", "prompt": "is the build red?"}))
            .await
            .unwrap();
        assert_eq!(
            out.result,
            Evaluation::NeedsJudgment {
                prompt: "is the build red?".into()
            }
        );

        let out = eval(json!({"type": "llm_eval"})).await.unwrap();
        assert_eq!(
            out.result,
            Evaluation::NeedsJudgment {
                prompt: "fallback prompt".into()
            }
        );
    }

    #[tokio::test]
    async fn unknown_shapes_are_rejected() {
        assert!(eval(json!({"type": "cel", "expr": "x > 1"})).await.is_err());
        assert!(eval(json!(42)).await.is_err());
    }
}
