use crate::activity::{Activity, ActivityRegistry};
use crate::error::{ActivityError, EngineError};
use crate::interpreter;
use crate::types::{NonRetryableClass, Step, StepContext};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Backs the nine pure-evaluator step kinds (`evaluate_step`, `return_step`,
/// `set_value_step`, `yield_step`, `wait_for_input_step`, `if_else_step`,
/// `switch_step`, `for_each_step`, `map_reduce_step`) that the activity
/// catalogue names as ordinary activities even though their outcome is
/// computed locally from the step definition rather than by calling out to
/// an external system. Routing them through `ActivityRegistry::dispatch`
/// like every other activity keeps timeout/retry/tracing behavior uniform
/// and lets an embedder override any one of them — a custom `switch_step`
/// that returns a negative index, say, to drive the `BadInput` path the
/// default position-matching algorithm can never reach on its own.
struct PureEvaluatorActivity;

#[async_trait]
impl Activity for PureEvaluatorActivity {
    async fn call(&self, _ctx: &StepContext, input: Value) -> Result<Value, ActivityError> {
        let envelope = input.get("step").cloned().ok_or_else(|| {
            ActivityError::non_retryable(
                "pure evaluator activity invoked without a step envelope",
                NonRetryableClass::BadInput,
            )
        })?;
        let step: Step = serde_json::from_value(envelope).map_err(|e| {
            ActivityError::non_retryable(format!("malformed step envelope: {e}"), NonRetryableClass::BadInput)
        })?;
        let current_input = input.get("input").cloned().unwrap_or(Value::Null);
        interpreter::eval_pure_step(&step, &current_input).map_err(to_activity_error)
    }
}

fn to_activity_error(err: EngineError) -> ActivityError {
    match err {
        EngineError::BadInput(msg) => ActivityError::non_retryable(msg, NonRetryableClass::BadInput),
        other => ActivityError::retryable(other.to_string()),
    }
}

/// Registers the nine built-in pure-evaluator activities under the names
/// `registry::activity_for` hands out for them. `ActivityRegistry::new`
/// calls this so embedders get working defaults out of the box and only
/// need to `register` an override for the ones they want to replace.
pub fn register_defaults(registry: &mut ActivityRegistry) {
    let activity: Arc<dyn Activity> = Arc::new(PureEvaluatorActivity);
    for name in [
        "evaluate_step",
        "return_step",
        "set_value_step",
        "yield_step",
        "wait_for_input_step",
        "if_else_step",
        "switch_step",
        "for_each_step",
        "map_reduce_step",
    ] {
        registry.register(name, activity.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CaseThen, Expr, Task, TransitionTarget};
    use serde_json::json;
    use uuid::Uuid;

    fn ctx() -> StepContext {
        StepContext {
            execution_id: Uuid::now_v7(),
            task: Arc::new(Task { task_id: Uuid::now_v7(), name: "t".into(), tools: vec![], workflows: vec![] }),
            cursor: TransitionTarget::main(0),
            current_input: json!(null),
            user_state: json!({}),
            is_main: true,
            is_first_step: true,
        }
    }

    #[tokio::test]
    async fn return_step_evaluates_the_envelope() {
        let activity = PureEvaluatorActivity;
        let step = Step::Return { value: Expr::Input };
        let input = json!({ "step": step, "input": 7 });
        let output = activity.call(&ctx(), input).await.unwrap();
        assert_eq!(output, json!(7));
    }

    #[tokio::test]
    async fn switch_step_defaults_to_position_matching() {
        let activity = PureEvaluatorActivity;
        let step = Step::Switch {
            switch: vec![CaseThen { case: "_".into(), then: Box::new(Step::Get { get: "k".into() }) }],
        };
        let input = json!({ "step": step, "input": null });
        let output = activity.call(&ctx(), input).await.unwrap();
        assert_eq!(output, json!(1));
    }
}
