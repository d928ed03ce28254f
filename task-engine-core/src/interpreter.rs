use crate::activity::Timeouts;
use crate::driver::ExecutionDriver;
use crate::error::{EngineError, EngineResult};
use crate::orchestrator;
use crate::types::*;
use serde_json::{json, Value};

/// Evaluates the small expression grammar used by `EvaluateStep` and by the
/// pure fields of composite steps (`condition`, `value`, `in`, ...).
pub fn eval_expr(expr: &Expr, input: &Value) -> EngineResult<Value> {
    match expr {
        Expr::Input => Ok(input.clone()),
        Expr::Literal { value } => Ok(value.clone()),
        Expr::Field { of, name } => {
            let base = eval_expr(of, input)?;
            Ok(base.get(name).cloned().unwrap_or(Value::Null))
        }
        Expr::BinaryOp { op, lhs, rhs } => {
            let l = eval_expr(lhs, input)?;
            let r = eval_expr(rhs, input)?;
            let (l, r) = (as_f64(&l)?, as_f64(&r)?);
            let result = match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => l / r,
            };
            Ok(json!(result))
        }
    }
}

fn as_f64(v: &Value) -> EngineResult<f64> {
    v.as_f64().ok_or_else(|| EngineError::BadInput(format!("expected a number, got {v}")))
}

/// Computes the outcome of a pure-evaluator step from its own definition and
/// the current input. This is the computation the built-in `*_step`
/// activities in `builtin_activities` wrap — kept free-standing so it can be
/// unit-tested without going through the dispatcher.
pub(crate) fn eval_pure_step(step: &Step, current_input: &Value) -> EngineResult<Value> {
    let output = match step {
        Step::Evaluate { expr } => eval_expr(expr, current_input)?,
        Step::Return { value } => eval_expr(value, current_input)?,
        Step::Set { value, .. } => eval_expr(value, current_input)?,
        Step::Yield { output, .. } => eval_expr(output, current_input)?,
        Step::WaitForInput { prompt } => prompt.clone(),
        Step::IfElse { condition, .. } => {
            let v = eval_expr(condition, current_input)?;
            json!(is_truthy(&v))
        }
        Step::Switch { switch } => {
            let current_json = current_input.to_string();
            let index = switch
                .iter()
                .position(|c| c.case == "_" || c.case == current_json)
                .map(|i| i as i64 + 1)
                .unwrap_or(0);
            json!(index)
        }
        Step::Foreach { r#in, .. } => eval_expr(r#in, current_input)?,
        Step::MapReduce { r#in, .. } => eval_expr(r#in, current_input)?,
        other => {
            return Err(EngineError::BadInput(format!("{} is not a pure evaluator step", other.kind())));
        }
    };
    Ok(output)
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Result of resolving a tool call (shared by `PromptStep` and
/// `ToolCallStep` per the governing symmetry requirement).
pub enum ToolCallDispatch {
    /// A human/external actor must supply the result; the driver commits a
    /// `wait` transition and suspends. `resume_activity`, if set, names the
    /// activity re-dispatched with the resume payload once it arrives.
    Suspend { payload: Value, resume_activity: Option<&'static str> },
    Immediate(Value),
}

/// Dispatches one `tool_calls[0]`-shaped value to the matching activity.
/// Used identically by `ToolCallStep` and `PromptStep`'s auto-run path.
pub async fn dispatch_tool_call(
    driver: &ExecutionDriver,
    ctx: &StepContext,
    tool_call: &Value,
    resume_activity_on_function: Option<&'static str>,
) -> EngineResult<ToolCallDispatch> {
    let kind = tool_call.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "function" => {
            Ok(ToolCallDispatch::Suspend { payload: tool_call.clone(), resume_activity: resume_activity_on_function })
        }
        "integration" => {
            let call = tool_call.get("integration").cloned().unwrap_or(Value::Null);
            let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
            let tool = ctx
                .tools()
                .iter()
                .find(|t| t.name == name && t.r#type == ToolCallType::Integration)
                .ok_or_else(|| EngineError::NotFound(format!("Integration {name} not found")))?;
            let input = json!({ "tool": tool.name, "spec": tool.spec, "arguments": call.get("arguments") });
            let output = driver
                .activities
                .dispatch("execute_integration", ctx, input, Timeouts::debug(), &RetryPolicy::default_policy())
                .await?;
            Ok(ToolCallDispatch::Immediate(output))
        }
        "api_call" => {
            let call = tool_call.get("api_call").cloned().unwrap_or(Value::Null);
            let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
            let tool = ctx
                .tools()
                .iter()
                .find(|t| t.name == name && t.r#type == ToolCallType::ApiCall)
                .ok_or_else(|| EngineError::NotFound(format!("Integration {name} not found")))?;
            let mut arguments = call.get("arguments").cloned().unwrap_or(json!({}));
            if let Some(obj) = arguments.as_object_mut() {
                if let Some(json_body) = obj.remove("json_") {
                    obj.insert("json".to_string(), json_body);
                }
            }
            let input = json!({ "tool": tool.name, "spec": tool.spec, "arguments": arguments });
            let output = driver
                .activities
                .dispatch("execute_api_call", ctx, input, Timeouts::debug(), &RetryPolicy::default_policy())
                .await?;
            Ok(ToolCallDispatch::Immediate(output))
        }
        "system" => {
            let call = tool_call.get("system").cloned().unwrap_or(Value::Null);
            let output = driver
                .activities
                .dispatch("execute_system", ctx, call, Timeouts::debug(), &RetryPolicy::default_policy())
                .await?;
            Ok(ToolCallDispatch::Immediate(output))
        }
        other => Err(EngineError::NotImplemented(format!("unsupported tool-call type: {other}"))),
    }
}

/// The Step Interpreter (C5): consumes a step's outcome and produces a
/// `PartialTransition`. Composite steps (branches, loops, map-reduce)
/// recurse into the orchestrator, which drives full child executions
/// through the same driver.
pub async fn interpret(
    driver: &ExecutionDriver,
    ctx: &StepContext,
    step: &Step,
    outcome: StepOutcome,
) -> EngineResult<PartialTransition> {
    if let Some(message) = outcome.error {
        return Err(EngineError::ActivityFailure(message));
    }

    match step {
        Step::Log { log } => {
            let mut metadata = std::collections::BTreeMap::new();
            metadata.insert("log".to_string(), json!(log));
            Ok(PartialTransition { output: Some(ctx.current_input.clone()), metadata, ..Default::default() })
        }

        Step::Evaluate { .. } => Ok(PartialTransition::output(outcome.output)),

        Step::Return { .. } => {
            let t = if ctx.is_main { TransitionType::Finish } else { TransitionType::FinishBranch };
            Ok(PartialTransition::output(outcome.output).with_type(t))
        }

        Step::Set { .. } => Ok(PartialTransition {
            output: Some(ctx.current_input.clone()),
            user_state: Some(outcome.output),
            ..Default::default()
        }),

        Step::Get { get } => {
            let value = ctx.user_state.get(get).cloned().unwrap_or(Value::Null);
            Ok(PartialTransition::output(value))
        }

        Step::Sleep { seconds, minutes, hours, days } => {
            let total = seconds + minutes * 60 + hours * 3600 + days * 86400;
            if total == 0 {
                return Err(EngineError::BadInput("Sleep duration must be greater than 0".into()));
            }
            tracing::info!(total_seconds = total, "sleeping");
            tokio::time::sleep(std::time::Duration::from_secs(total)).await;
            Ok(PartialTransition::output(ctx.current_input.clone()))
        }

        Step::Error { message } => {
            Ok(PartialTransition::output(json!(message)).with_type(TransitionType::Error))
        }

        Step::Yield { to, transition_type, .. } => Ok(PartialTransition {
            r#type: Some(*transition_type),
            output: Some(outcome.output),
            next: Some(to.clone()),
            ..Default::default()
        }),

        Step::WaitForInput { .. } => Ok(PartialTransition {
            r#type: Some(TransitionType::Wait),
            output: Some(outcome.output),
            ..Default::default()
        }),

        Step::IfElse { then, r#else, .. } => {
            let condition = outcome.output.as_bool().unwrap_or(false);
            let branch = if condition {
                Some(then.as_ref())
            } else {
                r#else.as_deref()
            };
            let output = match branch {
                Some(step) => orchestrator::run_branch(driver, ctx, "if_else", step, ctx.current_input.clone()).await?,
                None => Value::Null,
            };
            Ok(PartialTransition::output(output))
        }

        Step::Switch { switch } => {
            let index = outcome.output.as_i64().unwrap_or(0);
            if index < 0 {
                return Err(EngineError::BadInput("Negative indices not allowed".into()));
            }
            if index == 0 {
                return Ok(PartialTransition::output(Value::Null));
            }
            let case = switch
                .get((index - 1) as usize)
                .ok_or_else(|| EngineError::BadInput(format!("switch index {index} out of range")))?;
            let output =
                orchestrator::run_branch(driver, ctx, "switch", &case.then, ctx.current_input.clone()).await?;
            Ok(PartialTransition::output(output))
        }

        Step::Foreach { r#do, .. } => {
            let items = outcome.output.as_array().cloned().unwrap_or_default();
            let mut results = Vec::with_capacity(items.len());
            for item in items {
                results.push(orchestrator::run_branch(driver, ctx, "foreach", r#do, item).await?);
            }
            Ok(PartialTransition::output(Value::Array(results)))
        }

        Step::MapReduce { map, reduce, initial, parallelism, .. } => {
            let items = outcome.output.as_array().cloned().unwrap_or_default();
            let mapped = if *parallelism > 1 {
                orchestrator::run_map_parallel(driver, ctx, map, items, *parallelism).await?
            } else {
                let mut results = Vec::with_capacity(items.len());
                for item in items {
                    results.push(orchestrator::run_branch(driver, ctx, "map", map, item).await?);
                }
                results
            };
            let mut acc = initial.clone();
            for item in mapped {
                let pair = json!({ "acc": acc, "item": item });
                acc = orchestrator::run_branch(driver, ctx, "reduce", reduce, pair).await?;
            }
            Ok(PartialTransition::output(acc))
        }

        Step::Prompt { unwrap, auto_run_tools, .. } => {
            let message = outcome.output;
            let finish_reason = message
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("finish_reason"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if *unwrap || !*auto_run_tools || finish_reason != "tool_calls" {
                return Ok(PartialTransition::output(message));
            }
            let tool_call = message
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("tool_calls"))
                .and_then(|tc| tc.get(0))
                .cloned()
                .unwrap_or(Value::Null);

            match dispatch_tool_call(driver, ctx, &tool_call, Some("prompt_step")).await? {
                ToolCallDispatch::Immediate(output) => Ok(PartialTransition::output(output)),
                ToolCallDispatch::Suspend { payload, resume_activity } => {
                    let mut metadata = std::collections::BTreeMap::new();
                    metadata.insert("resume_kind".to_string(), json!("prompt_function"));
                    metadata.insert("prompt_message".to_string(), message);
                    if let Some(activity) = resume_activity {
                        metadata.insert("resume_activity".to_string(), json!(activity));
                    }
                    Ok(PartialTransition { r#type: Some(TransitionType::Wait), output: Some(payload), metadata, ..Default::default() })
                }
            }
        }

        Step::ToolCall { .. } => match dispatch_tool_call(driver, ctx, &outcome.output, None).await? {
            ToolCallDispatch::Immediate(output) => Ok(PartialTransition::output(output)),
            ToolCallDispatch::Suspend { payload, .. } => {
                let mut metadata = std::collections::BTreeMap::new();
                metadata.insert("resume_kind".to_string(), json!("tool_call_step"));
                Ok(PartialTransition { r#type: Some(TransitionType::Wait), output: Some(payload), metadata, ..Default::default() })
            }
        },

        Step::Parallel { .. } => Err(EngineError::NotImplemented("ParallelStep".into())),
    }
}
