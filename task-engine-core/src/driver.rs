use crate::activity::{ActivityRegistry, Timeouts};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::interpreter;
use crate::registry;
use crate::store::TransitionStore;
use crate::types::*;
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What happened to an execution after one driver pass.
#[derive(Debug)]
pub enum DriveOutcome {
    /// Reached a terminal transition; carries the final output.
    Finished(serde_json::Value),
    /// Committed a `wait` transition; the execution is parked until
    /// `resume_with_input` or `cancel` is signalled.
    Suspended,
}

/// The Execution Driver (C8): owns the per-step loop described by the
/// governing design — dispatch, interpret, commit, advance — and the
/// bounded-channel signal intake (`set_last_error`, `cancel`,
/// `resume_with_input`).
pub struct ExecutionDriver {
    pub store: Arc<dyn TransitionStore>,
    pub activities: ActivityRegistry,
    pub config: EngineConfig,
}

impl ExecutionDriver {
    pub fn new(store: Arc<dyn TransitionStore>, activities: ActivityRegistry, config: EngineConfig) -> Self {
        Self { store, activities, config }
    }

    fn step_timeouts(&self) -> Timeouts {
        if self.config.debug || self.config.testing {
            Timeouts::debug()
        } else {
            Timeouts::production(self.config.schedule_to_close_timeout, self.config.heartbeat_timeout)
        }
    }

    /// Runs `step` to completion (dispatch its activity if it has one, then
    /// interpret the outcome) without touching the transition log. Used both
    /// by `drive` for top-level steps and by the orchestrator for composite
    /// branch bodies.
    pub fn run_step<'a>(&'a self, ctx: &'a StepContext, step: &'a Step) -> BoxFuture<'a, EngineResult<PartialTransition>> {
        Box::pin(async move {
            let outcome = self.dispatch_step(ctx, step).await?;
            interpreter::interpret(self, ctx, step, outcome).await
        })
    }

    async fn dispatch_step(&self, ctx: &StepContext, step: &Step) -> EngineResult<StepOutcome> {
        let Some(activity_name) = registry::activity_for(step) else {
            return Ok(StepOutcome::new(ctx.current_input.clone()));
        };
        // Pure evaluators still go through the dispatcher (timeout, retry,
        // tracing span, overridability) but need the step definition itself
        // to compute their outcome, which a generic `Activity::call(ctx,
        // input)` can't see otherwise — so they get it folded into the
        // envelope alongside the current input.
        let input = if registry::is_pure(step) {
            json!({ "step": step, "input": ctx.current_input.clone() })
        } else {
            ctx.current_input.clone()
        };
        let output = self
            .activities
            .dispatch(activity_name, ctx, input, self.step_timeouts(), &RetryPolicy::default_policy())
            .await?;
        Ok(StepOutcome::new(output))
    }

    /// Suspends the current task until external resume input arrives for
    /// `execution_id`, polling the store. Mirrors the long-ceiling
    /// suspension points (`raise_complete_async`, `WaitForInputStep`)
    /// without holding a worker thread for the whole wait.
    async fn poll_resume_input(&self, execution_id: Uuid) -> EngineResult<Option<serde_json::Value>> {
        let poll_interval = if self.config.debug || self.config.testing {
            std::time::Duration::from_millis(20)
        } else {
            std::time::Duration::from_secs(2)
        };
        let deadline = tokio::time::Instant::now() + Timeouts::long_wait().schedule_to_close;
        loop {
            if self.store.is_cancel_requested(execution_id).await? {
                return Err(EngineError::Cancelled);
            }
            if let Some(input) = self.store.take_resume_input(execution_id).await? {
                return Ok(Some(input));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Advances `execution_id` from its latest committed transition until it
    /// either terminates or suspends. Starting a brand-new execution is just
    /// the case where there is no latest transition yet.
    pub async fn drive(&self, execution_id: Uuid, task: Arc<Task>) -> EngineResult<DriveOutcome> {
        let span = tracing::info_span!("driver.drive", execution_id = %execution_id);
        self.drive_inner(execution_id, task).instrument(span).await
    }

    async fn drive_inner(&self, execution_id: Uuid, task: Arc<Task>) -> EngineResult<DriveOutcome> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {execution_id}")))?;

        let latest = self.store.latest(execution_id).await?;
        let (mut cursor, mut current_input, mut user_state, mut resuming) = match &latest {
            None => (TransitionTarget::main(0), execution.input.clone(), execution.user_state.clone(), false),
            Some(t) if t.r#type == TransitionType::Wait => {
                let Some(resume_value) = self.poll_resume_input(execution_id).await? else {
                    return Ok(DriveOutcome::Suspended);
                };
                (t.from_cursor.clone(), resume_value, execution.user_state.clone(), true)
            }
            Some(t) => (
                t.to_cursor.clone().ok_or_else(|| EngineError::IllegalTransition {
                    from: format!("{:?}", t.r#type),
                    to: "none".into(),
                })?,
                t.output.clone(),
                execution.user_state.clone(),
                false,
            ),
        };

        self.store.update_status(execution_id, ExecutionStatus::Running).await?;

        let mut is_first_step = latest.is_none();
        let mut prev_type = match &latest {
            None => TransitionType::Init,
            Some(t) if t.r#type == TransitionType::Wait => TransitionType::Wait,
            Some(t) => t.r#type,
        };
        loop {
            if self.store.is_cancel_requested(execution_id).await? {
                let transition = self
                    .commit(execution_id, cursor.clone(), TransitionType::Cancelled, json!(null), Default::default())
                    .await?;
                self.store.update_status(execution_id, ExecutionStatus::Cancelled).await?;
                return Ok(DriveOutcome::Finished(transition.output));
            }

            let workflow = task
                .workflow(&cursor.workflow)
                .ok_or_else(|| EngineError::BadInput(format!("unknown workflow {}", cursor.workflow)))?;

            if is_first_step && !resuming {
                let init_type = if cursor.is_main() { TransitionType::Init } else { TransitionType::InitBranch };
                self.commit(execution_id, cursor.clone(), init_type, current_input.clone(), Default::default()).await?;
                prev_type = init_type;
            }

            let Some(step) = workflow.steps.get(cursor.step) else {
                let t = if cursor.is_main() { TransitionType::Finish } else { TransitionType::FinishBranch };
                let transition = self.commit(execution_id, cursor.clone(), t, current_input.clone(), Default::default()).await?;
                self.store.update_status(execution_id, ExecutionStatus::Succeeded).await?;
                return Ok(DriveOutcome::Finished(transition.output));
            };

            let ctx = StepContext {
                execution_id,
                task: task.clone(),
                cursor: cursor.clone(),
                current_input: current_input.clone(),
                user_state: user_state.clone(),
                is_main: cursor.is_main(),
                is_first_step,
            };

            let attempted = if resuming {
                self.resume_partial(&ctx, &latest).await
            } else {
                self.run_step(&ctx, step).await
            };
            let partial = match attempted {
                Ok(partial) => partial,
                Err(err) => {
                    let (error_type, status) = match &err {
                        EngineError::Cancelled => (TransitionType::Cancelled, ExecutionStatus::Cancelled),
                        _ => (TransitionType::Error, ExecutionStatus::Failed),
                    };
                    self.commit(execution_id, cursor.clone(), error_type, json!(error_message(&err)), Default::default())
                        .await?;
                    self.store.update_status(execution_id, status).await?;
                    return Err(err);
                }
            };

            if let Some(state) = &partial.user_state {
                user_state = state.clone();
                self.store.update_user_state(execution_id, &user_state).await?;
            }

            let committed = self.commit_partial(execution_id, &cursor, &workflow.steps.len(), prev_type, partial).await?;

            if committed.r#type.is_terminal() {
                let status = match committed.r#type {
                    TransitionType::Error => ExecutionStatus::Failed,
                    TransitionType::Cancelled => ExecutionStatus::Cancelled,
                    _ => ExecutionStatus::Succeeded,
                };
                self.store.update_status(execution_id, status).await?;
                if committed.r#type == TransitionType::Error {
                    return Err(EngineError::ActivityFailure(
                        committed.output.as_str().unwrap_or("step failed").to_string(),
                    ));
                }
                return Ok(DriveOutcome::Finished(committed.output));
            }

            if committed.r#type == TransitionType::Wait {
                self.store.update_status(execution_id, ExecutionStatus::AwaitingInput).await?;
                return Ok(DriveOutcome::Suspended);
            }

            let next = committed
                .to_cursor
                .clone()
                .ok_or_else(|| EngineError::IllegalTransition { from: "step".into(), to: "none".into() })?;
            cursor = next;
            current_input = committed.output;
            is_first_step = false;
            resuming = false;
            prev_type = committed.r#type;
        }
    }

    /// Rebuilds the `PartialTransition` for a step resuming from a `wait`,
    /// per the `resume_kind` stamped into the wait transition's metadata by
    /// the interpreter.
    async fn resume_partial(&self, ctx: &StepContext, latest: &Option<Transition>) -> EngineResult<PartialTransition> {
        let wait = latest.as_ref().expect("resuming implies a prior wait transition");
        let resume_value = ctx.current_input.clone();
        match wait.metadata.get("resume_kind").and_then(|v| v.as_str()) {
            Some("prompt_function") => {
                let message = wait.metadata.get("prompt_message").cloned().unwrap_or(json!(null));
                let appended = json!([message, resume_value]);
                let new_response = self
                    .activities
                    .dispatch("prompt_step", ctx, appended, self.step_timeouts(), &RetryPolicy::default_policy())
                    .await?;
                Ok(PartialTransition::resume(new_response))
            }
            Some("tool_call_step") | None => Ok(PartialTransition::resume(resume_value)),
            Some(other) => Err(EngineError::IllegalTransition { from: other.to_string(), to: "resume".into() }),
        }
    }

    /// Appends a transition built fresh for each attempt (so its `seq` tracks
    /// the store's current tail), retrying on `Conflict` rather than
    /// surfacing it. Concurrent branches of the same execution (`map_reduce`
    /// with `parallelism > 1`) can race to commit `init_branch`/
    /// `finish_branch` against the same log; sequential callers just never
    /// hit the retry.
    async fn append_with_retry(
        &self,
        execution_id: Uuid,
        build: impl Fn(u64) -> Transition,
    ) -> EngineResult<Transition> {
        loop {
            let seq = self.store.latest(execution_id).await?.map(|t| t.seq + 1).unwrap_or(0);
            let transition = build(seq);
            match self.store.append(transition.clone()).await {
                Ok(_) => return Ok(transition),
                Err(crate::error::StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(EngineError::from(e)),
            }
        }
    }

    pub(crate) async fn commit(
        &self,
        execution_id: Uuid,
        from_cursor: TransitionTarget,
        r#type: TransitionType,
        output: serde_json::Value,
        metadata: std::collections::BTreeMap<String, serde_json::Value>,
    ) -> EngineResult<Transition> {
        let mut metadata = metadata;
        if let Some(last_error) = self.store.take_last_error(execution_id).await? {
            metadata.insert("last_error".to_string(), json!(last_error));
        }
        let to_cursor = match r#type {
            TransitionType::Finish | TransitionType::FinishBranch | TransitionType::Error | TransitionType::Cancelled => None,
            _ => Some(from_cursor.clone()),
        };
        self.append_with_retry(execution_id, |seq| Transition {
            execution_id,
            seq,
            from_cursor: from_cursor.clone(),
            r#type,
            to_cursor: to_cursor.clone(),
            output: output.clone(),
            metadata: metadata.clone(),
            created_at: now_ms(),
        })
        .await
    }

    /// Fills in `PartialTransition` defaults per the transition engine's
    /// rules, validates the resolved edge, and commits.
    ///
    /// `init`/`init_branch` has no edge straight to `finish`/`finish_branch`
    /// in the legal-successor table — every scope passes through at least
    /// one `step` first. A step whose own outcome would otherwise close the
    /// scope immediately (the only step of a one-step workflow, or an
    /// explicit `return`/`yield` as a scope's very first step) gets that
    /// intermediate `step` transition committed for free, carrying the same
    /// output, before the closing transition.
    pub(crate) async fn commit_partial(
        &self,
        execution_id: Uuid,
        cursor: &TransitionTarget,
        workflow_len: &usize,
        prev_type: TransitionType,
        partial: PartialTransition,
    ) -> EngineResult<Transition> {
        let resolved_type = partial.r#type.unwrap_or(TransitionType::Step);
        let next = partial.next.clone().unwrap_or_else(|| {
            if cursor.step + 1 >= *workflow_len {
                cursor.clone()
            } else {
                cursor.next()
            }
        });
        let default_type = if partial.r#type.is_none() && cursor.step + 1 >= *workflow_len {
            if cursor.is_main() { TransitionType::Finish } else { TransitionType::FinishBranch }
        } else {
            resolved_type
        };

        let output = partial.output.unwrap_or(json!(null));
        let mut metadata = partial.metadata;
        if let Some(last_error) = self.store.take_last_error(execution_id).await? {
            metadata.insert("last_error".to_string(), json!(last_error));
        }

        let effective_prev = if matches!(prev_type, TransitionType::Init | TransitionType::InitBranch)
            && matches!(default_type, TransitionType::Finish | TransitionType::FinishBranch)
        {
            self.append_with_retry(execution_id, |seq| Transition {
                execution_id,
                seq,
                from_cursor: cursor.clone(),
                r#type: TransitionType::Step,
                to_cursor: Some(cursor.clone()),
                output: output.clone(),
                metadata: metadata.clone(),
                created_at: now_ms(),
            })
            .await?;
            TransitionType::Step
        } else {
            prev_type
        };
        crate::transition_engine::validate(effective_prev, default_type)?;

        let to_cursor = if default_type.is_terminal() { None } else { Some(next.clone()) };
        self.append_with_retry(execution_id, |seq| Transition {
            execution_id,
            seq,
            from_cursor: cursor.clone(),
            r#type: default_type,
            to_cursor: to_cursor.clone(),
            output: output.clone(),
            metadata: metadata.clone(),
            created_at: now_ms(),
        })
        .await
    }
}

/// Extracts the inner message embedded application code expects to see
/// verbatim in a committed `error` transition's output, instead of the
/// `Display`-formatted `"bad input: ..."`-style prefix `thiserror` adds.
fn error_message(err: &EngineError) -> String {
    match err {
        EngineError::BadInput(msg)
        | EngineError::NotFound(msg)
        | EngineError::ActivityFailure(msg)
        | EngineError::NotImplemented(msg)
        | EngineError::Transient(msg) => msg.clone(),
        other => other.to_string(),
    }
}
