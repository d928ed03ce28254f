use crate::error::ActivityError;
use crate::types::{NonRetryableClass, RetryPolicy, StepContext};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info_span, Instrument};

/// An opaque, retryable, externally-scheduled function invocation.
///
/// Activities are where all network I/O, prompting, and tool dispatch
/// happens; the interpreter never performs side effects directly.
#[async_trait]
pub trait Activity: Send + Sync {
    async fn call(&self, ctx: &StepContext, input: Value) -> Result<Value, ActivityError>;
}

/// Two timeout tiers apply to every dispatch: a short debug/testing window
/// and a long production ceiling, plus an even longer ceiling for
/// suspensions that await external human action.
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    pub schedule_to_close: Duration,
    pub heartbeat: Duration,
}

impl Timeouts {
    pub fn debug() -> Self {
        Self { schedule_to_close: Duration::from_secs(30), heartbeat: Duration::from_secs(10) }
    }

    pub fn production(schedule_to_close: Duration, heartbeat: Duration) -> Self {
        Self { schedule_to_close, heartbeat }
    }

    /// Ceiling used by suspensions that await external action
    /// (`raise_complete_async`, `WaitForInputStep`): roughly 31 days.
    pub fn long_wait() -> Self {
        Self { schedule_to_close: Duration::from_secs(31 * 24 * 3600), heartbeat: Duration::from_secs(60) }
    }
}

/// Maps activity names to implementations and invokes them with retry and
/// timeout enforcement.
pub struct ActivityRegistry {
    activities: HashMap<&'static str, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    /// Starts with the nine built-in pure-evaluator activities already
    /// registered (see `builtin_activities::register_defaults`); `register`
    /// an override to replace any of them with a genuinely external
    /// implementation.
    pub fn new() -> Self {
        let mut registry = Self { activities: HashMap::new() };
        crate::builtin_activities::register_defaults(&mut registry);
        registry
    }

    pub fn register(&mut self, name: &'static str, activity: Arc<dyn Activity>) -> &mut Self {
        self.activities.insert(name, activity);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name).cloned()
    }

    /// Dispatch `name` with `input`, retrying per `policy` with exponential
    /// backoff, bounded by `timeouts.schedule_to_close` across all attempts.
    pub async fn dispatch(
        &self,
        name: &'static str,
        ctx: &StepContext,
        input: Value,
        timeouts: Timeouts,
        policy: &RetryPolicy,
    ) -> Result<Value, ActivityError> {
        let activity = self
            .get(name)
            .ok_or_else(|| ActivityError::non_retryable(format!("unknown activity: {name}"), NonRetryableClass::NotFound))?;

        let span = info_span!("activity.dispatch", activity = name, execution_id = %ctx.execution_id);
        async move {
            let mut attempt = 0u32;
            loop {
                let call = tokio::time::timeout(
                    timeouts.schedule_to_close,
                    activity.call(ctx, input.clone()),
                );
                match call.await {
                    Ok(Ok(output)) => return Ok(output),
                    Ok(Err(err)) => {
                        let non_retryable = err
                            .class
                            .map(|c| policy.non_retryable.contains(&c))
                            .unwrap_or(false);
                        if non_retryable || attempt + 1 >= policy.max_attempts {
                            return Err(err);
                        }
                        tracing::warn!(attempt, error = %err, "activity attempt failed, retrying");
                    }
                    Err(_elapsed) => {
                        if attempt + 1 >= policy.max_attempts {
                            return Err(ActivityError::retryable(format!(
                                "activity {name} timed out after {:?}",
                                timeouts.schedule_to_close
                            )));
                        }
                        tracing::warn!(attempt, "activity timed out, retrying");
                    }
                }
                tokio::time::sleep(policy.backoff_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }
}

impl Default for ActivityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
