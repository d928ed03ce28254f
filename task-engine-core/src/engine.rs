use crate::activity::ActivityRegistry;
use crate::config::EngineConfig;
use crate::driver::{DriveOutcome, ExecutionDriver};
use crate::error::{EngineError, EngineResult};
use crate::store::TransitionStore;
use crate::types::*;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// `Engine` is the top-level facade that wires together the activity
/// registry, transition store, and driver. Embedding applications talk to
/// this; nothing else in the crate is meant to be a public entry point.
pub struct Engine {
    driver: ExecutionDriver,
    store: Arc<dyn TransitionStore>,
}

impl Engine {
    pub fn new(store: Arc<dyn TransitionStore>, activities: ActivityRegistry, config: EngineConfig) -> Self {
        let driver = ExecutionDriver::new(store.clone(), activities, config);
        Self { driver, store }
    }

    /// Creates a new execution record and drives it until it terminates or
    /// suspends on a `wait` transition.
    pub async fn create_execution(
        &self,
        task: Arc<Task>,
        developer_id: Uuid,
        input: Value,
    ) -> EngineResult<Uuid> {
        let execution_id = Uuid::now_v7();
        let execution = Execution {
            execution_id,
            task_id: task.task_id,
            developer_id,
            input,
            status: ExecutionStatus::Starting,
            user_state: serde_json::json!({}),
            last_error: None,
            created_at: now_ms(),
        };
        self.store.create_execution(&execution).await?;
        self.driver.drive(execution_id, task).await?;
        Ok(execution_id)
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> EngineResult<Execution> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {execution_id}")))
    }

    pub async fn list_transitions(
        &self,
        execution_id: Uuid,
        from_seq: u64,
        limit: Option<u64>,
    ) -> EngineResult<Vec<Transition>> {
        let to_seq = limit.map(|n| from_seq + n.saturating_sub(1));
        Ok(self.store.read_range(execution_id, from_seq, to_seq).await?)
    }

    /// Delivers an external signal. `"resume_with_input"` and `"cancel"`
    /// re-enter the driver immediately so a suspended execution advances (or
    /// terminates) within this call rather than waiting for the next poll.
    pub async fn signal(
        &self,
        execution_id: Uuid,
        task: Arc<Task>,
        name: &str,
        payload: Value,
    ) -> EngineResult<()> {
        match name {
            "resume_with_input" => {
                self.store.put_resume_input(execution_id, payload).await?;
                self.driver.drive(execution_id, task).await?;
            }
            "cancel" => {
                self.store.request_cancel(execution_id).await?;
                self.driver.drive(execution_id, task).await?;
            }
            "set_last_error" => {
                let error: LastErrorInput = serde_json::from_value(payload)
                    .map_err(|e| EngineError::BadInput(format!("malformed set_last_error payload: {e}")))?;
                self.store.record_last_error(execution_id, &error).await?;
            }
            other => return Err(EngineError::BadInput(format!("unknown signal: {other}"))),
        }
        Ok(())
    }

    /// Re-drives an execution without delivering a signal first; used by a
    /// worker loop to make progress on executions a prior process crashed
    /// mid-step.
    pub async fn resume_driving(&self, execution_id: Uuid, task: Arc<Task>) -> EngineResult<DriveOutcome> {
        self.driver.drive(execution_id, task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;

    fn linear_task() -> Arc<Task> {
        Arc::new(Task {
            task_id: Uuid::now_v7(),
            name: "greet".into(),
            tools: vec![],
            workflows: vec![Workflow {
                name: "main".into(),
                steps: vec![
                    Step::Log { log: "starting".into() },
                    Step::Return { value: Expr::Input },
                ],
            }],
        })
    }

    #[tokio::test]
    async fn linear_task_runs_to_completion() {
        crate::test_support::init_tracing();
        let engine = Engine::new(Arc::new(MemoryStore::new()), ActivityRegistry::new(), EngineConfig::testing());
        let task = linear_task();
        let execution_id = engine
            .create_execution(task, Uuid::now_v7(), serde_json::json!("hello"))
            .await
            .unwrap();
        let execution = engine.get_execution(execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        let transitions = engine.list_transitions(execution_id, 0, None).await.unwrap();
        assert_eq!(transitions.last().unwrap().output, serde_json::json!("hello"));
    }

    #[tokio::test]
    async fn wait_for_input_suspends_and_resumes() {
        let engine = Engine::new(Arc::new(MemoryStore::new()), ActivityRegistry::new(), EngineConfig::testing());
        let task = Arc::new(Task {
            task_id: Uuid::now_v7(),
            name: "approval".into(),
            tools: vec![],
            workflows: vec![Workflow {
                name: "main".into(),
                steps: vec![
                    Step::WaitForInput { prompt: serde_json::json!("approve?") },
                    Step::Return { value: Expr::Input },
                ],
            }],
        });
        let execution_id = engine
            .create_execution(task.clone(), Uuid::now_v7(), serde_json::json!(null))
            .await
            .unwrap();
        assert_eq!(engine.get_execution(execution_id).await.unwrap().status, ExecutionStatus::AwaitingInput);

        engine
            .signal(execution_id, task, "resume_with_input", serde_json::json!("approved"))
            .await
            .unwrap();
        let execution = engine.get_execution(execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
    }
}
