use crate::error::StoreError;
use crate::store::TransitionStore;
use crate::types::*;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

struct Inner {
    executions: HashMap<Uuid, Execution>,
    transitions: HashMap<Uuid, Vec<Transition>>,
    last_errors: HashMap<Uuid, LastErrorInput>,
    cancel_requested: HashMap<Uuid, bool>,
    resume_inputs: HashMap<Uuid, Value>,
}

/// In-memory implementation of `TransitionStore` for tests and local runs.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                executions: HashMap::new(),
                transitions: HashMap::new(),
                last_errors: HashMap::new(),
                cancel_requested: HashMap::new(),
                resume_inputs: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransitionStore for MemoryStore {
    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut w = self.inner.write().await;
        w.executions.insert(execution.execution_id, execution.clone());
        w.transitions.entry(execution.execution_id).or_default();
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.executions.get(&id).cloned())
    }

    async fn update_status(&self, id: Uuid, status: ExecutionStatus) -> Result<(), StoreError> {
        let mut w = self.inner.write().await;
        let exec = w.executions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        exec.status = status;
        Ok(())
    }

    async fn update_user_state(&self, id: Uuid, state: &Value) -> Result<(), StoreError> {
        let mut w = self.inner.write().await;
        let exec = w.executions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        exec.user_state = state.clone();
        Ok(())
    }

    async fn append(&self, transition: Transition) -> Result<u64, StoreError> {
        let mut w = self.inner.write().await;
        let log = w
            .transitions
            .get_mut(&transition.execution_id)
            .ok_or(StoreError::NotFound(transition.execution_id))?;
        let expected = log.last().map(|t| t.seq + 1).unwrap_or(0);
        if transition.seq != expected {
            return Err(StoreError::Conflict { expected });
        }
        let seq = transition.seq;
        log.push(transition);
        Ok(seq)
    }

    async fn latest(&self, execution_id: Uuid) -> Result<Option<Transition>, StoreError> {
        let r = self.inner.read().await;
        Ok(r.transitions.get(&execution_id).and_then(|log| log.last().cloned()))
    }

    async fn read_range(
        &self,
        execution_id: Uuid,
        from_seq: u64,
        to_seq: Option<u64>,
    ) -> Result<Vec<Transition>, StoreError> {
        let r = self.inner.read().await;
        let log = r.transitions.get(&execution_id).ok_or(StoreError::NotFound(execution_id))?;
        Ok(log
            .iter()
            .filter(|t| t.seq >= from_seq && to_seq.map_or(true, |to| t.seq <= to))
            .cloned()
            .collect())
    }

    async fn record_last_error(
        &self,
        execution_id: Uuid,
        error: &LastErrorInput,
    ) -> Result<(), StoreError> {
        let mut w = self.inner.write().await;
        w.last_errors.insert(execution_id, error.clone());
        Ok(())
    }

    async fn take_last_error(&self, execution_id: Uuid) -> Result<Option<LastErrorInput>, StoreError> {
        let mut w = self.inner.write().await;
        Ok(w.last_errors.remove(&execution_id))
    }

    async fn request_cancel(&self, execution_id: Uuid) -> Result<(), StoreError> {
        let mut w = self.inner.write().await;
        w.cancel_requested.insert(execution_id, true);
        Ok(())
    }

    async fn is_cancel_requested(&self, execution_id: Uuid) -> Result<bool, StoreError> {
        let r = self.inner.read().await;
        Ok(*r.cancel_requested.get(&execution_id).unwrap_or(&false))
    }

    async fn put_resume_input(&self, execution_id: Uuid, input: Value) -> Result<(), StoreError> {
        let mut w = self.inner.write().await;
        w.resume_inputs.insert(execution_id, input);
        Ok(())
    }

    async fn take_resume_input(&self, execution_id: Uuid) -> Result<Option<Value>, StoreError> {
        let mut w = self.inner.write().await;
        Ok(w.resume_inputs.remove(&execution_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_execution() -> Execution {
        Execution {
            execution_id: Uuid::now_v7(),
            task_id: Uuid::now_v7(),
            developer_id: Uuid::now_v7(),
            input: json!("x"),
            status: ExecutionStatus::Queued,
            user_state: json!({}),
            last_error: None,
            created_at: now_ms(),
        }
    }

    fn sample_transition(execution_id: Uuid, seq: u64, t: TransitionType) -> Transition {
        Transition {
            execution_id,
            seq,
            from_cursor: TransitionTarget::main(0),
            r#type: t,
            to_cursor: Some(TransitionTarget::main(1)),
            output: json!(null),
            metadata: Default::default(),
            created_at: now_ms(),
        }
    }

    #[tokio::test]
    async fn test_execution_round_trip() {
        let store = MemoryStore::new();
        let exec = sample_execution();
        store.create_execution(&exec).await.unwrap();
        let loaded = store.get_execution(exec.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.execution_id, exec.execution_id);
        store.update_status(exec.execution_id, ExecutionStatus::Running).await.unwrap();
        let loaded = store.get_execution(exec.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_append_enforces_strict_sequence() {
        let store = MemoryStore::new();
        let exec = sample_execution();
        store.create_execution(&exec).await.unwrap();
        store
            .append(sample_transition(exec.execution_id, 0, TransitionType::Init))
            .await
            .unwrap();
        // Skipping seq 1 is rejected.
        let err = store
            .append(sample_transition(exec.execution_id, 2, TransitionType::Step))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 1 }));
        store
            .append(sample_transition(exec.execution_id, 1, TransitionType::Step))
            .await
            .unwrap();
        let latest = store.latest(exec.execution_id).await.unwrap().unwrap();
        assert_eq!(latest.seq, 1);
    }

    #[tokio::test]
    async fn test_read_range() {
        let store = MemoryStore::new();
        let exec = sample_execution();
        store.create_execution(&exec).await.unwrap();
        for seq in 0..5 {
            store
                .append(sample_transition(exec.execution_id, seq, TransitionType::Step))
                .await
                .unwrap();
        }
        let range = store.read_range(exec.execution_id, 1, Some(3)).await.unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range.first().unwrap().seq, 1);
        assert_eq!(range.last().unwrap().seq, 3);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let store = MemoryStore::new();
        let exec = sample_execution();
        store.create_execution(&exec).await.unwrap();
        assert!(!store.is_cancel_requested(exec.execution_id).await.unwrap());
        store.request_cancel(exec.execution_id).await.unwrap();
        store.request_cancel(exec.execution_id).await.unwrap();
        assert!(store.is_cancel_requested(exec.execution_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_last_error_is_take_once() {
        let store = MemoryStore::new();
        let exec = sample_execution();
        store.create_execution(&exec).await.unwrap();
        store
            .record_last_error(
                exec.execution_id,
                &LastErrorInput { message: "boom".into(), activity: Some("prompt_step".into()) },
            )
            .await
            .unwrap();
        let taken = store.take_last_error(exec.execution_id).await.unwrap().unwrap();
        assert_eq!(taken.message, "boom");
        assert!(store.take_last_error(exec.execution_id).await.unwrap().is_none());
    }
}
