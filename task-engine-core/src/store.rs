use crate::error::StoreError;
use crate::types::*;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// Persistence trait for execution records and their transition logs.
///
/// The driver and transition engine operate exclusively through this trait,
/// enabling pluggable backends (`MemoryStore` for tests, a Postgres-backed
/// store for production).
#[async_trait]
pub trait TransitionStore: Send + Sync {
    // ── Execution records ──

    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError>;
    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError>;
    async fn update_status(&self, id: Uuid, status: ExecutionStatus) -> Result<(), StoreError>;
    async fn update_user_state(&self, id: Uuid, state: &Value) -> Result<(), StoreError>;

    // ── Transition log ──

    /// Append a transition. Fails with `Conflict` if `transition.seq` is not
    /// exactly one past the currently-committed last sequence number for
    /// this execution — the compare-and-set that makes multi-writer commits
    /// safe.
    async fn append(&self, transition: Transition) -> Result<u64, StoreError>;
    async fn latest(&self, execution_id: Uuid) -> Result<Option<Transition>, StoreError>;
    async fn read_range(
        &self,
        execution_id: Uuid,
        from_seq: u64,
        to_seq: Option<u64>,
    ) -> Result<Vec<Transition>, StoreError>;

    // ── Signals ──

    /// Record the payload of a `set_last_error` signal; it is stamped into
    /// every subsequent commit's metadata but does not itself fail the step.
    async fn record_last_error(
        &self,
        execution_id: Uuid,
        error: &LastErrorInput,
    ) -> Result<(), StoreError>;
    async fn take_last_error(&self, execution_id: Uuid) -> Result<Option<LastErrorInput>, StoreError>;

    /// Mark an execution for cancellation. Idempotent: repeated calls after
    /// the terminal commit are no-ops.
    async fn request_cancel(&self, execution_id: Uuid) -> Result<(), StoreError>;
    async fn is_cancel_requested(&self, execution_id: Uuid) -> Result<bool, StoreError>;

    /// Deliver externally supplied input to a `wait`-suspended execution.
    async fn put_resume_input(&self, execution_id: Uuid, input: Value) -> Result<(), StoreError>;
    async fn take_resume_input(&self, execution_id: Uuid) -> Result<Option<Value>, StoreError>;
}
