use crate::types::{StepContext, Task, TransitionTarget};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Builds a fresh, immutable `StepContext` for the step named by `cursor`.
pub fn build(
    execution_id: Uuid,
    task: Arc<Task>,
    cursor: TransitionTarget,
    current_input: Value,
    user_state: Value,
    is_first_step: bool,
) -> StepContext {
    let is_main = cursor.is_main();
    StepContext { execution_id, task, cursor, current_input, user_state, is_main, is_first_step }
}
