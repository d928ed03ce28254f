use crate::context;
use crate::driver::ExecutionDriver;
use crate::error::EngineResult;
use crate::types::{Step, StepContext, TransitionType};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Runs a single embedded child step (the body of an `if_else`/`switch` arm,
/// a `foreach` iteration, or a `map_reduce` map/reduce body) to completion
/// under an extended scope, committing `init_branch` on entry and
/// `finish_branch` on exit so the transition log records the child scope the
/// same way it would a resumable top-level execution.
///
/// The closing commit goes through the same `commit_partial` the top-level
/// driver loop uses, so a branch body that resolves immediately to a
/// finishing type gets the same intermediate `step` hop the driver inserts
/// for a one-step workflow — `init_branch` has no edge straight to
/// `finish_branch` in the legal-successor table.
pub async fn run_branch(
    driver: &ExecutionDriver,
    parent: &StepContext,
    branch: &str,
    step: &Step,
    input: Value,
) -> EngineResult<Value> {
    let cursor = parent.cursor.child(branch, 0);
    let ctx = context::build(
        parent.execution_id,
        parent.task.clone(),
        cursor.clone(),
        input.clone(),
        parent.user_state.clone(),
        true,
    );

    driver
        .commit(parent.execution_id, cursor.clone(), TransitionType::InitBranch, input, Default::default())
        .await?;

    let partial = driver.run_step(&ctx, step).await?;
    let committed = driver.commit_partial(parent.execution_id, &cursor, &1usize, TransitionType::InitBranch, partial).await?;
    Ok(committed.output)
}

/// Runs `map` over `items` with up to `parallelism` branches in flight at
/// once, preserving input order in the returned vector regardless of which
/// branch finishes first.
pub async fn run_map_parallel(
    driver: &ExecutionDriver,
    ctx: &StepContext,
    map: &Step,
    items: Vec<Value>,
    parallelism: usize,
) -> EngineResult<Vec<Value>> {
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut in_flight = FuturesUnordered::new();

    for (index, item) in items.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        in_flight.push(async move {
            let permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
            let result = run_branch(driver, ctx, "map", map, item).await;
            drop(permit);
            result.map(|value| (index, value))
        });
    }

    let mut results = Vec::with_capacity(in_flight.len());
    while let Some(outcome) = in_flight.next().await {
        results.push(outcome?);
    }
    results.sort_by_key(|(index, _)| *index);
    Ok(results.into_iter().map(|(_, value)| value).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityRegistry;
    use crate::config::EngineConfig;
    use crate::store_memory::MemoryStore;
    use crate::types::*;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn driver_with_execution(task: &Task, input: Value) -> (ExecutionDriver, Uuid) {
        let driver = ExecutionDriver::new(Arc::new(MemoryStore::new()), ActivityRegistry::new(), EngineConfig::testing());
        let execution_id = Uuid::now_v7();
        let execution = Execution {
            execution_id,
            task_id: task.task_id,
            developer_id: Uuid::now_v7(),
            input,
            status: ExecutionStatus::Starting,
            user_state: json!({}),
            last_error: None,
            created_at: now_ms(),
        };
        driver.store.create_execution(&execution).await.unwrap();
        // The driver's own loop commits `init` before a composite step ever
        // runs; branch commits assume that already happened.
        driver
            .commit(execution_id, TransitionTarget::main(0), TransitionType::Init, json!(null), Default::default())
            .await
            .unwrap();
        (driver, execution_id)
    }

    fn ctx(execution_id: Uuid, task: Arc<Task>) -> StepContext {
        StepContext {
            execution_id,
            task,
            cursor: TransitionTarget::main(0),
            current_input: json!(null),
            user_state: json!({}),
            is_main: true,
            is_first_step: true,
        }
    }

    #[tokio::test]
    async fn run_branch_evaluates_a_pure_child_step() {
        let task = Task { task_id: Uuid::now_v7(), name: "t".into(), tools: vec![], workflows: vec![] };
        let (driver, execution_id) = driver_with_execution(&task, json!(null)).await;
        let step = Step::Return { value: Expr::Input };
        let output = run_branch(&driver, &ctx(execution_id, Arc::new(task)), "if_else", &step, json!(7)).await.unwrap();
        assert_eq!(output, json!(7));
    }

    #[tokio::test]
    async fn run_branch_commits_init_branch_then_finish_branch() {
        let task = Task { task_id: Uuid::now_v7(), name: "t".into(), tools: vec![], workflows: vec![] };
        let (driver, execution_id) = driver_with_execution(&task, json!(null)).await;
        let step = Step::Evaluate { expr: Expr::Input };
        run_branch(&driver, &ctx(execution_id, Arc::new(task)), "switch", &step, json!(3)).await.unwrap();

        let log = driver.store.read_range(execution_id, 0, None).await.unwrap();
        let types: Vec<TransitionType> = log.iter().map(|t| t.r#type).collect();
        assert_eq!(
            types,
            vec![TransitionType::Init, TransitionType::InitBranch, TransitionType::Step, TransitionType::FinishBranch]
        );
    }

    #[tokio::test]
    async fn map_parallel_preserves_order() {
        let task = Task { task_id: Uuid::now_v7(), name: "t".into(), tools: vec![], workflows: vec![] };
        let (driver, execution_id) = driver_with_execution(&task, json!(null)).await;
        let step = Step::Return {
            value: Expr::BinaryOp {
                op: BinOp::Mul,
                lhs: Box::new(Expr::Input),
                rhs: Box::new(Expr::Literal { value: json!(10) }),
            },
        };
        let items: Vec<Value> = (0..5).map(|n| json!(n)).collect();
        let results = run_map_parallel(&driver, &ctx(execution_id, Arc::new(task)), &step, items, 3).await.unwrap();
        assert_eq!(results, vec![json!(0.0), json!(10.0), json!(20.0), json!(30.0), json!(40.0)]);
    }
}
