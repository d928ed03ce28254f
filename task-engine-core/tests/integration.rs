//! Integration tests: exercise the full task lifecycle through the engine
//! facade — create, drive, suspend, resume, inspect — the same surface an
//! embedding application talks to.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use task_engine_core::{
    Activity, ActivityError, ActivityRegistry, BinOp, CaseThen, EngineConfig, Engine, Expr,
    ExecutionStatus, MemoryStore, Step, StepContext, Task, ToolCallType, ToolDef, TransitionType,
    Workflow,
};
use uuid::Uuid;

fn engine(activities: ActivityRegistry) -> Engine {
    Engine::new(Arc::new(MemoryStore::new()), activities, EngineConfig::testing())
}

fn task_with(steps: Vec<Step>) -> Arc<Task> {
    Arc::new(Task {
        task_id: Uuid::now_v7(),
        name: "t".into(),
        tools: vec![],
        workflows: vec![Workflow { name: "main".into(), steps }],
    })
}

#[tokio::test]
async fn linear_log_then_return() {
    let engine = engine(ActivityRegistry::new());
    let task = task_with(vec![
        Step::Log { log: "hi".into() },
        Step::Return { value: Expr::Input },
    ]);
    let execution_id = engine.create_execution(task, Uuid::now_v7(), json!("x")).await.unwrap();

    let transitions = engine.list_transitions(execution_id, 0, None).await.unwrap();
    let kinds: Vec<TransitionType> = transitions.iter().map(|t| t.r#type).collect();
    assert_eq!(kinds, vec![TransitionType::Init, TransitionType::Step, TransitionType::Finish]);
    assert_eq!(transitions[1].metadata.get("log"), Some(&json!("hi")));
    assert_eq!(transitions.last().unwrap().output, json!("x"));
}

struct AlwaysNegativeSwitch;

#[async_trait]
impl Activity for AlwaysNegativeSwitch {
    async fn call(&self, _ctx: &StepContext, _input: serde_json::Value) -> Result<serde_json::Value, ActivityError> {
        Ok(json!(-1))
    }
}

#[tokio::test]
async fn switch_with_negative_index_is_bad_input() {
    // The default position-matching `switch_step` can only ever produce 0 or
    // a positive case index; a negative index is a sentinel an external
    // `switch_step` implementation can return, so exercise that path with an
    // override the way an embedder's own activity would.
    let mut activities = ActivityRegistry::new();
    activities.register("switch_step", Arc::new(AlwaysNegativeSwitch));
    let engine = engine(activities);
    let task = task_with(vec![Step::Switch {
        switch: vec![CaseThen { case: "_".into(), then: Box::new(Step::Get { get: "k".into() }) }],
    }]);
    let err = engine.create_execution(task, Uuid::now_v7(), json!(null)).await.unwrap_err();
    match err {
        task_engine_core::EngineError::BadInput(msg) => assert_eq!(msg, "Negative indices not allowed"),
        other => panic!("expected BadInput, got {other:?}"),
    }
}

#[tokio::test]
async fn foreach_collects_mapped_items() {
    let engine = engine(ActivityRegistry::new());
    let double = Step::Return {
        value: Expr::BinaryOp {
            op: BinOp::Mul,
            lhs: Box::new(Expr::Input),
            rhs: Box::new(Expr::Literal { value: json!(2) }),
        },
    };
    let task = task_with(vec![Step::Foreach {
        r#in: Expr::Input,
        r#do: Box::new(double),
    }]);
    let execution_id = engine.create_execution(task, Uuid::now_v7(), json!([1, 2, 3])).await.unwrap();
    let execution = engine.get_execution(execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    let transitions = engine.list_transitions(execution_id, 0, None).await.unwrap();
    assert_eq!(transitions.last().unwrap().output, json!([2.0, 4.0, 6.0]));
}

#[tokio::test]
async fn map_reduce_sums_regardless_of_parallelism() {
    let sum_with = |parallelism: usize| async move {
        let engine = engine(ActivityRegistry::new());
        let map = Step::Return { value: Expr::Input };
        let reduce = Step::Return {
            value: Expr::BinaryOp {
                op: BinOp::Add,
                lhs: Box::new(Expr::Field { of: Box::new(Expr::Input), name: "acc".into() }),
                rhs: Box::new(Expr::Field { of: Box::new(Expr::Input), name: "item".into() }),
            },
        };
        let task = task_with(vec![Step::MapReduce {
            r#in: Expr::Input,
            map: Box::new(map),
            reduce: Box::new(reduce),
            initial: json!(0),
            parallelism,
        }]);
        let execution_id = engine.create_execution(task, Uuid::now_v7(), json!([1, 2, 3, 4])).await.unwrap();
        engine.list_transitions(execution_id, 0, None).await.unwrap().last().unwrap().output.clone()
    };

    assert_eq!(sum_with(1).await, json!(10.0));
    assert_eq!(sum_with(2).await, json!(10.0));
    assert_eq!(sum_with(4).await, json!(10.0));
}

struct EchoPrompt;

#[async_trait]
impl Activity for EchoPrompt {
    async fn call(&self, _ctx: &StepContext, input: serde_json::Value) -> Result<serde_json::Value, ActivityError> {
        // First call: no resume payload appended, offer a function tool call.
        // Second call (after resume): the appended array carries the tool
        // result as its second element — echo it back as the final message.
        if let Some(array) = input.as_array() {
            if array.len() == 2 {
                return Ok(json!({
                    "choices": [{"finish_reason": "stop", "message": {"content": array[1]}}]
                }));
            }
        }
        Ok(json!({
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "tool_calls": [{"type": "function", "name": "lookup", "arguments": {}}]
                }
            }]
        }))
    }
}

#[tokio::test]
async fn prompt_with_function_tool_call_suspends_then_resumes() {
    let mut activities = ActivityRegistry::new();
    activities.register("prompt_step", Arc::new(EchoPrompt));
    let engine = engine(activities);
    let task = task_with(vec![
        Step::Prompt { messages: Expr::Input, unwrap: false, auto_run_tools: true },
        Step::Return { value: Expr::Input },
    ]);
    let execution_id = engine.create_execution(task.clone(), Uuid::now_v7(), json!([])).await.unwrap();
    assert_eq!(engine.get_execution(execution_id).await.unwrap().status, ExecutionStatus::AwaitingInput);

    engine.signal(execution_id, task, "resume_with_input", json!({"result": 42})).await.unwrap();

    let transitions = engine.list_transitions(execution_id, 0, None).await.unwrap();
    let resume = transitions
        .iter()
        .find(|t| t.r#type == TransitionType::Resume)
        .expect("a resume transition was committed");
    assert_eq!(
        resume.output,
        json!({"choices": [{"finish_reason": "stop", "message": {"content": {"result": 42}}}]})
    );
    assert_eq!(engine.get_execution(execution_id).await.unwrap().status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn sleep_then_return_takes_at_least_the_sleep_duration() {
    let engine = engine(ActivityRegistry::new());
    let task = task_with(vec![
        Step::Sleep { seconds: 1, minutes: 0, hours: 0, days: 0 },
        Step::Return { value: Expr::Input },
    ]);
    let started = tokio::time::Instant::now();
    let execution_id = engine.create_execution(task, Uuid::now_v7(), json!("done")).await.unwrap();
    assert!(started.elapsed() >= std::time::Duration::from_secs(1));

    let transitions = engine.list_transitions(execution_id, 0, None).await.unwrap();
    assert_eq!(transitions.len(), 3);
    assert_eq!(transitions.last().unwrap().output, json!("done"));
}

#[tokio::test]
async fn integration_tool_call_looks_up_registered_tool() {
    struct EchoIntegration;
    #[async_trait]
    impl Activity for EchoIntegration {
        async fn call(&self, _ctx: &StepContext, input: serde_json::Value) -> Result<serde_json::Value, ActivityError> {
            Ok(json!({ "ran": input.get("tool").cloned() }))
        }
    }
    let mut activities = ActivityRegistry::new();
    activities.register("execute_integration", Arc::new(EchoIntegration));
    let engine = engine(activities);

    let task = Arc::new(Task {
        task_id: Uuid::now_v7(),
        name: "t".into(),
        tools: vec![ToolDef { name: "weather".into(), r#type: ToolCallType::Integration, spec: json!({}) }],
        workflows: vec![Workflow {
            name: "main".into(),
            steps: vec![Step::ToolCall { tool: "weather".into() }],
        }],
    });
    let input = json!({"type": "integration", "integration": {"name": "weather", "arguments": {}}});
    let execution_id = engine.create_execution(task, Uuid::now_v7(), input).await.unwrap();
    let transitions = engine.list_transitions(execution_id, 0, None).await.unwrap();
    assert_eq!(transitions.last().unwrap().output, json!({"ran": "weather"}));
}
