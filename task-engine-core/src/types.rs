use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

// ─── Task / Workflow / Step ────────────────────────────────────

/// A named case in a `SwitchStep`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaseThen {
    pub case: String,
    pub then: Box<Step>,
}

/// One arm of a tool-call dispatch, shared by `PromptStep` and `ToolCallStep`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallType {
    Function,
    Integration,
    ApiCall,
    System,
}

/// A minimal expression grammar for `EvaluateStep`. Neither the distilled
/// task format nor the retrieved original source ships a concrete grammar
/// (the original delegates to an external templating activity); this is
/// enough to express arithmetic and field access over the current input.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Input,
    Literal { value: Value },
    Field { of: Box<Expr>, name: String },
    BinaryOp { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// The closed set of step variants. §4.5 of the governing catalogue.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Log { log: String },
    Evaluate { expr: Expr },
    Return { value: Expr },
    Set { key: String, value: Expr },
    Get { get: String },
    Sleep { seconds: u64, minutes: u64, hours: u64, days: u64 },
    Error { message: String },
    Yield { to: TransitionTarget, output: Expr, transition_type: TransitionType },
    WaitForInput { prompt: Value },
    IfElse { condition: Expr, then: Box<Step>, r#else: Option<Box<Step>> },
    Switch { switch: Vec<CaseThen> },
    Foreach { r#in: Expr, r#do: Box<Step> },
    MapReduce {
        r#in: Expr,
        map: Box<Step>,
        reduce: Box<Step>,
        initial: Value,
        parallelism: usize,
    },
    Prompt { messages: Expr, unwrap: bool, auto_run_tools: bool },
    ToolCall { tool: String },
    Parallel { branches: Vec<Step> },
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Log { .. } => "log",
            Step::Evaluate { .. } => "evaluate",
            Step::Return { .. } => "return",
            Step::Set { .. } => "set",
            Step::Get { .. } => "get",
            Step::Sleep { .. } => "sleep",
            Step::Error { .. } => "error",
            Step::Yield { .. } => "yield",
            Step::WaitForInput { .. } => "wait_for_input",
            Step::IfElse { .. } => "if_else",
            Step::Switch { .. } => "switch",
            Step::Foreach { .. } => "foreach",
            Step::MapReduce { .. } => "map_reduce",
            Step::Prompt { .. } => "prompt",
            Step::ToolCall { .. } => "tool_call",
            Step::Parallel { .. } => "parallel",
        }
    }
}

/// An ordered sequence of steps under a name; `main` is the entry point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<Step>,
}

/// A tool definition visible to `PromptStep`/`ToolCallStep`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub r#type: ToolCallType,
    pub spec: Value,
}

/// A task: one or more named workflows, `main` being the entry point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub name: String,
    pub tools: Vec<ToolDef>,
    pub workflows: Vec<Workflow>,
}

impl Task {
    pub fn workflow(&self, name: &str) -> Option<&Workflow> {
        self.workflows.iter().find(|w| w.name == name)
    }

    pub fn main(&self) -> Option<&Workflow> {
        self.workflow("main")
    }
}

// ─── Cursor ─────────────────────────────────────────────────────

/// One segment of a `TransitionTarget`'s scope path: which composite step
/// spawned the child scope, and which branch/iteration within it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopeSegment {
    pub workflow: String,
    pub step: usize,
    pub branch: String,
}

/// `(workflow_name, step_index, scope_path)` — uniquely names a resumable
/// point in an execution.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransitionTarget {
    pub workflow: String,
    pub step: usize,
    #[serde(default)]
    pub scope: Vec<ScopeSegment>,
}

impl TransitionTarget {
    pub fn main(step: usize) -> Self {
        Self { workflow: "main".to_string(), step, scope: Vec::new() }
    }

    pub fn is_main(&self) -> bool {
        self.scope.is_empty()
    }

    pub fn child(&self, branch: &str, step: usize) -> Self {
        let mut scope = self.scope.clone();
        scope.push(ScopeSegment {
            workflow: self.workflow.clone(),
            step: self.step,
            branch: branch.to_string(),
        });
        Self { workflow: self.workflow.clone(), step, scope }
    }

    pub fn next(&self) -> Self {
        Self { workflow: self.workflow.clone(), step: self.step + 1, scope: self.scope.clone() }
    }
}

// ─── Transitions ────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    Init,
    InitBranch,
    Step,
    Resume,
    Wait,
    Error,
    Cancelled,
    FinishBranch,
    Finish,
}

impl TransitionType {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransitionType::Finish
                | TransitionType::FinishBranch
                | TransitionType::Error
                | TransitionType::Cancelled
        )
    }
}

/// One append-only transition record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transition {
    pub execution_id: Uuid,
    pub seq: u64,
    pub from_cursor: TransitionTarget,
    pub r#type: TransitionType,
    pub to_cursor: Option<TransitionTarget>,
    pub output: Value,
    pub metadata: BTreeMap<String, Value>,
    pub created_at: Timestamp,
}

/// The interpreter's intent for the next log entry, before the transition
/// engine fills in defaults and validates it against the legal-successor
/// table.
#[derive(Clone, Debug, Default)]
pub struct PartialTransition {
    pub r#type: Option<TransitionType>,
    pub output: Option<Value>,
    pub next: Option<TransitionTarget>,
    pub metadata: BTreeMap<String, Value>,
    pub user_state: Option<Value>,
}

impl PartialTransition {
    pub fn output(output: Value) -> Self {
        Self { output: Some(output), ..Default::default() }
    }

    pub fn resume(output: Value) -> Self {
        Self { r#type: Some(TransitionType::Resume), output: Some(output), ..Default::default() }
    }

    pub fn with_type(mut self, t: TransitionType) -> Self {
        self.r#type = Some(t);
        self
    }

    pub fn with_next(mut self, next: TransitionTarget) -> Self {
        self.next = Some(next);
        self
    }

    pub fn with_user_state(mut self, state: Value) -> Self {
        self.user_state = Some(state);
        self
    }
}

/// The activity's result for a step, before interpretation. `transition_to`
/// is only populated for `YieldStep`.
#[derive(Clone, Debug, Default)]
pub struct StepOutcome {
    pub output: Value,
    pub transition_to: Option<(TransitionType, TransitionTarget)>,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn new(output: Value) -> Self {
        Self { output, transition_to: None, error: None }
    }
}

// ─── Step context ───────────────────────────────────────────────

/// Immutable per-step view built fresh for every step.
#[derive(Clone, Debug)]
pub struct StepContext {
    pub execution_id: Uuid,
    pub task: std::sync::Arc<Task>,
    pub cursor: TransitionTarget,
    pub current_input: Value,
    pub user_state: Value,
    pub is_main: bool,
    pub is_first_step: bool,
}

impl StepContext {
    pub fn current_step(&self) -> Option<&Step> {
        let workflow = self.task.workflow(&self.cursor.workflow)?;
        workflow.steps.get(self.cursor.step)
    }

    pub fn tools(&self) -> &[ToolDef] {
        &self.task.tools
    }
}

// ─── Execution ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Starting,
    AwaitingInput,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,
    pub task_id: Uuid,
    pub developer_id: Uuid,
    pub input: Value,
    pub status: ExecutionStatus,
    pub user_state: Value,
    pub last_error: Option<LastErrorInput>,
    pub created_at: Timestamp,
}

/// Payload carried by the `set_last_error` signal; stamped into every
/// subsequent transition's metadata for observability.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LastErrorInput {
    pub message: String,
    pub activity: Option<String>,
}

// ─── Activity dispatch ──────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum NonRetryableClass {
    BadInput,
    NotFound,
    Cancelled,
    PermanentFailure,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub max_interval_ms: u64,
    pub max_attempts: u32,
    pub non_retryable: Vec<NonRetryableClass>,
}

impl RetryPolicy {
    /// Mirrors the teacher's `DEFAULT_RETRY_POLICY` constant.
    pub fn default_policy() -> Self {
        Self {
            initial_interval_ms: 200,
            backoff_coefficient: 2.0,
            max_interval_ms: 30_000,
            max_attempts: 5,
            non_retryable: vec![
                NonRetryableClass::BadInput,
                NonRetryableClass::NotFound,
                NonRetryableClass::Cancelled,
                NonRetryableClass::PermanentFailure,
            ],
        }
    }

    pub fn backoff_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let ms = (self.initial_interval_ms as f64 * self.backoff_coefficient.powi(attempt as i32))
            .min(self.max_interval_ms as f64);
        std::time::Duration::from_millis(ms as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_policy()
    }
}
