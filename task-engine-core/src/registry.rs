use crate::types::Step;

/// Static table mapping step variant to whether it is resolved purely by the
/// interpreter (no activity call) or routed through the dispatcher, and to
/// which activity.
pub fn activity_for(step: &Step) -> Option<&'static str> {
    match step {
        Step::Log { .. } | Step::Get { .. } | Step::Sleep { .. } | Step::Parallel { .. } => None,
        Step::Evaluate { .. } => Some("evaluate_step"),
        Step::Return { .. } => Some("return_step"),
        Step::Set { .. } => Some("set_value_step"),
        Step::Error { .. } => None,
        Step::Yield { .. } => Some("yield_step"),
        Step::WaitForInput { .. } => Some("wait_for_input_step"),
        Step::IfElse { .. } => Some("if_else_step"),
        Step::Switch { .. } => Some("switch_step"),
        Step::Foreach { .. } => Some("for_each_step"),
        Step::MapReduce { .. } => Some("map_reduce_step"),
        Step::Prompt { .. } => Some("prompt_step"),
        // ToolCallStep has no single backing activity of its own: the
        // type-keyed descriptor in its input selects one of four leaf
        // activities (`raise_complete_async`, `execute_integration`,
        // `execute_api_call`, `execute_system`) inside the interpreter's
        // `dispatch_tool_call`, the same helper `PromptStep`'s auto-run path
        // shares. Treating it as a plain pass-through here keeps that
        // selection in one place instead of duplicating it behind a generic
        // activity name nothing would ever need to implement.
        Step::ToolCall { .. } => None,
    }
}

/// Whether a step's activity is one of the built-in pure evaluators
/// (computed locally from the step definition and context, no network I/O)
/// versus a genuinely external activity the embedding application must
/// register (LLM prompting, tool HTTP calls, human-in-the-loop). Both kinds
/// go through the same dispatcher/retry/timeout machinery; this only decides
/// whether `dispatch_step` wraps the dispatch input in a `{step, input}`
/// envelope so the activity can see the step's own configuration.
pub fn is_pure(step: &Step) -> bool {
    matches!(
        step,
        Step::Evaluate { .. }
            | Step::Return { .. }
            | Step::Set { .. }
            | Step::Yield { .. }
            | Step::WaitForInput { .. }
            | Step::IfElse { .. }
            | Step::Switch { .. }
            | Step::Foreach { .. }
            | Step::MapReduce { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Expr;

    #[test]
    fn sleep_and_log_skip_the_dispatcher() {
        assert_eq!(activity_for(&Step::Log { log: "hi".into() }), None);
        assert_eq!(
            activity_for(&Step::Sleep { seconds: 1, minutes: 0, hours: 0, days: 0 }),
            None
        );
    }

    #[test]
    fn evaluate_routes_to_its_activity() {
        assert_eq!(activity_for(&Step::Evaluate { expr: Expr::Input }), Some("evaluate_step"));
    }
}
