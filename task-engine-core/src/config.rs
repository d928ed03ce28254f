use std::time::Duration;

/// Runtime configuration for an `Engine`/`ExecutionDriver` instance.
///
/// `debug`/`testing` collapse all activity timeouts to short, deterministic
/// windows so integration tests don't wait on production-sized ceilings.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub task_queue: String,
    pub schedule_to_close_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub query_timeout: Duration,
    pub debug: bool,
    pub testing: bool,
}

impl EngineConfig {
    /// Reads overrides from the environment, falling back to production
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(queue) = std::env::var("TASK_ENGINE_TASK_QUEUE") {
            config.task_queue = queue;
        }
        if let Ok(secs) = std::env::var("TASK_ENGINE_SCHEDULE_TO_CLOSE_SECONDS") {
            if let Ok(secs) = secs.parse() {
                config.schedule_to_close_timeout = Duration::from_secs(secs);
            }
        }
        if std::env::var("TASK_ENGINE_DEBUG").is_ok() {
            config.debug = true;
        }
        config
    }

    /// Short timeouts, used by the crate's own integration tests.
    pub fn testing() -> Self {
        Self { testing: true, ..Self::default() }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_queue: "task-engine".to_string(),
            schedule_to_close_timeout: Duration::from_secs(600),
            heartbeat_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(5),
            debug: false,
            testing: false,
        }
    }
}
