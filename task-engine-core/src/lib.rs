pub mod activity;
pub mod builtin_activities;
pub mod config;
pub mod context;
pub mod driver;
pub mod engine;
pub mod error;
pub mod interpreter;
pub mod orchestrator;
pub mod registry;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod transition_engine;
pub mod types;
#[cfg(test)]
pub mod test_support;

pub use activity::{Activity, ActivityRegistry, Timeouts};
pub use config::EngineConfig;
pub use driver::{DriveOutcome, ExecutionDriver};
pub use engine::Engine;
pub use error::{ActivityError, EngineError, EngineResult, StoreError};
pub use store::TransitionStore;
pub use store_memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use store_postgres::PostgresStore;
pub use types::*;
