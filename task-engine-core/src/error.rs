use crate::types::NonRetryableClass;
use thiserror::Error;

/// Error classification for activity failures, used to decide whether the
/// dispatcher retries or surfaces the failure immediately.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct ActivityError {
    pub message: String,
    pub class: Option<NonRetryableClass>,
}

impl ActivityError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), class: None }
    }

    pub fn non_retryable(message: impl Into<String>, class: NonRetryableClass) -> Self {
        Self { message: message.into(), class: Some(class) }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    NotFound(uuid::Uuid),
    #[error("conflict appending transition at seq {expected}: a later transition already exists")]
    Conflict { expected: u64 },
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The closed set of error kinds the engine surfaces, per the governing
/// error-handling design.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("activity failed: {0}")]
    ActivityFailure(String),

    #[error("illegal transition: {from:?} -> {to:?}")]
    IllegalTransition { from: String, to: String },

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("cancelled")]
    Cancelled,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ActivityError> for EngineError {
    fn from(e: ActivityError) -> Self {
        match e.class {
            Some(NonRetryableClass::BadInput) => EngineError::BadInput(e.message),
            Some(NonRetryableClass::NotFound) => EngineError::NotFound(e.message),
            Some(NonRetryableClass::Cancelled) => EngineError::Cancelled,
            Some(NonRetryableClass::PermanentFailure) | None => {
                EngineError::ActivityFailure(e.message)
            }
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
