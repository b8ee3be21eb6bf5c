//! Core error types.

use thiserror::Error;

/// Errors from the chart builder and the transition engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("runner has no chart loaded")]
    NotLoaded,

    #[error("runner is not started")]
    NotStarted,

    #[error("malformed chart: {reason}")]
    MalformedChart { reason: String },

    #[error("no initial state found, mark one state as the entry point")]
    NoInitialState,

    #[error("initial state ambiguity: {states:?} are all marked initial")]
    AmbiguousInitialState { states: Vec<String> },

    #[error("state '{state}' routes event '{event}' to undeclared state '{target}'")]
    UnknownTarget {
        state: String,
        event: String,
        target: String,
    },

    #[error("invalid model: {reason}")]
    InvalidModel { reason: String },

    #[error("event '{event}' is unregistered")]
    UnregisteredEvent { event: String },

    #[error("event '{event}' is inappropriate for the current state '{state}'")]
    ImpossibleEvent { event: String, state: String },

    #[error("trigger '{trigger}' of state '{state}' cannot be resolved")]
    UndefinedTrigger { state: String, trigger: String },

    #[error("action '{action}' of state '{state}' cannot be resolved")]
    UndefinedAction { state: String, action: String },

    #[error("{hook} callback '{callback}' of state '{state}' cannot be resolved")]
    UndefinedCallback {
        state: String,
        hook: &'static str,
        callback: String,
    },

    #[error("trigger of state '{state}' produced event '{event}' which cannot be sent from it")]
    WrongTrigger { event: String, state: String },

    #[error("trigger chain exceeded {max_depth} chained transitions")]
    TriggerChainTooLong { max_depth: usize },

    #[error("trigger cycle: event '{event}' sent from state '{state}' twice in one chain")]
    TriggerCycle { state: String, event: String },

    #[error("state condition failed: {reason}")]
    StateCondition { reason: String },

    #[error("flush failed: {0}")]
    Flush(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("XML error: {0}")]
    Xml(#[from] roxmltree::Error),
}

/// Broad classes of [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The runner was used before `load`/`start`.
    Precondition,
    /// The chart description or model is invalid.
    ChartValidity,
    /// The event is unknown or not valid from the current state.
    Event,
    /// A declared callback identifier could not be resolved.
    Resolution,
    /// A trigger produced an unusable event or the chain ran away.
    TriggerConsistency,
    /// Raised by callback code itself.
    Business,
    /// The flush hook failed.
    Persistence,
    /// Decoding of a description failed.
    Serialization,
}

impl CoreError {
    /// Shorthand for a business validation failure raised from a callback.
    pub fn condition(reason: impl Into<String>) -> Self {
        CoreError::StateCondition {
            reason: reason.into(),
        }
    }

    /// Returns the taxonomy class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotLoaded | CoreError::NotStarted => ErrorKind::Precondition,
            CoreError::MalformedChart { .. }
            | CoreError::NoInitialState
            | CoreError::AmbiguousInitialState { .. }
            | CoreError::UnknownTarget { .. }
            | CoreError::InvalidModel { .. } => ErrorKind::ChartValidity,
            CoreError::UnregisteredEvent { .. } | CoreError::ImpossibleEvent { .. } => {
                ErrorKind::Event
            }
            CoreError::UndefinedTrigger { .. }
            | CoreError::UndefinedAction { .. }
            | CoreError::UndefinedCallback { .. } => ErrorKind::Resolution,
            CoreError::WrongTrigger { .. }
            | CoreError::TriggerChainTooLong { .. }
            | CoreError::TriggerCycle { .. } => ErrorKind::TriggerConsistency,
            CoreError::StateCondition { .. } => ErrorKind::Business,
            CoreError::Flush(_) => ErrorKind::Persistence,
            CoreError::Json(_) | CoreError::Yaml(_) | CoreError::Xml(_) => {
                ErrorKind::Serialization
            }
        }
    }

    /// The engine never retries; every error is final for the operation.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Returns a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::NotLoaded => "NOT_LOADED",
            CoreError::NotStarted => "NOT_STARTED",
            CoreError::MalformedChart { .. } => "MALFORMED_CHART",
            CoreError::NoInitialState => "NO_INITIAL_STATE",
            CoreError::AmbiguousInitialState { .. } => "AMBIGUOUS_INITIAL_STATE",
            CoreError::UnknownTarget { .. } => "UNKNOWN_TARGET",
            CoreError::InvalidModel { .. } => "INVALID_MODEL",
            CoreError::UnregisteredEvent { .. } => "UNREGISTERED_EVENT",
            CoreError::ImpossibleEvent { .. } => "IMPOSSIBLE_EVENT",
            CoreError::UndefinedTrigger { .. } => "UNDEFINED_TRIGGER",
            CoreError::UndefinedAction { .. } => "UNDEFINED_ACTION",
            CoreError::UndefinedCallback { .. } => "UNDEFINED_CALLBACK",
            CoreError::WrongTrigger { .. } => "WRONG_TRIGGER",
            CoreError::TriggerChainTooLong { .. } => "TRIGGER_CHAIN_TOO_LONG",
            CoreError::TriggerCycle { .. } => "TRIGGER_CYCLE",
            CoreError::StateCondition { .. } => "STATE_CONDITION",
            CoreError::Flush(_) => "FLUSH_FAILED",
            CoreError::Json(_) | CoreError::Yaml(_) | CoreError::Xml(_) => "BAD_REQUEST",
        }
    }
}
