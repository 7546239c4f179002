use thiserror::Error;

/// Structured errors for the component container.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("unknown component '{0}'")]
    UnknownComponent(String),

    #[error("component '{0}' is already registered")]
    DuplicateComponent(String),

    #[error(
        "cannot construct component '{component}' while '{constructing}' is already being \
         constructed on the same task"
    )]
    NestedComponentConstruction {
        component: String,
        constructing: String,
    },

    #[error("find_component() can be called only from a task constructing a component")]
    LookupOutsideConstruction,

    #[error("circular dependency between components: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    #[error("component load cancelled")]
    StageSwitchingCancelled,

    #[error("construction of component '{component}' failed")]
    ComponentConstructionFailed {
        component: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{handler} failed for component '{component}'")]
    StageSwitchFailed {
        component: String,
        handler: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{phase} was cancelled but no underlying failure was surfaced")]
    ProtocolViolation { phase: &'static str },

    #[error("failed to find task processor with name '{0}'")]
    UnknownTaskProcessor(String),

    #[error("component '{name}' is not of the requested type")]
    WrongComponentType { name: String },

    #[error("add_component() must be called from inside a spawned task")]
    OutsideTask,
}

impl ContextError {
    /// True for the cancellation signal that phase drivers swallow while
    /// joining the remaining per-component tasks.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::StageSwitchingCancelled)
    }
}
