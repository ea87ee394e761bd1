use crate::phase::PhaseKind;
use crate::stage::StageError;

/// Rejected pipeline registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Pipeline name must not be empty")]
    EmptyName,

    #[error("Pipeline '{0}' is already registered")]
    DuplicatePipeline(String),
}

/// Illegal pipeline topology, detected while building the phase graph and
/// always before any stage runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Pipeline '{pipeline}' depends on unknown pipeline '{dependency}'")]
    UnknownDependency { pipeline: String, dependency: String },

    #[error("Pipeline '{pipeline}' depends on isolated pipeline '{dependency}'")]
    IsolatedDependency { pipeline: String, dependency: String },

    #[error("Pipeline dependency cycle detected: {}", path.join(" → "))]
    DependencyCycle { path: Vec<String> },
}

/// Why a single phase run produced no documents.
#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error("Stage '{stage}' failed with {input_count} input document(s): {source}")]
    Stage {
        stage: String,
        input_count: usize,
        #[source]
        source: StageError,
    },

    #[error("Skipping pipeline {pipeline}/{phase} due to dependency error")]
    DependencyFailed { pipeline: String, phase: PhaseKind },

    #[error("Phase cancelled")]
    Cancelled,
}

impl PhaseError {
    /// Cancellation is not a failure and is never reported as one.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PhaseError::Cancelled)
    }
}

/// Errors returned from the engine's public entry points.
///
/// Stage failures are not in here: a run with failing stages still
/// completes and reports them through its summary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// True for errors raised before any stage could execute.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::Graph(_) | EngineError::Registry(_) | EngineError::Config(_)
        )
    }
}
