use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::document::Documents;
use crate::output_store::OutputStore;
use crate::phase::PhaseKind;
use crate::stage::{Stage, StageError};

/// Read-only engine collaborators shared by every stage in a run.
#[derive(Debug, Default)]
pub struct EngineServices {
    pub settings: Settings,
    pub outputs: OutputStore,
}

impl EngineServices {
    pub fn new(settings: Settings, outputs: OutputStore) -> Self {
        Self { settings, outputs }
    }
}

/// Invocation record handed to a stage.
///
/// Owns the stage's input documents and exposes the run's services and
/// cancellation token. A fresh context is built for every stage call.
#[derive(Clone)]
pub struct ExecutionContext {
    pipeline: String,
    phase: PhaseKind,
    stage: String,
    inputs: Documents,
    services: Arc<EngineServices>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        pipeline: &str,
        phase: PhaseKind,
        services: Arc<EngineServices>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            phase,
            stage: String::new(),
            inputs: Documents::empty(),
            services,
            cancel,
        }
    }

    fn for_stage(&self, stage: &str, inputs: Documents) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            phase: self.phase,
            stage: stage.to_string(),
            inputs,
            services: Arc::clone(&self.services),
            cancel: self.cancel.clone(),
        }
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn phase(&self) -> PhaseKind {
        self.phase
    }

    /// Name of the stage currently executing (empty for a phase-level context).
    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn inputs(&self) -> &Documents {
        &self.inputs
    }

    pub fn settings(&self) -> &Settings {
        &self.services.settings
    }

    pub fn outputs(&self) -> &OutputStore {
        &self.services.outputs
    }

    /// Process output of another pipeline from the current run.
    ///
    /// `None` when that pipeline has not finished its Process phase yet or
    /// is isolated.
    pub fn documents_for(&self, pipeline: &str) -> Option<Documents> {
        self.services.outputs.get(pipeline)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `stages` in order against `inputs`, with the same cancellation
    /// checkpoints a phase uses.
    pub async fn execute_stages(
        &self,
        stages: &[Arc<dyn Stage>],
        inputs: Documents,
    ) -> Result<Documents, StageError> {
        run_chain(self, stages, inputs)
            .await
            .map_err(|failure| failure.source)
    }
}

/// A stage chain aborted at `stage`, which had `input_count` inputs.
pub(crate) struct ChainFailure {
    pub stage: String,
    pub input_count: usize,
    pub source: StageError,
}

/// Feed `inputs` through `stages` sequentially.
///
/// Cancellation is checked before every stage and raced against the
/// in-flight stage.
pub(crate) async fn run_chain(
    base: &ExecutionContext,
    stages: &[Arc<dyn Stage>],
    inputs: Documents,
) -> Result<Documents, ChainFailure> {
    let mut current = inputs;

    for stage in stages {
        let input_count = current.len();

        if base.cancel.is_cancelled() {
            return Err(ChainFailure {
                stage: stage.name().to_string(),
                input_count,
                source: StageError::Cancelled,
            });
        }

        let ctx = base.for_stage(stage.name(), current);
        let result = tokio::select! {
            result = stage.execute(&ctx) => result,
            _ = base.cancel.cancelled() => Err(StageError::Cancelled),
        };

        match result {
            Ok(documents) => current = documents,
            Err(source) => {
                return Err(ChainFailure {
                    stage: stage.name().to_string(),
                    input_count,
                    source,
                })
            }
        }
    }

    Ok(current)
}
