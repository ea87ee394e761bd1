use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::context::{run_chain, EngineServices, ExecutionContext};
use crate::document::Documents;
use crate::error::PhaseError;
use crate::stage::{dispose_stages, Stage};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Input,
    Process,
    Transform,
    Output,
}

impl PhaseKind {
    /// All kinds in execution order.
    pub const ALL: [PhaseKind; 4] = [
        PhaseKind::Input,
        PhaseKind::Process,
        PhaseKind::Transform,
        PhaseKind::Output,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Input => "Input",
            PhaseKind::Process => "Process",
            PhaseKind::Transform => "Transform",
            PhaseKind::Output => "Output",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index of a phase within its [`PhaseGraph`](crate::graph::PhaseGraph).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhaseId(pub(crate) usize);

impl PhaseId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// One (pipeline, kind) pair: the unit of scheduling.
///
/// The first entry of `dependencies` is the only source of input documents;
/// any further entries just order this phase after other phases.
pub struct Phase {
    pipeline: String,
    kind: PhaseKind,
    isolated: bool,
    stages: Vec<Arc<dyn Stage>>,
    pub(crate) dependencies: Vec<PhaseId>,
    output: Mutex<Documents>,
}

impl Phase {
    pub(crate) fn new(
        pipeline: &str,
        kind: PhaseKind,
        isolated: bool,
        stages: Vec<Arc<dyn Stage>>,
        dependencies: Vec<PhaseId>,
    ) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            kind,
            isolated,
            stages,
            dependencies,
            output: Mutex::new(Documents::empty()),
        }
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn kind(&self) -> PhaseKind {
        self.kind
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    pub fn dependencies(&self) -> &[PhaseId] {
        &self.dependencies
    }

    /// The phase supplying this phase's input documents, if any.
    pub fn input_dependency(&self) -> Option<PhaseId> {
        self.dependencies.first().copied()
    }

    /// Documents produced by the most recent run; empty before the first
    /// run or after a failed one.
    pub fn output(&self) -> Documents {
        match self.output.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_output(&self, documents: Documents) {
        match self.output.lock() {
            Ok(mut guard) => *guard = documents,
            Err(poisoned) => *poisoned.into_inner() = documents,
        }
    }

    pub(crate) fn reset_output(&self) {
        self.set_output(Documents::empty());
    }

    /// Only the Process phase of a non-isolated pipeline writes to the
    /// output store.
    pub fn publishes_output(&self) -> bool {
        self.kind == PhaseKind::Process && !self.isolated
    }

    /// Run the stage chain over `input`.
    ///
    /// An empty chain hands `input` back unchanged. On success the result
    /// becomes this phase's output (and is published to the output store
    /// where applicable); on failure or cancellation the output is emptied.
    pub async fn run(
        &self,
        input: Documents,
        services: &Arc<EngineServices>,
        cancel: &CancellationToken,
    ) -> Result<Documents, PhaseError> {
        if cancel.is_cancelled() {
            self.reset_output();
            return Err(PhaseError::Cancelled);
        }

        let documents = if self.stages.is_empty() {
            input
        } else {
            let ctx = ExecutionContext::new(
                &self.pipeline,
                self.kind,
                Arc::clone(services),
                cancel.clone(),
            );
            match run_chain(&ctx, &self.stages, input).await {
                Ok(documents) => documents,
                Err(failure) if failure.source.is_cancellation() => {
                    debug!(
                        pipeline = %self.pipeline,
                        phase = %self.kind,
                        stage = %failure.stage,
                        "Phase cancelled"
                    );
                    self.reset_output();
                    return Err(PhaseError::Cancelled);
                }
                Err(failure) => {
                    error!(
                        pipeline = %self.pipeline,
                        phase = %self.kind,
                        stage = %failure.stage,
                        input_count = failure.input_count,
                        "Error while executing stage {} with {} input document(s): {}",
                        failure.stage,
                        failure.input_count,
                        failure.source
                    );
                    self.reset_output();
                    return Err(PhaseError::Stage {
                        stage: failure.stage,
                        input_count: failure.input_count,
                        source: failure.source,
                    });
                }
            }
        };

        self.set_output(documents.clone());
        if self.publishes_output() {
            services.outputs.insert(&self.pipeline, documents.clone());
        }
        Ok(documents)
    }

    /// Dispose the stage chain, recursing into container stages.
    pub fn dispose(&self, seen: &mut HashSet<usize>) {
        dispose_stages(&self.stages, seen);
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("pipeline", &self.pipeline)
            .field("kind", &self.kind)
            .field("isolated", &self.isolated)
            .field("stages", &self.stages.len())
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::stage::StageError;
    use crate::stages::FnStage;

    fn services() -> Arc<EngineServices> {
        Arc::new(EngineServices::default())
    }

    fn upper() -> Arc<dyn Stage> {
        Arc::new(FnStage::new("upper", |ctx| {
            Ok(ctx
                .inputs()
                .iter()
                .map(|d| d.with_content(d.content().to_uppercase()))
                .collect())
        }))
    }

    #[tokio::test]
    async fn empty_chain_passes_input_through() {
        let phase = Phase::new("a", PhaseKind::Transform, false, Vec::new(), Vec::new());
        let input: Documents = vec![Document::new("x")].into();

        let out = phase
            .run(input.clone(), &services(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(out.ptr_eq(&input));
        assert!(phase.output().ptr_eq(&input));
    }

    #[tokio::test]
    async fn process_phase_publishes_output() {
        let services = services();
        let phase = Phase::new("Posts", PhaseKind::Process, false, vec![upper()], Vec::new());

        phase
            .run(
                vec![Document::new("hi")].into(),
                &services,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let published = services.outputs.get("posts").expect("published");
        assert_eq!(published.get(0).map(|d| d.content()), Some("HI"));
        assert!(published.ptr_eq(&phase.output()));
    }

    #[tokio::test]
    async fn isolated_and_non_process_phases_do_not_publish() {
        let services = services();
        let isolated = Phase::new("iso", PhaseKind::Process, true, Vec::new(), Vec::new());
        let transform = Phase::new("t", PhaseKind::Transform, false, Vec::new(), Vec::new());
        let cancel = CancellationToken::new();

        isolated.run(Documents::empty(), &services, &cancel).await.unwrap();
        transform.run(Documents::empty(), &services, &cancel).await.unwrap();

        assert!(services.outputs.is_empty());
    }

    #[tokio::test]
    async fn stage_failure_empties_output() {
        let failing: Arc<dyn Stage> =
            Arc::new(FnStage::new("boom", |_| Err(StageError::msg("kaput"))));
        let phase = Phase::new("a", PhaseKind::Process, false, vec![failing], Vec::new());
        phase.set_output(vec![Document::new("stale")].into());

        let err = phase
            .run(
                vec![Document::new("1"), Document::new("2")].into(),
                &services(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            PhaseError::Stage {
                stage, input_count, ..
            } => {
                assert_eq!(stage, "boom");
                assert_eq!(input_count, 2);
            }
            other => panic!("expected stage error, got {:?}", other),
        }
        assert!(phase.output().is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let failing: Arc<dyn Stage> =
            Arc::new(FnStage::new("boom", |_| Err(StageError::msg("must not run"))));
        let phase = Phase::new("a", PhaseKind::Input, false, vec![failing], Vec::new());

        let err = phase
            .run(Documents::empty(), &services(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }
}
