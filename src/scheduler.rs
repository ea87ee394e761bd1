use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::EngineServices;
use crate::document::Documents;
use crate::error::PhaseError;
use crate::graph::PhaseGraph;
use crate::phase::{Phase, PhaseId, PhaseKind};

// --- Public types ---

/// Knobs for a single run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Cancel the whole run on the first stage failure instead of only
    /// skipping the failed phase's dependents.
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Succeeded,
    /// A stage in this phase raised an error.
    Failed,
    /// Not run because a dependency failed.
    Skipped,
    Cancelled,
    NotRun,
}

/// Outcome of one phase within a run.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub pipeline: String,
    pub kind: PhaseKind,
    pub stage_count: usize,
    pub elapsed: Duration,
    pub output_count: usize,
    pub status: PhaseStatus,
    pub error: Option<String>,
}

impl PhaseReport {
    fn new(phase: &Phase) -> Self {
        Self {
            pipeline: phase.pipeline().to_string(),
            kind: phase.kind(),
            stage_count: phase.stages().len(),
            elapsed: Duration::ZERO,
            output_count: 0,
            status: PhaseStatus::NotRun,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Finished, but at least one phase failed or was skipped.
    CompletedWithErrors,
    Cancelled,
    NoPipelines,
}

/// Result of a run, returned to the caller for summary display.
#[derive(Debug)]
pub struct RunSummary {
    pub status: RunStatus,
    pub elapsed: Duration,
    pub phases: Vec<PhaseReport>,
    /// Messages of the phases whose stages failed.
    pub failures: Vec<String>,
}

impl RunSummary {
    pub(crate) fn no_pipelines() -> Self {
        Self {
            status: RunStatus::NoPipelines,
            elapsed: Duration::ZERO,
            phases: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn report(&self, pipeline: &str, kind: PhaseKind) -> Option<&PhaseReport> {
        self.phases
            .iter()
            .find(|r| r.kind == kind && r.pipeline.eq_ignore_ascii_case(pipeline))
    }

    /// Log one line per phase followed by the total elapsed time.
    pub fn log(&self) {
        for report in &self.phases {
            info!(
                pipeline = %report.pipeline,
                phase = %report.kind,
                "{}/{} » {} stage(s) » {} ms » {} output document(s) » {:?}",
                report.pipeline,
                report.kind,
                report.stage_count,
                report.elapsed.as_millis(),
                report.output_count,
                report.status
            );
        }
        info!("Finished execution in {} ms ({:?})", self.elapsed.as_millis(), self.status);
    }
}

// --- Settlement signalling ---

/// What a finished phase tells its dependents.
#[derive(Debug, Clone)]
enum Settlement {
    Succeeded(Documents),
    Failed,
    Cancelled,
}

type SettlementTx = watch::Sender<Option<Settlement>>;
type SettlementRx = watch::Receiver<Option<Settlement>>;

/// Wait until a dependency settles. A sender dropped without settling means
/// the phase task died, which counts as a failure.
async fn wait_for_settlement(mut rx: SettlementRx) -> Settlement {
    match rx.wait_for(Option::is_some).await {
        Ok(value) => value.as_ref().cloned().unwrap_or(Settlement::Failed),
        Err(_) => Settlement::Failed,
    }
}

// --- Run ---

/// Execute every phase of `graph` once.
///
/// Each phase becomes a task that waits for all of its dependencies to
/// settle before deciding whether to run. Returns once every task has
/// settled; stage failures are reported in the summary, never raised.
/// Cancelling `cancel` stops the run; the run itself only ever cancels a
/// child of it.
pub async fn run(
    graph: Arc<PhaseGraph>,
    services: Arc<EngineServices>,
    cancel: CancellationToken,
    options: RunOptions,
) -> RunSummary {
    let started = Instant::now();
    // Failure handling cancels this run's token, never the caller's.
    let cancel = cancel.child_token();

    let (senders, receivers): (Vec<SettlementTx>, Vec<SettlementRx>) =
        (0..graph.len()).map(|_| watch::channel(None)).unzip();

    let mut join_set: JoinSet<(PhaseId, PhaseReport)> = JoinSet::new();

    for (id, sender) in graph.ids().zip(senders) {
        let dependencies: Vec<SettlementRx> = graph.phases()[id.index()]
            .dependencies()
            .iter()
            .map(|dep| receivers[dep.index()].clone())
            .collect();
        let graph = Arc::clone(&graph);
        let services = Arc::clone(&services);
        let cancel = cancel.clone();

        join_set.spawn(async move {
            let phase = &graph.phases()[id.index()];
            let outcome = AssertUnwindSafe(run_phase(
                phase,
                dependencies,
                &services,
                &cancel,
                options,
            ))
            .catch_unwind()
            .await;

            let (report, settlement) = match outcome {
                Ok(result) => result,
                Err(_) => {
                    error!(
                        pipeline = %phase.pipeline(),
                        phase = %phase.kind(),
                        "Phase panicked"
                    );
                    phase.reset_output();
                    if options.fail_fast {
                        cancel.cancel();
                    }
                    let mut report = PhaseReport::new(phase);
                    report.status = PhaseStatus::Failed;
                    report.error = Some(format!(
                        "{}/{} panicked",
                        phase.pipeline(),
                        phase.kind()
                    ));
                    (report, Settlement::Failed)
                }
            };

            // Nobody may be listening (phases without dependents).
            let _ = sender.send(Some(settlement));
            (id, report)
        });
    }
    drop(receivers);

    let mut reports: Vec<Option<PhaseReport>> = vec![None; graph.len()];
    while let Some(result) = join_set.join_next().await {
        match result {
            Ok((id, report)) => reports[id.index()] = Some(report),
            Err(e) => debug!("Phase task join error: {}", e),
        }
    }

    let phases: Vec<PhaseReport> = graph
        .phases()
        .iter()
        .zip(reports)
        .map(|(phase, report)| report.unwrap_or_else(|| PhaseReport::new(phase)))
        .collect();

    let failures: Vec<String> = phases
        .iter()
        .filter(|r| r.status == PhaseStatus::Failed)
        .filter_map(|r| r.error.clone())
        .collect();
    let has_errors = phases
        .iter()
        .any(|r| matches!(r.status, PhaseStatus::Failed | PhaseStatus::Skipped));

    let status = if has_errors {
        RunStatus::CompletedWithErrors
    } else if cancel.is_cancelled() || phases.iter().any(|r| r.status == PhaseStatus::Cancelled)
    {
        RunStatus::Cancelled
    } else {
        RunStatus::Completed
    };

    if has_errors {
        error!(
            failed = failures.len(),
            "Critical failure during execution: {}",
            if failures.is_empty() {
                "one or more phases did not complete".to_string()
            } else {
                failures.join("; ")
            }
        );
        cancel.cancel();
    }

    RunSummary {
        status,
        elapsed: started.elapsed(),
        phases,
        failures,
    }
}

/// Wait for `phase`'s dependencies, then run it unless one of them failed
/// or the run was cancelled.
async fn run_phase(
    phase: &Phase,
    dependencies: Vec<SettlementRx>,
    services: &Arc<EngineServices>,
    cancel: &CancellationToken,
    options: RunOptions,
) -> (PhaseReport, Settlement) {
    let settled = join_all(dependencies.into_iter().map(wait_for_settlement)).await;
    let mut report = PhaseReport::new(phase);

    if settled.iter().any(|s| matches!(s, Settlement::Failed)) {
        phase.reset_output();
        let skipped = PhaseError::DependencyFailed {
            pipeline: phase.pipeline().to_string(),
            phase: phase.kind(),
        };
        warn!(pipeline = %phase.pipeline(), phase = %phase.kind(), "{}", skipped);
        report.status = PhaseStatus::Skipped;
        report.error = Some(skipped.to_string());
        return (report, Settlement::Failed);
    }

    if cancel.is_cancelled() || settled.iter().any(|s| matches!(s, Settlement::Cancelled)) {
        phase.reset_output();
        report.status = PhaseStatus::Cancelled;
        return (report, Settlement::Cancelled);
    }

    let input = match settled.first() {
        Some(Settlement::Succeeded(documents)) => documents.clone(),
        _ => Documents::empty(),
    };

    debug!(
        pipeline = %phase.pipeline(),
        phase = %phase.kind(),
        inputs = input.len(),
        "Starting phase"
    );
    let started = Instant::now();
    let result = phase.run(input, services, cancel).await;
    report.elapsed = started.elapsed();

    match result {
        Ok(documents) => {
            report.status = PhaseStatus::Succeeded;
            report.output_count = documents.len();
            (report, Settlement::Succeeded(documents))
        }
        Err(PhaseError::Cancelled) => {
            report.status = PhaseStatus::Cancelled;
            (report, Settlement::Cancelled)
        }
        Err(e) => {
            if options.fail_fast {
                cancel.cancel();
            }
            report.status = PhaseStatus::Failed;
            report.error = Some(format!("{}/{}: {}", phase.pipeline(), phase.kind(), e));
            (report, Settlement::Failed)
        }
    }
}
