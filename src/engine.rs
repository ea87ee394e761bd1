use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{self, DocflowConfig, EngineConfig, Settings};
use crate::context::EngineServices;
use crate::error::EngineError;
use crate::graph::{build_graph, PhaseGraph};
use crate::output_store::OutputStore;
use crate::pipeline::PipelineRegistry;
use crate::scheduler::{self, RunOptions, RunSummary};
use crate::stage::{dispose_stages, mark_reachable, Stage};

struct BuiltGraph {
    version: u64,
    graph: Arc<PhaseGraph>,
}

/// Owns the pipeline registry and runs it.
///
/// The phase graph is built lazily and cached against the registry
/// version; any registry mutation makes the next [`Engine::execute`]
/// rebuild it. A rebuild disposes the stale graph's stages that no
/// registered pipeline still holds; dropping the engine disposes the rest.
pub struct Engine {
    pipelines: PipelineRegistry,
    config: EngineConfig,
    settings: Settings,
    outputs: OutputStore,
    graph: Option<BuiltGraph>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            pipelines: PipelineRegistry::new(),
            config: EngineConfig::default(),
            settings: Settings::new(),
            outputs: OutputStore::new(),
            graph: None,
        }
    }

    /// Engine using the `[engine]` and `[settings]` sections of `config`.
    /// Pipelines are registered separately.
    pub fn with_config(config: &DocflowConfig) -> Self {
        let mut engine = Self::new();
        engine.config = config.engine.clone();
        engine.settings = config.settings.clone();
        engine
    }

    /// Validated engine with every pipeline declared in `config` registered,
    /// in declaration order.
    pub fn from_config(config: &DocflowConfig) -> Result<Self, EngineError> {
        config::validate(config).map_err(|errors| EngineError::Config(errors.join("; ")))?;

        let mut engine = Self::with_config(config);
        for (name, pipeline) in &config.pipelines {
            engine.pipelines.add(name, pipeline.to_pipeline())?;
        }
        Ok(engine)
    }

    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.pipelines
    }

    pub fn pipelines_mut(&mut self) -> &mut PipelineRegistry {
        &mut self.pipelines
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Process outputs of the most recent run, keyed by pipeline.
    pub fn outputs(&self) -> &OutputStore {
        &self.outputs
    }

    /// The graph from the last build, if it is still current.
    pub fn graph(&self) -> Option<&Arc<PhaseGraph>> {
        self.graph
            .as_ref()
            .filter(|built| built.version == self.pipelines.version())
            .map(|built| &built.graph)
    }

    /// Build the phase graph if the registry changed since the last build.
    ///
    /// Configuration errors (cycles, unknown or isolated dependencies) are
    /// returned here, before any stage can run.
    pub fn prepare(&mut self) -> Result<Arc<PhaseGraph>, EngineError> {
        let version = self.pipelines.version();
        if let Some(built) = &self.graph {
            if built.version == version {
                return Ok(Arc::clone(&built.graph));
            }
        }

        if let Some(stale) = self.graph.take() {
            self.release(&stale.graph);
        }

        let started = Instant::now();
        let graph = match build_graph(&self.pipelines) {
            Ok(graph) => Arc::new(graph),
            Err(e) => {
                error!("Invalid pipeline configuration: {}", e);
                return Err(e.into());
            }
        };
        debug!(
            phases = graph.len(),
            "Built phase graph in {} ms",
            started.elapsed().as_millis()
        );

        self.graph = Some(BuiltGraph {
            version,
            graph: Arc::clone(&graph),
        });
        Ok(graph)
    }

    /// Run every registered pipeline once.
    ///
    /// Stage failures do not make this return `Err`; they are logged and
    /// reported in the returned summary. Only configuration errors do.
    ///
    /// `cancel` is only observed: the run works on a child token, so a token
    /// that survives one run can be handed to the next.
    pub async fn execute(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<RunSummary, EngineError> {
        let started = Instant::now();

        if self.pipelines.is_empty() {
            error!("No pipelines are configured or specified for execution");
            return Ok(RunSummary::no_pipelines());
        }

        for path in self.config.overlapping_input_paths() {
            warn!(
                "Input path '{}' is the same as the output path '{}'",
                path, self.config.output_path
            );
        }

        self.outputs.clear();
        let graph = self.prepare()?;

        info!(
            pipelines = self.pipelines.len(),
            phases = graph.len(),
            "Executing {} pipeline(s)",
            self.pipelines.len()
        );

        let services = Arc::new(EngineServices::new(
            self.settings.clone(),
            self.outputs.clone(),
        ));
        let options = RunOptions {
            fail_fast: self.config.fail_fast,
        };

        let mut summary = scheduler::run(graph, services, cancel, options).await;
        summary.elapsed = started.elapsed();
        summary.log();
        Ok(summary)
    }

    /// Dispose the stages of a stale graph that no registered pipeline
    /// still holds. Stages that are still registered live on into the
    /// rebuilt graph.
    fn release(&self, stale: &PhaseGraph) {
        let mut retained = HashSet::new();
        for (_, pipeline) in self.pipelines.iter() {
            let stages: Vec<Arc<dyn Stage>> = pipeline.all_stages().cloned().collect();
            mark_reachable(&stages, &mut retained);
        }
        let before = retained.len();
        stale.dispose(&mut retained);
        debug!(
            released = retained.len() - before,
            "Released stale phase graph"
        );
    }

    /// Dispose every stage and release the engine.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let mut seen = HashSet::new();
        if let Some(built) = self.graph.take() {
            built.graph.dispose(&mut seen);
        }
        for (_, pipeline) in self.pipelines.iter() {
            let stages: Vec<Arc<dyn Stage>> = pipeline.all_stages().cloned().collect();
            dispose_stages(&stages, &mut seen);
        }
    }
}
