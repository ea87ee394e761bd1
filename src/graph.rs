use std::collections::{HashMap, HashSet};
use std::fmt;

use indexmap::IndexSet;

use crate::barrier;
use crate::error::GraphError;
use crate::phase::{Phase, PhaseId, PhaseKind};
use crate::pipeline::{Pipeline, PipelineRegistry};

/// The built phase graph: four phases per pipeline, dependencies wired.
///
/// Phases appear in build order: a pipeline's four phases are appended
/// together, after those of every pipeline its Process phase depends on.
#[derive(Debug, Default)]
pub struct PhaseGraph {
    phases: Vec<Phase>,
}

impl PhaseGraph {
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn phase(&self, id: PhaseId) -> Option<&Phase> {
        self.phases.get(id.0)
    }

    pub fn ids(&self) -> impl Iterator<Item = PhaseId> {
        (0..self.phases.len()).map(PhaseId)
    }

    /// Look up the phase of `kind` for `pipeline` (case-insensitive).
    pub fn find(&self, pipeline: &str, kind: PhaseKind) -> Option<PhaseId> {
        self.phases
            .iter()
            .position(|p| p.kind() == kind && p.pipeline().eq_ignore_ascii_case(pipeline))
            .map(PhaseId)
    }

    /// The phases `id` waits for, in dependency order.
    pub fn dependencies_of(&self, id: PhaseId) -> Vec<&Phase> {
        self.phase(id)
            .map(|phase| {
                phase
                    .dependencies()
                    .iter()
                    .filter_map(|dep| self.phase(*dep))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Dispose every stage of every phase. `seen` is shared with other
    /// disposal passes so a stage is never disposed twice.
    pub fn dispose(&self, seen: &mut HashSet<usize>) {
        for phase in &self.phases {
            phase.dispose(seen);
        }
    }

    fn push(&mut self, phase: Phase) -> PhaseId {
        self.phases.push(phase);
        PhaseId(self.phases.len() - 1)
    }

    pub(crate) fn phase_mut(&mut self, id: PhaseId) -> &mut Phase {
        &mut self.phases[id.0]
    }
}

impl fmt::Display for PhaseGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, phase) in self.phases.iter().enumerate() {
            write!(
                f,
                "[{}] {}/{} ({} stage(s))",
                index,
                phase.pipeline(),
                phase.kind(),
                phase.stages().len()
            )?;
            if phase.is_isolated() {
                write!(f, " isolated")?;
            }
            let deps: Vec<String> = self
                .dependencies_of(PhaseId(index))
                .iter()
                .map(|dep| format!("{}/{}", dep.pipeline(), dep.kind()))
                .collect();
            if !deps.is_empty() {
                write!(f, " <- {}", deps.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Build the complete graph for `registry`, barrier edges included.
pub fn build_graph(registry: &PipelineRegistry) -> Result<PhaseGraph, GraphError> {
    let mut graph = GraphBuilder::new(registry).build()?;
    barrier::apply(&mut graph);
    Ok(graph)
}

/// Depth-first, memoized construction of the phase graph.
///
/// Detects dependency cycles, unknown dependency names and dependencies on
/// isolated pipelines. Barrier edges are added separately by
/// [`barrier::apply`].
pub struct GraphBuilder<'a> {
    registry: &'a PipelineRegistry,
    graph: PhaseGraph,
    /// Lower-cased pipeline name → its Process phase.
    completed: HashMap<String, PhaseId>,
    /// Current DFS path, in visiting order.
    visiting: IndexSet<String>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a PipelineRegistry) -> Self {
        Self {
            registry,
            graph: PhaseGraph::default(),
            completed: HashMap::new(),
            visiting: IndexSet::new(),
        }
    }

    pub fn build(mut self) -> Result<PhaseGraph, GraphError> {
        let registry = self.registry;
        for (name, pipeline) in registry.iter() {
            self.visit(name, pipeline)?;
        }
        Ok(self.graph)
    }

    /// Build `pipeline` (and, first, everything it depends on). Returns its
    /// Process phase.
    fn visit(&mut self, name: &str, pipeline: &Pipeline) -> Result<PhaseId, GraphError> {
        // Isolated pipelines can't take part in dependency edges, so they
        // never enter cycle bookkeeping.
        if pipeline.is_isolated() {
            return Ok(self.append_chain(name, pipeline, Vec::new()));
        }

        let key = name.to_lowercase();
        if let Some(start) = self.visiting.get_index_of(&key) {
            let mut path: Vec<String> = self
                .visiting
                .iter()
                .skip(start)
                .map(|k| self.display_name(k))
                .collect();
            path.push(name.to_string());
            return Err(GraphError::DependencyCycle { path });
        }
        if let Some(process) = self.completed.get(&key) {
            return Ok(*process);
        }

        self.visiting.insert(key.clone());

        let registry = self.registry;
        let mut upstream = Vec::new();
        for dependency in pipeline.dependencies() {
            let Some(dep_pipeline) = registry.get(dependency) else {
                return Err(GraphError::UnknownDependency {
                    pipeline: name.to_string(),
                    dependency: dependency.to_string(),
                });
            };
            let dep_name = registry.display_name(dependency).unwrap_or(dependency);
            if dep_pipeline.is_isolated() {
                return Err(GraphError::IsolatedDependency {
                    pipeline: name.to_string(),
                    dependency: dep_name.to_string(),
                });
            }
            upstream.push(self.visit(dep_name, dep_pipeline)?);
        }

        let process = self.append_chain(name, pipeline, upstream);
        self.completed.insert(key.clone(), process);
        self.visiting.shift_remove(&key);
        Ok(process)
    }

    /// Append Input → Process → Transform → Output for one pipeline.
    ///
    /// Process depends on Input first (its document source), then on the
    /// `upstream` Process phases.
    fn append_chain(
        &mut self,
        name: &str,
        pipeline: &Pipeline,
        upstream: Vec<PhaseId>,
    ) -> PhaseId {
        let isolated = pipeline.is_isolated();
        let phase = |kind: PhaseKind, dependencies: Vec<PhaseId>| {
            Phase::new(
                name,
                kind,
                isolated,
                pipeline.stages(kind).to_vec(),
                dependencies,
            )
        };

        let input = self.graph.push(phase(PhaseKind::Input, Vec::new()));

        let mut process_deps = vec![input];
        process_deps.extend(upstream);
        let process = self.graph.push(phase(PhaseKind::Process, process_deps));

        let transform = self.graph.push(phase(PhaseKind::Transform, vec![process]));
        self.graph.push(phase(PhaseKind::Output, vec![transform]));

        process
    }

    fn display_name(&self, key: &str) -> String {
        self.registry
            .display_name(key)
            .unwrap_or(key)
            .to_string()
    }
}
