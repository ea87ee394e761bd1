//! Implicit synchronization between pipelines.
//!
//! No Transform phase may start until every non-isolated pipeline has
//! finished its Process phase, whether or not a dependency was declared.

use crate::graph::PhaseGraph;
use crate::phase::{PhaseId, PhaseKind};

/// Append, to every non-isolated Transform phase, the Process phase of
/// every other non-isolated pipeline.
///
/// The Transform phase's own Process phase stays first, so the document
/// source is unchanged. Isolated pipelines are neither source nor target.
pub fn apply(graph: &mut PhaseGraph) {
    let shared = |kind: PhaseKind| -> Vec<(String, PhaseId)> {
        graph
            .ids()
            .filter_map(|id| graph.phase(id).map(|phase| (id, phase)))
            .filter(|(_, phase)| phase.kind() == kind && !phase.is_isolated())
            .map(|(id, phase)| (phase.pipeline().to_lowercase(), id))
            .collect()
    };
    let process_phases = shared(PhaseKind::Process);
    let transform_phases = shared(PhaseKind::Transform);

    for (owner, transform) in transform_phases {
        let dependencies = &mut graph.phase_mut(transform).dependencies;
        for (pipeline, process) in &process_phases {
            if *pipeline != owner && !dependencies.contains(process) {
                dependencies.push(*process);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::pipeline::{Pipeline, PipelineRegistry};

    fn registry() -> PipelineRegistry {
        let mut registry = PipelineRegistry::new();
        registry.add("a", Pipeline::new()).unwrap();
        registry.add("b", Pipeline::new().depends_on("a")).unwrap();
        registry.add("solo", Pipeline::new().isolated()).unwrap();
        registry
    }

    #[test]
    fn transform_waits_for_every_other_process() {
        let registry = registry();
        let mut graph = GraphBuilder::new(&registry).build().unwrap();
        apply(&mut graph);

        let transform_a = graph.find("a", PhaseKind::Transform).unwrap();
        let process_a = graph.find("a", PhaseKind::Process).unwrap();
        let process_b = graph.find("b", PhaseKind::Process).unwrap();

        let deps = graph.phase(transform_a).unwrap().dependencies();
        assert_eq!(deps, &[process_a, process_b]);
    }

    #[test]
    fn isolated_pipelines_are_untouched() {
        let registry = registry();
        let mut graph = GraphBuilder::new(&registry).build().unwrap();
        apply(&mut graph);

        let transform_solo = graph.find("solo", PhaseKind::Transform).unwrap();
        let process_solo = graph.find("solo", PhaseKind::Process).unwrap();
        assert_eq!(
            graph.phase(transform_solo).unwrap().dependencies(),
            &[process_solo]
        );

        for id in graph.ids() {
            let phase = graph.phase(id).unwrap();
            if !phase.is_isolated() {
                assert!(!phase.dependencies().contains(&process_solo));
            }
        }
    }

    #[test]
    fn applying_twice_adds_nothing() {
        let registry = registry();
        let mut graph = GraphBuilder::new(&registry).build().unwrap();
        apply(&mut graph);
        apply(&mut graph);

        let transform_b = graph.find("b", PhaseKind::Transform).unwrap();
        assert_eq!(graph.phase(transform_b).unwrap().dependencies().len(), 2);
    }
}
