use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::phase::PhaseKind;
use crate::stage::Stage;

/// Scheduling hint for an outer orchestrator deciding which pipelines to
/// run. The scheduler itself runs every registered pipeline.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPolicy {
    #[default]
    Default,
    Normal,
    Manual,
    Always,
}

/// A named chain of four phases, each holding an ordered list of stages.
///
/// Stages are placed into their phase explicitly with the `with_*`
/// builders; nothing is inferred from the stage type.
#[derive(Clone, Default)]
pub struct Pipeline {
    input: Vec<Arc<dyn Stage>>,
    process: Vec<Arc<dyn Stage>>,
    transform: Vec<Arc<dyn Stage>>,
    output: Vec<Arc<dyn Stage>>,
    dependencies: IndexSet<String>,
    isolated: bool,
    deployment: bool,
    execution_policy: ExecutionPolicy,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(self, stage: impl Stage + 'static) -> Self {
        self.with_stage(PhaseKind::Input, Arc::new(stage))
    }

    pub fn with_process(self, stage: impl Stage + 'static) -> Self {
        self.with_stage(PhaseKind::Process, Arc::new(stage))
    }

    pub fn with_transform(self, stage: impl Stage + 'static) -> Self {
        self.with_stage(PhaseKind::Transform, Arc::new(stage))
    }

    pub fn with_output(self, stage: impl Stage + 'static) -> Self {
        self.with_stage(PhaseKind::Output, Arc::new(stage))
    }

    /// Append an already shared stage to the chain for `kind`.
    pub fn with_stage(mut self, kind: PhaseKind, stage: Arc<dyn Stage>) -> Self {
        self.chain_mut(kind).push(stage);
        self
    }

    /// Declare that this pipeline's Process phase waits for `pipeline`'s.
    ///
    /// Names compare case-insensitively; repeated names collapse.
    pub fn depends_on(mut self, pipeline: &str) -> Self {
        self.dependencies.insert(pipeline.to_lowercase());
        self
    }

    pub fn isolated(mut self) -> Self {
        self.isolated = true;
        self
    }

    pub fn with_deployment(mut self, deployment: bool) -> Self {
        self.deployment = deployment;
        self
    }

    pub fn with_execution_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.execution_policy = policy;
        self
    }

    pub fn stages(&self, kind: PhaseKind) -> &[Arc<dyn Stage>] {
        match kind {
            PhaseKind::Input => &self.input,
            PhaseKind::Process => &self.process,
            PhaseKind::Transform => &self.transform,
            PhaseKind::Output => &self.output,
        }
    }

    fn chain_mut(&mut self, kind: PhaseKind) -> &mut Vec<Arc<dyn Stage>> {
        match kind {
            PhaseKind::Input => &mut self.input,
            PhaseKind::Process => &mut self.process,
            PhaseKind::Transform => &mut self.transform,
            PhaseKind::Output => &mut self.output,
        }
    }

    /// Every stage of every phase, in phase order.
    pub fn all_stages(&self) -> impl Iterator<Item = &Arc<dyn Stage>> {
        PhaseKind::ALL
            .into_iter()
            .flat_map(move |kind| self.stages(kind).iter())
    }

    /// Lower-cased names of the pipelines this one depends on.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(String::as_str)
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    pub fn is_deployment(&self) -> bool {
        self.deployment
    }

    pub fn execution_policy(&self) -> ExecutionPolicy {
        self.execution_policy
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |stages: &[Arc<dyn Stage>]| -> Vec<String> {
            stages.iter().map(|s| s.name().to_string()).collect()
        };
        f.debug_struct("Pipeline")
            .field("input", &names(&self.input))
            .field("process", &names(&self.process))
            .field("transform", &names(&self.transform))
            .field("output", &names(&self.output))
            .field("dependencies", &self.dependencies)
            .field("isolated", &self.isolated)
            .field("deployment", &self.deployment)
            .field("execution_policy", &self.execution_policy)
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Registered {
    name: String,
    pipeline: Arc<Pipeline>,
}

/// Versions are unique across every registry in the process, so swapping
/// one registry for another can never look like "unchanged".
fn next_version() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Ordered, case-insensitive collection of named pipelines.
///
/// Every mutation advances [`PipelineRegistry::version`]; the engine
/// rebuilds its phase graph whenever the version differs from the one it
/// last built from.
#[derive(Debug)]
pub struct PipelineRegistry {
    entries: IndexMap<String, Registered>,
    version: u64,
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
            version: next_version(),
        }
    }
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pipeline. Fails on an empty or already-used name.
    pub fn add(&mut self, name: &str, pipeline: Pipeline) -> Result<(), RegistryError> {
        let key = registry_key(name)?;
        if let Some(existing) = self.entries.get(&key) {
            return Err(RegistryError::DuplicatePipeline(existing.name.clone()));
        }
        self.entries.insert(
            key,
            Registered {
                name: name.trim().to_string(),
                pipeline: Arc::new(pipeline),
            },
        );
        self.version = next_version();
        Ok(())
    }

    /// Register or replace a pipeline, keeping its position when replaced.
    ///
    /// Returns the pipeline previously registered under the name.
    pub fn insert(
        &mut self,
        name: &str,
        pipeline: Pipeline,
    ) -> Result<Option<Arc<Pipeline>>, RegistryError> {
        let key = registry_key(name)?;
        let previous = self.entries.insert(
            key,
            Registered {
                name: name.trim().to_string(),
                pipeline: Arc::new(pipeline),
            },
        );
        self.version = next_version();
        Ok(previous.map(|r| r.pipeline))
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<Pipeline>> {
        let removed = self.entries.shift_remove(&name.trim().to_lowercase())?;
        self.version = next_version();
        Some(removed.pipeline)
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.version = next_version();
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Pipeline>> {
        self.entries
            .get(&name.trim().to_lowercase())
            .map(|r| &r.pipeline)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.trim().to_lowercase())
    }

    /// Display name as registered, looked up case-insensitively.
    pub fn display_name(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.trim().to_lowercase())
            .map(|r| r.name.as_str())
    }

    /// `(display name, pipeline)` pairs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Pipeline>)> {
        self.entries
            .values()
            .map(|r| (r.name.as_str(), &r.pipeline))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

fn registry_key(name: &str) -> Result<String, RegistryError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(RegistryError::EmptyName);
    }
    Ok(trimmed.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rejects_duplicates_case_insensitively() {
        let mut registry = PipelineRegistry::new();
        registry.add("Content", Pipeline::new()).unwrap();

        let err = registry.add("content", Pipeline::new()).unwrap_err();
        assert_eq!(err, RegistryError::DuplicatePipeline("Content".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn add_rejects_empty_name() {
        let mut registry = PipelineRegistry::new();
        let before = registry.version();
        assert_eq!(
            registry.add("   ", Pipeline::new()).unwrap_err(),
            RegistryError::EmptyName
        );
        assert_eq!(registry.version(), before);
    }

    #[test]
    fn every_mutation_advances_version() {
        let mut registry = PipelineRegistry::new();
        let v0 = registry.version();
        registry.add("a", Pipeline::new()).unwrap();
        let v1 = registry.version();
        assert!(v1 > v0);

        let previous = registry.insert("A", Pipeline::new().isolated()).unwrap();
        assert!(previous.is_some());
        let v2 = registry.version();
        assert!(v2 > v1);
        assert!(registry.get("a").unwrap().is_isolated());

        assert!(registry.remove("a").is_some());
        let v3 = registry.version();
        assert!(v3 > v2);

        assert!(registry.remove("a").is_none());
        assert_eq!(registry.version(), v3);
    }

    #[test]
    fn separate_registries_never_share_a_version() {
        let a = PipelineRegistry::new();
        let b = PipelineRegistry::new();
        assert_ne!(a.version(), b.version());
    }

    #[test]
    fn insert_keeps_registration_order() {
        let mut registry = PipelineRegistry::new();
        registry.add("first", Pipeline::new()).unwrap();
        registry.add("second", Pipeline::new()).unwrap();
        registry.insert("FIRST", Pipeline::new()).unwrap();

        let names: Vec<&str> = registry.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["FIRST", "second"]);
        assert_eq!(registry.display_name("first"), Some("FIRST"));
    }

    #[test]
    fn dependencies_are_normalized() {
        let pipeline = Pipeline::new().depends_on("Posts").depends_on("POSTS");
        let deps: Vec<&str> = pipeline.dependencies().collect();
        assert_eq!(deps, vec!["posts"]);
    }

    #[test]
    fn deployment_hints_are_carried() {
        let pipeline = Pipeline::new()
            .with_deployment(true)
            .with_execution_policy(ExecutionPolicy::Manual);
        assert!(pipeline.is_deployment());
        assert_eq!(pipeline.execution_policy(), ExecutionPolicy::Manual);
        assert!(!pipeline.is_isolated());
    }
}
