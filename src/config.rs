use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

use crate::pipeline::{ExecutionPolicy, Pipeline, PipelineRegistry};

pub const CONFIG_FILE_NAME: &str = "docflow.toml";

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DocflowConfig {
    pub engine: EngineConfig,
    pub settings: Settings,
    pub pipelines: IndexMap<String, PipelineConfig>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Cancel the whole run on the first stage failure.
    pub fail_fast: bool,
    pub input_paths: Vec<String>,
    pub output_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            input_paths: vec!["input".to_string()],
            output_path: "output".to_string(),
        }
    }
}

impl EngineConfig {
    /// Input paths that resolve to the output path. Reading and writing
    /// the same directory is allowed but almost never intended.
    pub fn overlapping_input_paths(&self) -> Vec<&str> {
        let output = normalize(&self.output_path);
        self.input_paths
            .iter()
            .filter(|input| normalize(input) == output)
            .map(String::as_str)
            .collect()
    }
}

fn normalize(path: &str) -> PathBuf {
    Path::new(path.trim())
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Topology of one pipeline as declared in `docflow.toml`.
///
/// Stages are code, not configuration; pipelines declared here get empty
/// (pass-through) chains.
#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub dependencies: Vec<String>,
    pub isolated: bool,
    pub deployment: bool,
    pub execution_policy: ExecutionPolicy,
}

impl PipelineConfig {
    pub fn to_pipeline(&self) -> Pipeline {
        let mut pipeline = self
            .dependencies
            .iter()
            .fold(Pipeline::new(), |p, dep| p.depends_on(dep))
            .with_deployment(self.deployment)
            .with_execution_policy(self.execution_policy);
        if self.isolated {
            pipeline = pipeline.isolated();
        }
        pipeline
    }
}

/// Free-form settings exposed read-only to every stage.
#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(transparent)]
pub struct Settings(IndexMap<String, Value>);

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

pub fn validate(config: &DocflowConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.engine.output_path.trim().is_empty() {
        errors.push("engine.output_path must not be empty".to_string());
    }

    let mut seen_names = HashSet::new();
    for (name, pipeline) in &config.pipelines {
        let key = name.trim().to_lowercase();
        if key.is_empty() {
            errors.push("pipelines: pipeline name must not be empty".to_string());
            continue;
        }
        if !seen_names.insert(key.clone()) {
            errors.push(format!(
                "pipelines.{}: duplicate pipeline name (names are case-insensitive)",
                name
            ));
        }
        if pipeline
            .dependencies
            .iter()
            .any(|dep| dep.trim().to_lowercase() == key)
        {
            errors.push(format!("pipelines.{}: pipeline depends on itself", name));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load `docflow.toml` from `project_root`, or defaults if it is absent.
pub fn load_config(project_root: &Path) -> Result<DocflowConfig, String> {
    let config_path = project_root.join(CONFIG_FILE_NAME);

    if !config_path.exists() {
        return Ok(DocflowConfig::default());
    }

    load_config_from(&config_path)
}

pub fn load_config_from(config_path: &Path) -> Result<DocflowConfig, String> {
    let contents = std::fs::read_to_string(config_path)
        .map_err(|e| format!("Failed to read {}: {}", config_path.display(), e))?;

    let config: DocflowConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", config_path.display(), e))?;

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}

/// Register every pipeline declared in `config`, in declaration order.
pub fn build_registry(config: &DocflowConfig) -> Result<PipelineRegistry, String> {
    let mut registry = PipelineRegistry::new();
    for (name, pipeline) in &config.pipelines {
        registry
            .add(name, pipeline.to_pipeline())
            .map_err(|e| format!("pipelines.{}: {}", name, e))?;
    }
    Ok(registry)
}
