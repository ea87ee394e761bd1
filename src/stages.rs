//! Small general-purpose stages.
//!
//! Real content stages (templating, file I/O, ...) live outside this crate;
//! these cover composition and cross-pipeline document access.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::document::Documents;
use crate::stage::{Stage, StageError};

type StageFn = dyn Fn(&ExecutionContext) -> Result<Documents, StageError> + Send + Sync;

/// A stage backed by a synchronous closure over the execution context.
pub struct FnStage {
    name: String,
    func: Box<StageFn>,
}

impl FnStage {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<Documents, StageError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl Stage for FnStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Documents, StageError> {
        (self.func)(ctx)
    }
}

/// Container stage running its children in order through the context's
/// sub-execute.
pub struct Sequence {
    name: String,
    children: Vec<Arc<dyn Stage>>,
}

impl Sequence {
    pub fn new(name: &str, children: Vec<Arc<dyn Stage>>) -> Self {
        Self {
            name: name.to_string(),
            children,
        }
    }
}

#[async_trait]
impl Stage for Sequence {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Documents, StageError> {
        ctx.execute_stages(&self.children, ctx.inputs().clone())
            .await
    }

    fn children(&self) -> Vec<Arc<dyn Stage>> {
        self.children.clone()
    }
}

/// Replaces the inputs with the Process outputs of the named pipelines.
///
/// Pipelines without an entry in the output store contribute nothing.
pub struct FromPipelines {
    pipelines: Vec<String>,
}

impl FromPipelines {
    pub fn new<I, S>(pipelines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pipelines: pipelines.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Stage for FromPipelines {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Documents, StageError> {
        Ok(collect_outputs(ctx, &self.pipelines))
    }
}

/// Appends the Process outputs of the named pipelines to the inputs.
pub struct ConcatPipelines {
    pipelines: Vec<String>,
}

impl ConcatPipelines {
    pub fn new<I, S>(pipelines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pipelines: pipelines.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Stage for ConcatPipelines {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Documents, StageError> {
        Ok(ctx.inputs().concat(&collect_outputs(ctx, &self.pipelines)))
    }
}

/// Clones every input document with one metadata key set.
pub struct SetMetadata {
    key: String,
    value: Value,
}

impl SetMetadata {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
impl Stage for SetMetadata {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Documents, StageError> {
        Ok(ctx
            .inputs()
            .iter()
            .map(|doc| doc.with_metadata(self.key.clone(), self.value.clone()))
            .collect())
    }
}

fn collect_outputs(ctx: &ExecutionContext, pipelines: &[String]) -> Documents {
    pipelines
        .iter()
        .filter_map(|name| ctx.documents_for(name))
        .flat_map(|docs| docs.as_slice().to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineServices;
    use crate::document::Document;
    use crate::phase::PhaseKind;
    use tokio_util::sync::CancellationToken;

    fn context_with_outputs() -> ExecutionContext {
        let services = EngineServices::default();
        services
            .outputs
            .insert("posts", vec![Document::new("p1"), Document::new("p2")].into());
        services
            .outputs
            .insert("pages", vec![Document::new("g1")].into());
        ExecutionContext::new(
            "archive",
            PhaseKind::Transform,
            Arc::new(services),
            CancellationToken::new(),
        )
    }

    fn contents(docs: &Documents) -> Vec<String> {
        docs.iter().map(|d| d.content().to_string()).collect()
    }

    #[tokio::test]
    async fn from_pipelines_skips_missing_entries() {
        let ctx = context_with_outputs();
        let stage = FromPipelines::new(["Posts", "drafts", "pages"]);
        let out = stage.execute(&ctx).await.expect("stage succeeds");
        assert_eq!(contents(&out), vec!["p1", "p2", "g1"]);
    }

    #[tokio::test]
    async fn sequence_runs_children_and_reports_them() {
        let ctx = context_with_outputs();
        let seq = Sequence::new(
            "gather",
            vec![
                Arc::new(ConcatPipelines::new(["pages"])) as Arc<dyn Stage>,
                Arc::new(SetMetadata::new("section", "archive")),
            ],
        );

        let out = seq.execute(&ctx).await.expect("sequence succeeds");
        assert_eq!(contents(&out), vec!["g1"]);
        assert_eq!(
            out.get(0).and_then(|d| d.get_str("section")),
            Some("archive")
        );
        assert_eq!(seq.children().len(), 2);
    }

    #[tokio::test]
    async fn fn_stage_propagates_errors() {
        let ctx = context_with_outputs();
        let stage = FnStage::new("explode", |_| Err(StageError::msg("bad input")));
        let err = stage.execute(&ctx).await.expect_err("stage fails");
        assert_eq!(err.to_string(), "bad input");
        assert_eq!(stage.name(), "explode");
    }
}
