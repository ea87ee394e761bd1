use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::document::Documents;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by a stage.
///
/// `Cancelled` is not a failure: phases unwind silently when they see it.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("stage cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(BoxError),
}

impl StageError {
    /// A failure carrying only a message.
    pub fn msg(message: impl fmt::Display) -> Self {
        StageError::Failed(message.to_string().into())
    }

    /// Wrap any error type as a stage failure.
    pub fn failed<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StageError::Failed(Box::new(err))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, StageError::Cancelled)
    }
}

/// A unit of document transformation invoked by a phase.
///
/// The scheduler only ever calls [`Stage::execute`]; everything else about
/// a stage is its own business. Stages that hold other stages (containers)
/// report them through [`Stage::children`] so disposal can recurse.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base)
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Documents, StageError>;

    fn children(&self) -> Vec<Arc<dyn Stage>> {
        Vec::new()
    }

    /// Release resources held by the stage. Called at most once per engine.
    fn dispose(&self) {}
}

/// Dispose every stage in `stages`, children before parents.
///
/// `seen` tracks stages already disposed so a stage shared between chains
/// (or between the registry and a built graph) is disposed exactly once.
pub fn dispose_stages(stages: &[Arc<dyn Stage>], seen: &mut HashSet<usize>) {
    for stage in stages {
        if !seen.insert(stage_key(stage)) {
            continue;
        }
        dispose_stages(&stage.children(), seen);
        stage.dispose();
    }
}

/// Record every stage reachable from `stages`, children included, without
/// disposing anything. Seeding a disposal pass with these keys spares them.
pub fn mark_reachable(stages: &[Arc<dyn Stage>], keys: &mut HashSet<usize>) {
    for stage in stages {
        if keys.insert(stage_key(stage)) {
            mark_reachable(&stage.children(), keys);
        }
    }
}

fn stage_key(stage: &Arc<dyn Stage>) -> usize {
    Arc::as_ptr(stage) as *const () as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        disposed: Arc<AtomicUsize>,
        children: Vec<Arc<dyn Stage>>,
    }

    #[async_trait]
    impl Stage for Counting {
        async fn execute(&self, ctx: &ExecutionContext) -> Result<Documents, StageError> {
            Ok(ctx.inputs().clone())
        }

        fn children(&self) -> Vec<Arc<dyn Stage>> {
            self.children.clone()
        }

        fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn default_name_is_type_name() {
        let stage = Counting {
            disposed: Arc::new(AtomicUsize::new(0)),
            children: Vec::new(),
        };
        assert_eq!(stage.name(), "Counting");
    }

    #[test]
    fn dispose_recurses_into_children_once() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let leaf: Arc<dyn Stage> = Arc::new(Counting {
            disposed: Arc::clone(&disposed),
            children: Vec::new(),
        });
        let parent: Arc<dyn Stage> = Arc::new(Counting {
            disposed: Arc::clone(&disposed),
            children: vec![Arc::clone(&leaf)],
        });

        let mut seen = HashSet::new();
        dispose_stages(&[Arc::clone(&parent), Arc::clone(&leaf)], &mut seen);

        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn marked_stages_are_spared_by_disposal() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let kept_leaf: Arc<dyn Stage> = Arc::new(Counting {
            disposed: Arc::clone(&disposed),
            children: Vec::new(),
        });
        let kept: Arc<dyn Stage> = Arc::new(Counting {
            disposed: Arc::clone(&disposed),
            children: vec![Arc::clone(&kept_leaf)],
        });
        let dropped: Arc<dyn Stage> = Arc::new(Counting {
            disposed: Arc::clone(&disposed),
            children: vec![Arc::clone(&kept_leaf)],
        });

        let mut seen = HashSet::new();
        mark_reachable(&[Arc::clone(&kept)], &mut seen);
        assert_eq!(seen.len(), 2);

        dispose_stages(&[kept, dropped], &mut seen);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stage_error_cancellation_is_distinct() {
        assert!(StageError::Cancelled.is_cancellation());
        assert!(!StageError::msg("boom").is_cancellation());
        assert_eq!(StageError::msg("boom").to_string(), "boom");
    }
}
