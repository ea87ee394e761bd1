#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use docflow::context::ExecutionContext;
use docflow::document::{Document, Documents};
use docflow::stage::{Stage, StageError};

/// Shared, ordered record of stage events across every pipeline in a run.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Position of `event` in the log. Panics if it was never recorded.
    pub fn position(&self, event: &str) -> usize {
        let events = self.events();
        events
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event '{}' not recorded in {:?}", event, events))
    }

    pub fn contains(&self, event: &str) -> bool {
        self.events().iter().any(|e| e == event)
    }
}

/// Records `"{pipeline}/{phase}"` and passes its inputs through.
pub struct Recording {
    log: EventLog,
}

impl Recording {
    pub fn new(log: &EventLog) -> Self {
        Self { log: log.clone() }
    }
}

#[async_trait]
impl Stage for Recording {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Documents, StageError> {
        self.log.push(format!("{}/{}", ctx.pipeline(), ctx.phase()));
        Ok(ctx.inputs().clone())
    }
}

/// Emits fixed documents, ignoring its inputs.
pub struct Emit {
    contents: Vec<String>,
}

impl Emit {
    pub fn new(contents: &[&str]) -> Self {
        Self {
            contents: contents.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[async_trait]
impl Stage for Emit {
    async fn execute(&self, _ctx: &ExecutionContext) -> Result<Documents, StageError> {
        Ok(self.contents.iter().map(Document::new).collect())
    }
}

/// Always fails with `message`.
pub struct Failing {
    message: String,
}

impl Failing {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl Stage for Failing {
    async fn execute(&self, _ctx: &ExecutionContext) -> Result<Documents, StageError> {
        Err(StageError::msg(&self.message))
    }
}

/// Sleeps for `delay` (or until cancelled), then passes inputs through.
pub struct Sleeping {
    delay: Duration,
    log: EventLog,
}

impl Sleeping {
    pub fn new(delay: Duration, log: &EventLog) -> Self {
        Self {
            delay,
            log: log.clone(),
        }
    }
}

#[async_trait]
impl Stage for Sleeping {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Documents, StageError> {
        self.log
            .push(format!("{}/{} start", ctx.pipeline(), ctx.phase()));
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = ctx.cancellation().cancelled() => return Err(StageError::Cancelled),
        }
        self.log.push(format!("{}/{} end", ctx.pipeline(), ctx.phase()));
        Ok(ctx.inputs().clone())
    }
}

/// Waits on a shared `tokio::sync::Barrier`; only completes once every
/// participant has arrived.
pub struct Rendezvous {
    barrier: Arc<tokio::sync::Barrier>,
}

impl Rendezvous {
    pub fn new(barrier: &Arc<tokio::sync::Barrier>) -> Self {
        Self {
            barrier: Arc::clone(barrier),
        }
    }
}

#[async_trait]
impl Stage for Rendezvous {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Documents, StageError> {
        self.barrier.wait().await;
        Ok(ctx.inputs().clone())
    }
}

/// Counts executions and disposals.
#[derive(Default)]
pub struct Counting {
    pub executed: AtomicUsize,
    pub disposed: AtomicUsize,
}

impl Counting {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn executions(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn disposals(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for Counting {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Documents, StageError> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(ctx.inputs().clone())
    }

    fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Contents of `documents`, in order.
pub fn contents(documents: &Documents) -> Vec<String> {
    documents.iter().map(|d| d.content().to_string()).collect()
}
