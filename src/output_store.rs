use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;

use crate::document::Documents;

/// Run-scoped map from pipeline name to that pipeline's Process output.
///
/// Cloning the store clones a handle; all clones see the same entries.
/// Keys are case-insensitive. Each non-isolated pipeline writes its entry
/// exactly once per run, so plain insert-or-replace is all the
/// synchronization needed.
#[derive(Clone, Default)]
pub struct OutputStore {
    entries: Arc<DashMap<String, Documents>>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Insert or replace the documents published by `pipeline`.
    pub fn insert(&self, pipeline: &str, documents: Documents) {
        self.entries.insert(key(pipeline), documents);
    }

    /// Documents published by `pipeline`, or `None` if it has not run yet
    /// in this execution (or never publishes, e.g. isolated pipelines).
    pub fn get(&self, pipeline: &str) -> Option<Documents> {
        self.entries.get(&key(pipeline)).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, pipeline: &str) -> bool {
        self.entries.contains_key(&key(pipeline))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of every pipeline with an entry, sorted.
    pub fn pipelines(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// An ordered point-in-time copy of the store.
    pub fn snapshot(&self) -> IndexMap<String, Documents> {
        let mut copy: IndexMap<String, Documents> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        copy.sort_keys();
        copy
    }
}

impl std::fmt::Debug for OutputStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.snapshot().iter().map(|(k, v)| (k.clone(), v.len())))
            .finish()
    }
}

fn key(pipeline: &str) -> String {
    pipeline.to_lowercase()
}
