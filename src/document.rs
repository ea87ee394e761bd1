use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An immutable document: content plus ordered key/value metadata.
///
/// Documents are never mutated in place. Stages derive new documents with
/// [`Document::with_content`] / [`Document::with_metadata`] or pass the
/// existing `Arc<Document>` through untouched.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Document {
    content: String,
    metadata: IndexMap<String, Value>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: IndexMap::new(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn metadata(&self) -> &IndexMap<String, Value> {
        &self.metadata
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Metadata value as a string slice, if present and a JSON string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Clone this document with new content. Metadata is carried over.
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: self.metadata.clone(),
        }
    }

    /// Clone this document with one metadata key set (or replaced).
    pub fn with_metadata(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.insert(key.into(), value.into());
        Self {
            content: self.content.clone(),
            metadata,
        }
    }
}

/// An immutable, cheaply cloneable sequence of documents.
///
/// Cloning a `Documents` shares the underlying list; [`Documents::ptr_eq`]
/// tells whether two values are the very same sequence (used to observe
/// pass-through).
#[derive(Clone, Default)]
pub struct Documents(Arc<Vec<Arc<Document>>>);

impl Documents {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Document>> {
        self.0.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Document>> {
        self.0.get(index)
    }

    pub fn as_slice(&self) -> &[Arc<Document>] {
        &self.0
    }

    /// True when both values share the same underlying list.
    pub fn ptr_eq(&self, other: &Documents) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// A new sequence holding `self` followed by `other`.
    pub fn concat(&self, other: &Documents) -> Documents {
        self.iter().chain(other.iter()).cloned().collect()
    }
}

impl fmt::Debug for Documents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl PartialEq for Documents {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0 == other.0
    }
}

impl From<Vec<Arc<Document>>> for Documents {
    fn from(docs: Vec<Arc<Document>>) -> Self {
        Self(Arc::new(docs))
    }
}

impl From<Vec<Document>> for Documents {
    fn from(docs: Vec<Document>) -> Self {
        docs.into_iter().map(Arc::new).collect()
    }
}

impl FromIterator<Arc<Document>> for Documents {
    fn from_iter<I: IntoIterator<Item = Arc<Document>>>(iter: I) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl FromIterator<Document> for Documents {
    fn from_iter<I: IntoIterator<Item = Document>>(iter: I) -> Self {
        iter.into_iter().map(Arc::new).collect()
    }
}

impl<'a> IntoIterator for &'a Documents {
    type Item = &'a Arc<Document>;
    type IntoIter = std::slice::Iter<'a, Arc<Document>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
