//! Text extraction from tool-call parameters
//!
//! Walks an arbitrary parameter tree and yields every string leaf together
//! with the path that locates it. Traversal is a deterministic pre-order:
//! object keys in insertion order, array elements in index order.
//!
//! The walk uses an explicit stack so hostile nesting cannot exhaust the
//! native call stack. Nodes deeper than the configured limit end the
//! iteration with [`Error::MalformedInput`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Default nesting limit
pub const DEFAULT_MAX_DEPTH: usize = 50;

/// One step in a parameter path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathElement {
    /// Object key
    Key(String),
    /// Array index
    Index(usize),
}

/// Location of a leaf inside the parameter tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentPath(Vec<PathElement>);

impl SegmentPath {
    /// Path of the root node
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Path elements from the root down
    pub fn elements(&self) -> &[PathElement] {
        &self.0
    }

    /// Number of steps from the root
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    fn child(&self, element: PathElement) -> Self {
        let mut elements = Vec::with_capacity(self.0.len() + 1);
        elements.extend_from_slice(&self.0);
        elements.push(element);
        Self(elements)
    }
}

impl From<Vec<PathElement>> for SegmentPath {
    fn from(elements: Vec<PathElement>) -> Self {
        Self(elements)
    }
}

impl fmt::Display for SegmentPath {
    /// Renders as `a.b[1]`; the root renders as `$`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("$");
        }
        for (i, element) in self.0.iter().enumerate() {
            match element {
                PathElement::Key(key) if i == 0 => write!(f, "{}", key)?,
                PathElement::Key(key) => write!(f, ".{}", key)?,
                PathElement::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}

/// A text-bearing leaf of the parameter tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSegment {
    /// Where the text was found
    pub path: SegmentPath,
    /// The text itself
    pub text: String,
}

/// Extracts text segments from parameter trees.
#[derive(Debug, Clone, Copy)]
pub struct ContentExtractor {
    max_depth: usize,
}

impl Default for ContentExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl ContentExtractor {
    /// Create an extractor with the given nesting limit.
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Nesting limit
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Lazily iterate the string leaves of `params`.
    pub fn extract<'a>(&self, params: &'a Value) -> Segments<'a> {
        Segments {
            stack: vec![(SegmentPath::root(), params)],
            max_depth: self.max_depth,
        }
    }

    /// Collect all segments, failing on the first malformed node.
    pub fn extract_all(&self, params: &Value) -> Result<Vec<TextSegment>> {
        self.extract(params).collect()
    }
}

/// Single-pass iterator over the text segments of one parameter tree.
///
/// Yields at most one error, after which it is exhausted.
pub struct Segments<'a> {
    stack: Vec<(SegmentPath, &'a Value)>,
    max_depth: usize,
}

impl<'a> Iterator for Segments<'a> {
    type Item = Result<TextSegment>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((path, value)) = self.stack.pop() {
            if path.depth() > self.max_depth {
                self.stack.clear();
                return Some(Err(Error::MalformedInput {
                    path: path.to_string(),
                    reason: format!("nesting exceeds maximum depth of {}", self.max_depth),
                }));
            }

            match value {
                Value::String(text) => {
                    return Some(Ok(TextSegment {
                        path,
                        text: text.clone(),
                    }));
                }
                Value::Object(map) => {
                    // Reverse push keeps pre-order on pop
                    for (key, child) in map.iter().rev() {
                        self.stack
                            .push((path.child(PathElement::Key(key.clone())), child));
                    }
                }
                Value::Array(items) => {
                    for (index, child) in items.iter().enumerate().rev() {
                        self.stack.push((path.child(PathElement::Index(index)), child));
                    }
                }
                Value::Null | Value::Bool(_) | Value::Number(_) => {}
            }
        }
        None
    }
}
