//! Correlation tags linking related security events.
//!
//! Every segment scored for one intercepted call carries the same tag, and in
//! session scope every call handled by one proxy carries the same tag, so a
//! reviewer can group events on the scoring service dashboard.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque correlation identifier.
///
/// Other components pass it through verbatim and never inspect its contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationTag(String);

impl CorrelationTag {
    /// Wrap an externally supplied identifier.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh random tag.
    pub fn generate() -> Self {
        Self(format!("guard-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow the tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifetime of a correlation tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TagScope {
    /// A new tag for every intercepted call
    PerCall,
    /// One tag for the lifetime of the proxy
    #[default]
    PerSession,
}

/// Hands out correlation tags according to a [`TagScope`].
#[derive(Debug, Clone)]
pub struct CorrelationTagger {
    scope: TagScope,
    session_tag: Option<CorrelationTag>,
}

impl CorrelationTagger {
    /// Create a tagger; in session scope the tag is generated here, once.
    pub fn new(scope: TagScope) -> Self {
        let session_tag = match scope {
            TagScope::PerSession => Some(CorrelationTag::generate()),
            TagScope::PerCall => None,
        };
        Self { scope, session_tag }
    }

    /// Session-scoped tagger reusing a tag owned by an outer session.
    pub fn with_session_tag(tag: CorrelationTag) -> Self {
        Self {
            scope: TagScope::PerSession,
            session_tag: Some(tag),
        }
    }

    /// Configured scope
    pub fn scope(&self) -> TagScope {
        self.scope
    }

    /// Session tag, if session scoped
    pub fn session_tag(&self) -> Option<&CorrelationTag> {
        self.session_tag.as_ref()
    }

    /// Tag to use for the next intercepted call.
    pub fn tag_for_call(&self) -> CorrelationTag {
        match &self.session_tag {
            Some(tag) => tag.clone(),
            None => CorrelationTag::generate(),
        }
    }
}

impl Default for CorrelationTagger {
    fn default() -> Self {
        Self::new(TagScope::default())
    }
}
