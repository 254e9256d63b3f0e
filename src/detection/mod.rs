//! Prompt injection scoring
//!
//! Defines the `Scorer` trait the proxy scores segments through, and its
//! implementations:
//! - [`DetectionGateway`]: remote scoring service over HTTP
//! - [`PatternScorer`]: offline phrase and encoded-payload heuristics
//! - [`FallbackScorer`]: chains scorers, first score wins
//!
//! ## Architecture
//!
//! ```text
//! segment text → [DetectionGateway] ──unavailable──→ [PatternScorer] → Score
//!                        ↓                                   ↓
//!                      Score                            Unavailable (last reason)
//! ```
//!
//! A scorer never substitutes a score for a failure: transport errors,
//! timeouts and malformed responses surface as [`Unavailable`].

pub mod gateway;
pub mod pattern;
pub mod types;

pub use gateway::{parse_analysis, DetectionGateway, HttpTransport, ScoringTransport, TransportResponse};
pub use pattern::{InjectionCategory, PatternScorer};
pub use types::{Assessment, DetectionResult, Label, Score, Unavailable};

use crate::correlation::CorrelationTag;
use async_trait::async_trait;
use std::sync::Arc;

/// Pluggable prompt injection scorer.
#[async_trait]
pub trait Scorer: Send + Sync {
    /// Score `text`, passing `tag` through to any remote record.
    async fn score(&self, text: &str, tag: &CorrelationTag) -> Result<Score, Unavailable>;

    /// Human-readable name for this scorer (used in logs).
    fn name(&self) -> &str;
}

#[async_trait]
impl<S: Scorer + ?Sized> Scorer for Arc<S> {
    async fn score(&self, text: &str, tag: &CorrelationTag) -> Result<Score, Unavailable> {
        (**self).score(text, tag).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Scorer chain: asks each scorer in order until one returns a score.
///
/// If every scorer is unavailable the last reason is returned, so the
/// caller's fail-open/fail-closed policy still applies.
pub struct FallbackScorer {
    scorers: Vec<Box<dyn Scorer>>,
}

impl FallbackScorer {
    /// Create a chain; scorers are tried in the given order.
    pub fn new(scorers: Vec<Box<dyn Scorer>>) -> Self {
        Self { scorers }
    }
}

#[async_trait]
impl Scorer for FallbackScorer {
    async fn score(&self, text: &str, tag: &CorrelationTag) -> Result<Score, Unavailable> {
        let mut last = Unavailable::NoScorer;
        for scorer in &self.scorers {
            match scorer.score(text, tag).await {
                Ok(score) => return Ok(score),
                Err(reason) => {
                    tracing::warn!(
                        scorer = scorer.name(),
                        tag = %tag,
                        error = %reason,
                        "Scorer unavailable, trying next"
                    );
                    last = reason;
                }
            }
        }
        Err(last)
    }

    fn name(&self) -> &str {
        "fallback"
    }
}
