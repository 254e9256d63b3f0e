//! Detection result types shared by scorers and the policy engine

use crate::extract::TextSegment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Classification of a scored segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    /// Below the suspect threshold
    Clean,
    /// Between the suspect threshold and the injection threshold
    Suspect,
    /// At or above the injection threshold
    Injection,
}

impl Label {
    /// Label a score against the configured thresholds.
    pub fn classify(score: f64, threshold: f64, suspect_threshold: f64) -> Self {
        if score >= threshold {
            Label::Injection
        } else if score >= suspect_threshold {
            Label::Suspect
        } else {
            Label::Clean
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clean => write!(f, "clean"),
            Self::Suspect => write!(f, "suspect"),
            Self::Injection => write!(f, "injection"),
        }
    }
}

/// Raw output of a scorer for one piece of text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    /// Prompt injection score in [0, 1]
    pub value: f64,
    /// Every named score the scorer reported
    pub breakdown: BTreeMap<String, f64>,
    /// Unparsed scorer response
    pub raw: serde_json::Value,
}

impl Score {
    /// A bare score with no breakdown.
    pub fn new(value: f64) -> Self {
        Self {
            value,
            breakdown: BTreeMap::new(),
            raw: serde_json::Value::Null,
        }
    }
}

/// Why a scorer could not produce a score.
///
/// Distinct from a clean result so policy can apply fail-open or fail-closed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Unavailable {
    /// Connection or transport failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// No response within the per-attempt timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Non-success HTTP status
    #[error("scoring service returned HTTP {status}")]
    Status {
        /// HTTP status code
        status: u16,
    },

    /// Response could not be interpreted as a score
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Scorer chain has nothing to ask
    #[error("no scorer configured")]
    NoScorer,
}

impl Unavailable {
    /// Whether one more attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Unavailable::Transport(_) | Unavailable::Timeout(_) => true,
            Unavailable::Status { status } => *status >= 500,
            Unavailable::Malformed(_) | Unavailable::NoScorer => false,
        }
    }
}

/// A scored segment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    /// The segment that was scored
    pub segment: TextSegment,
    /// Prompt injection score in [0, 1]
    pub score: f64,
    /// Label derived from the thresholds
    pub label: Label,
    /// Named scores reported alongside the main one
    pub breakdown: BTreeMap<String, f64>,
    /// Unparsed scorer response
    pub raw_response: serde_json::Value,
}

impl DetectionResult {
    /// Attach a scorer output to its segment.
    pub fn new(segment: TextSegment, score: Score, threshold: f64, suspect_threshold: f64) -> Self {
        Self {
            label: Label::classify(score.value, threshold, suspect_threshold),
            segment,
            score: score.value,
            breakdown: score.breakdown,
            raw_response: score.raw,
        }
    }
}

/// Outcome of scoring one segment
#[derive(Debug, Clone, PartialEq)]
pub enum Assessment {
    /// The scorer returned a score
    Scored(DetectionResult),
    /// The scorer could not be reached or understood
    Unavailable {
        /// The segment that could not be scored
        segment: TextSegment,
        /// Why scoring failed
        reason: Unavailable,
    },
}

impl Assessment {
    /// The segment this assessment is about
    pub fn segment(&self) -> &TextSegment {
        match self {
            Assessment::Scored(result) => &result.segment,
            Assessment::Unavailable { segment, .. } => segment,
        }
    }

    /// Score used by policy: unavailable counts as 0.0 when failing open, 1.0 when failing closed.
    pub fn effective_score(&self, fail_open: bool) -> f64 {
        match self {
            Assessment::Scored(result) => result.score,
            Assessment::Unavailable { .. } if fail_open => 0.0,
            Assessment::Unavailable { .. } => 1.0,
        }
    }

    /// The detection result, if scored
    pub fn as_scored(&self) -> Option<&DetectionResult> {
        match self {
            Assessment::Scored(result) => Some(result),
            Assessment::Unavailable { .. } => None,
        }
    }
}
