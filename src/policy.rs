//! Block/allow policy over the assessments of one invocation

use crate::config::ProxyConfig;
use crate::detection::Assessment;
use serde::{Deserialize, Serialize};

/// Policy outcome for an intercepted call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyOutcome {
    /// Forward the call to the target
    Allow,
    /// Refuse the call locally
    Block,
}

impl std::fmt::Display for PolicyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Block => write!(f, "block"),
        }
    }
}

/// Decision computed once per invocation
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    /// Allow or block
    pub outcome: PolicyOutcome,
    /// Assessment at or above threshold with the highest effective score.
    ///
    /// Present whenever a segment crossed the threshold, including when
    /// blocking is disabled and the outcome is `Allow`.
    pub triggering: Option<Assessment>,
    /// Highest effective score across all assessments
    pub highest_score: Option<f64>,
    /// Human-readable explanation
    pub reason: String,
}

impl PolicyDecision {
    /// Whether the call is refused
    pub fn is_blocked(&self) -> bool {
        self.outcome == PolicyOutcome::Block
    }
}

/// Decides ALLOW or BLOCK from the assessments of one invocation.
///
/// Pure: holds only the thresholds copied from [`ProxyConfig`].
#[derive(Debug, Clone, Copy)]
pub struct PolicyEngine {
    threshold: f64,
    block_injections: bool,
    fail_open: bool,
}

impl PolicyEngine {
    /// Create an engine from the proxy configuration
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            threshold: config.threshold,
            block_injections: config.block_injections,
            fail_open: config.fail_open,
        }
    }

    /// Configured threshold
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Effective score of an assessment under this engine's fail-open setting
    pub fn effective_score(&self, assessment: &Assessment) -> f64 {
        assessment.effective_score(self.fail_open)
    }

    /// Decide for the assessments of one invocation, in extraction order.
    ///
    /// The triggering assessment is the scored detection with the highest
    /// score at or above the threshold; on ties the earliest wins. A segment
    /// that could not be scored triggers only when no scored segment reached
    /// the threshold and the engine fails closed.
    pub fn decide(&self, assessments: &[Assessment]) -> PolicyDecision {
        let mut highest: Option<f64> = None;
        let mut detection: Option<(&Assessment, f64)> = None;
        let mut unscored: Option<(&Assessment, f64)> = None;

        for assessment in assessments {
            let score = self.effective_score(assessment);
            highest = Some(highest.map_or(score, |h| h.max(score)));

            if score < self.threshold {
                continue;
            }
            match assessment {
                Assessment::Scored(_) => {
                    if detection.map_or(true, |(_, best)| score > best) {
                        detection = Some((assessment, score));
                    }
                }
                Assessment::Unavailable { .. } => {
                    unscored.get_or_insert((assessment, score));
                }
            }
        }

        let triggering = detection.or(unscored);

        let outcome = if triggering.is_some() && self.block_injections {
            PolicyOutcome::Block
        } else {
            PolicyOutcome::Allow
        };

        let reason = match triggering {
            Some((assessment, score)) => self.describe(assessment, score, highest),
            None => match highest {
                Some(h) => format!(
                    "No segment reached threshold {:.2} (highest score: {:.2})",
                    self.threshold, h
                ),
                None => "No text segments to score".to_string(),
            },
        };

        PolicyDecision {
            outcome,
            triggering: triggering.map(|(assessment, _)| assessment.clone()),
            highest_score: highest,
            reason,
        }
    }

    fn describe(&self, assessment: &Assessment, score: f64, highest: Option<f64>) -> String {
        let base = match assessment {
            Assessment::Scored(result) => format!(
                "Prompt injection detected at '{}' (score: {:.2} >= threshold {:.2}): \"{}\"",
                result.segment.path, score, self.threshold, result.segment.text
            ),
            Assessment::Unavailable { segment, reason } => format!(
                "Scoring unavailable for '{}' ({}); failing closed",
                segment.path, reason
            ),
        };

        if self.block_injections {
            base
        } else {
            format!(
                "{}; blocking disabled, call allowed (highest score: {:.2})",
                base,
                highest.unwrap_or(score)
            )
        }
    }
}
