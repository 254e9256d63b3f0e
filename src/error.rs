//! SafeClaw Guard error types

use crate::correlation::CorrelationTag;
use crate::detection::Unavailable;
use thiserror::Error;

/// Details of a call refused because one of its segments scored as an injection.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockedCall {
    /// Tool method that was refused
    pub method: String,
    /// Rendered path of the triggering segment (e.g. `a.b[1]`)
    pub path: String,
    /// Text of the triggering segment
    pub text: String,
    /// Score assigned by the scorer
    pub score: f64,
    /// Correlation tag sent to the scoring service
    pub tag: CorrelationTag,
    /// Human-readable policy reason
    pub reason: String,
}

/// SafeClaw Guard error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Parameter structure could not be traversed
    #[error("Malformed input at '{path}': {reason}")]
    MalformedInput {
        /// Path of the node that failed the guard
        path: String,
        /// Why traversal stopped
        reason: String,
    },

    /// Scoring service unavailable and policy is fail-closed
    #[error("Detection unavailable: {0}")]
    DetectionUnavailable(Unavailable),

    /// Call refused by policy
    #[error("Injection blocked: {}", .0.reason)]
    InjectionBlocked(Box<BlockedCall>),

    /// Invocation cancelled by the caller
    #[error("Invocation cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Returns the blocked call details when this is a policy refusal.
    pub fn blocked(&self) -> Option<&BlockedCall> {
        match self {
            Error::InjectionBlocked(call) => Some(call),
            _ => None,
        }
    }
}

/// Result type alias for SafeClaw Guard operations
pub type Result<T> = std::result::Result<T, Error>;
