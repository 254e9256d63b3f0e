//! SafeClaw Guard - Prompt Injection Interception for Tool Calls
//!
//! SafeClaw Guard sits between an agent and the tools it calls. Every text
//! value in an outgoing call's parameters is scored for prompt injection
//! before the call reaches the tool; calls that score at or above the
//! configured threshold are refused locally and never forwarded.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Agent / Host                             │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ invoke(method, params)
//! ┌───────────────────────────────▼──────────────────────────────────┐
//! │                         SecurityProxy                             │
//! │  ┌────────────────────┐   ┌───────────────────────────────────┐  │
//! │  │ ContentExtractor   │──▶│ Scorer                            │  │
//! │  │ - string leaves    │   │ - DetectionGateway (remote HTTP)  │  │
//! │  │ - pre-order paths  │   │ - PatternScorer (offline)         │  │
//! │  │ - depth guard      │   │ - FallbackScorer (chain)          │  │
//! │  └────────────────────┘   └─────────────────┬─────────────────┘  │
//! │  ┌────────────────────┐   ┌─────────────────▼─────────────────┐  │
//! │  │ CorrelationTagger  │   │ PolicyEngine                      │  │
//! │  │ - per call/session │   │ - threshold, fail open/closed     │  │
//! │  └────────────────────┘   └─────────────────┬─────────────────┘  │
//! │                           ┌─────────────────▼─────────────────┐  │
//! │                           │ CallbackDispatcher                │  │
//! │                           └─────────────────┬─────────────────┘  │
//! └─────────────────────────────────────────────┼────────────────────┘
//!                          allow: forward       │      block: Error
//! ┌─────────────────────────────────────────────▼────────────────────┐
//! │                        ToolTarget (tool server)                   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`proxy`]: The interception proxy and the [`ToolTarget`] seam
//! - [`extract`]: Text segment extraction from parameter trees
//! - [`detection`]: Scorers and the remote detection gateway
//! - [`policy`]: Block/allow decisions
//! - [`callback`]: Detection observer dispatch
//! - [`correlation`]: Correlation tags
//! - [`config`]: Configuration management

pub mod callback;
pub mod config;
pub mod correlation;
pub mod detection;
pub mod error;
pub mod extract;
pub mod policy;
pub mod proxy;

pub use callback::{CallbackError, DetectionEvent, DetectionObserver};
pub use config::{GuardConfig, ProxyConfig, ScoringConfig};
pub use correlation::{CorrelationTag, CorrelationTagger, TagScope};
pub use detection::{
    Assessment, DetectionGateway, DetectionResult, FallbackScorer, Label, PatternScorer, Score,
    Scorer, Unavailable,
};
pub use error::{BlockedCall, Error, Result};
pub use extract::{ContentExtractor, PathElement, SegmentPath, TextSegment};
pub use policy::{PolicyDecision, PolicyEngine, PolicyOutcome};
pub use proxy::{InvokeError, ScreeningStats, SecurityProxy, SecurityProxyBuilder, ToolTarget};
