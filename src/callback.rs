//! Detection observer dispatch
//!
//! At most one observer per proxy. It is called synchronously, in-line with
//! the decision, exactly once per triggering detection. Observer errors and
//! panics are contained here: they are logged and never reach the caller or
//! alter the decision.

use crate::correlation::CorrelationTag;
use crate::policy::PolicyOutcome;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Error type observers may return
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// A detection reported to the observer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionEvent {
    /// Tool method of the intercepted call
    pub method: String,
    /// Text of the triggering segment
    pub text: String,
    /// Rendered path of the triggering segment
    pub path: String,
    /// Score of the triggering segment
    pub score: f64,
    /// Correlation tag of the call
    pub tag: CorrelationTag,
    /// What the proxy did with the call
    pub outcome: PolicyOutcome,
    /// When the decision was made
    pub timestamp: DateTime<Utc>,
}

/// Receives detection events.
pub trait DetectionObserver: Send + Sync {
    /// Handle one detection.
    fn on_detection(&self, event: &DetectionEvent) -> Result<(), CallbackError>;
}

impl<F> DetectionObserver for F
where
    F: Fn(&DetectionEvent) -> Result<(), CallbackError> + Send + Sync,
{
    fn on_detection(&self, event: &DetectionEvent) -> Result<(), CallbackError> {
        self(event)
    }
}

/// Result of a dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// No observer registered
    NoObserver,
    /// Observer returned Ok
    Delivered,
    /// Observer returned an error or panicked
    Failed,
}

/// Single-slot observer holder
#[derive(Clone, Default)]
pub struct CallbackDispatcher {
    observer: Option<Arc<dyn DetectionObserver>>,
}

impl CallbackDispatcher {
    /// Create a dispatcher with an optional observer.
    pub fn new(observer: Option<Arc<dyn DetectionObserver>>) -> Self {
        Self { observer }
    }

    /// Whether an observer is registered
    pub fn has_observer(&self) -> bool {
        self.observer.is_some()
    }

    /// Deliver `event` to the observer, isolating its failures.
    pub fn notify(&self, event: &DetectionEvent) -> DispatchStatus {
        let Some(observer) = &self.observer else {
            return DispatchStatus::NoObserver;
        };

        match catch_unwind(AssertUnwindSafe(|| observer.on_detection(event))) {
            Ok(Ok(())) => DispatchStatus::Delivered,
            Ok(Err(e)) => {
                tracing::error!(
                    tag = %event.tag,
                    method = %event.method,
                    error = %e,
                    "Detection observer failed"
                );
                DispatchStatus::Failed
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(
                    tag = %event.tag,
                    method = %event.method,
                    panic = %message,
                    "Detection observer panicked"
                );
                DispatchStatus::Failed
            }
        }
    }
}

impl std::fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDispatcher")
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
