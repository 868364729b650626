//! Progress and completion notifications
//!
//! Observers are registered per transfer code and called from whichever task
//! drives the event, outside any registry lock. Several observers may watch
//! the same code; all of them are released once the code reaches a terminal
//! state.

use std::sync::Arc;

use tokio::time::Instant;

use super::SessionStatus;

/// Relay-side progress for one transfer code
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub transfer_code: String,
    /// Fraction of the announced file size forwarded, in `[0.0, 1.0]`
    pub progress: f64,
    pub bytes_transferred: u64,
}

/// Terminal outcome for one transfer code (emitted exactly once)
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionEvent {
    pub transfer_code: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub status: SessionStatus,
}

pub type ProgressObserver = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;
pub type CompletionObserver = Arc<dyn Fn(&CompletionEvent) + Send + Sync>;

/// Observers registered for one code
pub(crate) struct ObserverList<T> {
    pub(crate) since: Instant,
    pub(crate) observers: Vec<T>,
}

impl<T: Clone> ObserverList<T> {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            since: now,
            observers: Vec::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<T> {
        self.observers.clone()
    }
}
