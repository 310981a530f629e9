//! Process-level escalation for failures the pipeline cannot recover from.

use crate::error::PipelineError;
use crate::metrics;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::error;

type CriticalErrorAction = Arc<dyn Fn(&str, &PipelineError) + Send + Sync>;

/// Reporter for critical errors such as losing the ability to reach the
/// error queue.
///
/// The host decides what to do (stop the endpoint, restart the process);
/// the pipeline only reports. Clones share the action and the counter.
#[derive(Clone, Default)]
pub struct CriticalError {
    action: Option<CriticalErrorAction>,
    raised: Arc<AtomicUsize>,
}

impl CriticalError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` every time a critical error is raised.
    pub fn with_action<F>(action: F) -> Self
    where
        F: Fn(&str, &PipelineError) + Send + Sync + 'static,
    {
        Self {
            action: Some(Arc::new(action)),
            raised: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn raise(&self, message: &str, error: &PipelineError) {
        self.raised.fetch_add(1, Ordering::SeqCst);
        metrics::record_critical_error();

        error!(
            error = %error,
            category = %error.category(),
            "{}", message
        );

        if let Some(action) = &self.action {
            action(message, error);
        }
    }

    /// How many times `raise` was called.
    pub fn times_raised(&self) -> usize {
        self.raised.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for CriticalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalError")
            .field("has_action", &self.action.is_some())
            .field("raised", &self.times_raised())
            .finish()
    }
}
