//! Error types for the receive pipeline.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Exception type recorded for messages whose body could not be parsed.
pub const DESERIALIZATION_ERROR_TYPE: &str = "recoverability::MessageDeserializationError";

/// Exception type recorded for failed outbound dispatches.
pub const DISPATCH_ERROR_TYPE: &str = "recoverability::DispatchError";

/// Error categories determine how the recoverability stages react.
///
/// # Categories
///
/// - **Deserialization**: poison message, skips both retry tiers
/// - **Handler**: general failure, eligible for immediate and delayed retries
/// - **Dispatch**: an outbound send failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The body could not be turned into a logical message.
    Deserialization,

    /// Failure raised while invoking a handler stage.
    Handler,

    /// Dispatching an outgoing message failed.
    Dispatch,
}

impl ErrorCategory {
    /// Whether a retry could possibly change the outcome.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::Deserialization)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Deserialization => write!(f, "deserialization"),
            ErrorCategory::Handler => write!(f, "handler"),
            ErrorCategory::Dispatch => write!(f, "dispatch"),
        }
    }
}

/// A failure raised by user code, shared between clones.
///
/// Cloning keeps the same underlying report, so the failure that lands in
/// the error queue is the one the handler produced.
#[derive(Clone)]
pub struct HandlerFailure {
    exception_type: String,
    source_stage: Option<String>,
    report: Arc<eyre::Report>,
}

impl HandlerFailure {
    /// Type name of the error the handler returned.
    pub fn exception_type(&self) -> &str {
        &self.exception_type
    }

    /// Name of the stage that raised the failure, once known.
    pub fn source_stage(&self) -> Option<&str> {
        self.source_stage.as_deref()
    }

    /// The underlying report.
    pub fn report(&self) -> &eyre::Report {
        &self.report
    }
}

impl fmt::Debug for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFailure")
            .field("exception_type", &self.exception_type)
            .field("source_stage", &self.source_stage)
            .field("message", &self.report.to_string())
            .finish()
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.report)
    }
}

/// Error that can flow through the receive pipeline.
///
/// Every variant is cheap to clone so the same failure can be recorded in
/// [`FailureInfoStorage`](crate::FailureInfoStorage), carried by
/// notifications and finally re-raised to the caller.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// The message body could not be deserialized
    #[error("failed to deserialize message '{message_id}': {reason}")]
    Deserialization { message_id: String, reason: String },

    /// A handler stage failed
    #[error("{0}")]
    Handler(HandlerFailure),

    /// An outbound dispatch failed
    #[error("failed to dispatch message '{message_id}' to '{destination}': {reason}")]
    Dispatch {
        message_id: String,
        destination: String,
        reason: String,
    },
}

impl PipelineError {
    /// Wrap a typed handler error, remembering its type name.
    pub fn handler<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Handler(HandlerFailure {
            exception_type: type_name::<E>().to_string(),
            source_stage: None,
            report: Arc::new(eyre::Report::new(error)),
        })
    }

    /// Wrap an `eyre::Report` produced by handler code.
    pub fn from_report(report: eyre::Report) -> Self {
        Self::Handler(HandlerFailure {
            exception_type: type_name::<eyre::Report>().to_string(),
            source_stage: None,
            report: Arc::new(report),
        })
    }

    /// Handler failure carrying only a message.
    pub fn handler_message(message: impl Into<String>) -> Self {
        Self::from_report(eyre::Report::msg(message.into()))
    }

    /// Create a deserialization error.
    pub fn deserialization(message_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Deserialization {
            message_id: message_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a dispatch error.
    pub fn dispatch(
        message_id: impl Into<String>,
        destination: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Dispatch {
            message_id: message_id.into(),
            destination: destination.into(),
            reason: reason.into(),
        }
    }

    /// Attach the failing stage name to a handler failure.
    ///
    /// The first stage to claim the failure wins.
    pub fn with_source_stage(mut self, stage: &str) -> Self {
        if let Self::Handler(failure) = &mut self {
            if failure.source_stage.is_none() {
                failure.source_stage = Some(stage.to_string());
            }
        }
        self
    }

    /// Get the category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Deserialization { .. } => ErrorCategory::Deserialization,
            Self::Handler(_) => ErrorCategory::Handler,
            Self::Dispatch { .. } => ErrorCategory::Dispatch,
        }
    }

    /// Poison messages are never retried.
    pub fn is_deserialization(&self) -> bool {
        self.category() == ErrorCategory::Deserialization
    }

    /// Value for the exception type header.
    pub fn exception_type(&self) -> &str {
        match self {
            Self::Deserialization { .. } => DESERIALIZATION_ERROR_TYPE,
            Self::Handler(failure) => failure.exception_type(),
            Self::Dispatch { .. } => DISPATCH_ERROR_TYPE,
        }
    }

    /// Name of the stage that raised a handler failure.
    pub fn source_stage(&self) -> Option<&str> {
        match self {
            Self::Handler(failure) => failure.source_stage(),
            _ => None,
        }
    }

    /// Full diagnostic rendering, including the cause chain for handler failures.
    pub fn stack_trace(&self) -> String {
        match self {
            Self::Handler(failure) => format!("{:?}", failure.report()),
            other => other.to_string(),
        }
    }

    /// Whether two errors are clones of the same original failure.
    pub fn is_same_failure(&self, other: &PipelineError) -> bool {
        match (self, other) {
            (Self::Handler(a), Self::Handler(b)) => Arc::ptr_eq(&a.report, &b.report),
            (a, b) => a.category() == b.category() && a.to_string() == b.to_string(),
        }
    }
}

impl From<eyre::Report> for PipelineError {
    fn from(report: eyre::Report) -> Self {
        Self::from_report(report)
    }
}
