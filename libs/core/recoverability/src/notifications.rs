//! Recoverability events for monitoring and legacy adapters.

use crate::error::PipelineError;
use crate::message::IncomingMessage;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Event raised by the recoverability stages.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A failed message will be attempted again.
    MessageToBeRetried {
        /// Number of the retry about to run (1-based).
        attempt: u32,
        /// Zero for immediate retries.
        delay: Duration,
        message: IncomingMessage,
        error: PipelineError,
        /// True for in-process retries, false for delayed redelivery.
        immediate: bool,
    },

    /// A message was moved to the error queue.
    MessageFaulted {
        message: IncomingMessage,
        error: PipelineError,
    },
}

impl Notification {
    pub fn message(&self) -> &IncomingMessage {
        match self {
            Notification::MessageToBeRetried { message, .. } => message,
            Notification::MessageFaulted { message, .. } => message,
        }
    }

    pub fn error(&self) -> &PipelineError {
        match self {
            Notification::MessageToBeRetried { error, .. } => error,
            Notification::MessageFaulted { error, .. } => error,
        }
    }

    /// Event name used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::MessageToBeRetried { immediate: true, .. } => "immediate_retry",
            Notification::MessageToBeRetried { immediate: false, .. } => "delayed_retry",
            Notification::MessageFaulted { .. } => "message_faulted",
        }
    }
}

type Subscriber = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Cloneable event bus. Clones share subscribers.
#[derive(Clone, Default)]
pub struct Notifications {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked synchronously for every raised event.
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.push(Arc::new(subscriber));
    }

    pub fn raise(&self, notification: Notification) {
        // Snapshot so callbacks may subscribe without deadlocking.
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for subscriber in subscribers {
            subscriber(&notification);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl fmt::Debug for Notifications {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifications")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
