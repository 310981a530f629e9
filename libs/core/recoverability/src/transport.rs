//! In-memory transport for local runs and tests.
//!
//! Queues live in the process; delayed delivery is a spawned sleep.

use crate::dispatch::{DeliveryConstraint, Dispatcher, TransportOperation};
use crate::error::PipelineError;
use crate::message::{IncomingMessage, OutgoingMessage};
use crate::worker::MessageSource;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct QueueState {
    messages: Mutex<VecDeque<IncomingMessage>>,
    arrived: Notify,
    completed: AtomicUsize,
}

impl QueueState {
    fn push(&self, message: IncomingMessage) {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(message);
        self.arrived.notify_one();
    }

    fn pop(&self) -> Option<IncomingMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    fn snapshot(&self) -> Vec<IncomingMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Set of named FIFO queues. Clones share the same queues.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    queues: Arc<DashMap<String, Arc<QueueState>>>,
    unavailable: Arc<DashSet<String>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, address: &str) -> Arc<QueueState> {
        Arc::clone(
            self.queues
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(QueueState::default()))
                .value(),
        )
    }

    /// Receiving side of `address`.
    pub fn queue(&self, address: &str) -> InMemoryQueue {
        InMemoryQueue {
            address: address.to_string(),
            state: self.state(address),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Enqueue a message without delay.
    pub fn send(&self, address: &str, message: OutgoingMessage) {
        self.state(address).push(message.into_incoming());
    }

    /// Messages currently waiting in `address`.
    pub fn messages(&self, address: &str) -> Vec<IncomingMessage> {
        self.state(address).snapshot()
    }

    pub fn len(&self, address: &str) -> usize {
        self.state(address)
            .messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Messages completed by receivers of `address`.
    pub fn completed(&self, address: &str) -> usize {
        self.state(address).completed.load(Ordering::SeqCst)
    }

    /// Make dispatches to `address` fail (or succeed again).
    pub fn set_unavailable(&self, address: &str, unavailable: bool) {
        if unavailable {
            self.unavailable.insert(address.to_string());
        } else {
            self.unavailable.remove(address);
        }
    }
}

fn delivery_delay(constraints: &[DeliveryConstraint]) -> Duration {
    constraints
        .iter()
        .map(|constraint| match constraint {
            DeliveryConstraint::DelayDeliveryWith(delay) => *delay,
        })
        .max()
        .unwrap_or(Duration::ZERO)
}

#[async_trait]
impl Dispatcher for InMemoryTransport {
    async fn dispatch(&self, operation: TransportOperation) -> Result<(), PipelineError> {
        let TransportOperation {
            message,
            destination,
            constraints,
        } = operation;

        if self.unavailable.contains(&destination) {
            return Err(PipelineError::dispatch(
                message.message_id,
                destination,
                "queue unavailable",
            ));
        }

        let state = self.state(&destination);
        let delay = delivery_delay(&constraints);

        if delay.is_zero() {
            trace!(message_id = %message.message_id, destination = %destination, "Enqueued");
            state.push(message.into_incoming());
        } else {
            debug!(
                message_id = %message.message_id,
                destination = %destination,
                delay_ms = delay.as_millis() as u64,
                "Delivery delayed"
            );
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                state.push(message.into_incoming());
            });
        }

        Ok(())
    }
}

/// Receiving handle for one in-memory queue.
#[derive(Debug, Clone)]
pub struct InMemoryQueue {
    address: String,
    state: Arc<QueueState>,
    poll_interval: Duration,
}

impl InMemoryQueue {
    /// How long `receive` waits for a message before returning `None`.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl MessageSource for InMemoryQueue {
    async fn receive(&self) -> Result<Option<IncomingMessage>, PipelineError> {
        if let Some(message) = self.state.pop() {
            return Ok(Some(message));
        }

        tokio::select! {
            _ = self.state.arrived.notified() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }

        Ok(self.state.pop())
    }

    async fn complete(&self, _message_id: String) -> Result<(), PipelineError> {
        self.state.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abandon(&self, message: IncomingMessage) -> Result<(), PipelineError> {
        self.state.push(message);
        Ok(())
    }
}
