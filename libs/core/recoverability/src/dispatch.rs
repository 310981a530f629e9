//! Outbound dispatch seam used for delayed retries and error-queue forwarding.

use crate::error::PipelineError;
use crate::message::OutgoingMessage;
use async_trait::async_trait;
use std::time::Duration;

/// Instruction to the transport on how or when to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryConstraint {
    /// Deliver no earlier than this long after dispatch.
    DelayDeliveryWith(Duration),
}

/// A message bound for a destination address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOperation {
    pub message: OutgoingMessage,
    pub destination: String,
    pub constraints: Vec<DeliveryConstraint>,
}

impl TransportOperation {
    pub fn new(message: OutgoingMessage, destination: impl Into<String>) -> Self {
        Self {
            message,
            destination: destination.into(),
            constraints: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, constraint: DeliveryConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// The requested delay, if any.
    pub fn delay(&self) -> Option<Duration> {
        self.constraints.iter().find_map(|constraint| match constraint {
            DeliveryConstraint::DelayDeliveryWith(delay) => Some(*delay),
        })
    }
}

/// Sends messages to physical queues.
///
/// Implemented by transports; the pipeline awaits the dispatch before
/// continuing, and a failed dispatch is reported as
/// [`PipelineError::Dispatch`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, operation: TransportOperation) -> Result<(), PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Headers;

    #[test]
    fn test_delay_lookup() {
        let message = OutgoingMessage::new("id", Headers::new(), Vec::new());
        let operation = TransportOperation::new(message.clone(), "sales")
            .with_constraint(DeliveryConstraint::DelayDeliveryWith(Duration::from_secs(5)));

        assert_eq!(operation.delay(), Some(Duration::from_secs(5)));
        assert_eq!(TransportOperation::new(message, "sales").delay(), None);
    }
}
