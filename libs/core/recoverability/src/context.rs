//! Per-delivery state threaded through the stage chain.

use crate::message::IncomingMessage;
use crate::notifications::{Notification, Notifications};

/// Context for one pass of a received message through the pipeline.
///
/// Aborting is a flag observed by the caller once the chain returns; it is
/// not an error and does not unwind the stages.
#[derive(Debug)]
pub struct ReceiveContext {
    message: IncomingMessage,
    local_address: String,
    notifications: Notifications,
    aborted: bool,
}

impl ReceiveContext {
    pub fn new(
        message: IncomingMessage,
        local_address: impl Into<String>,
        notifications: Notifications,
    ) -> Self {
        Self {
            message,
            local_address: local_address.into(),
            notifications,
            aborted: false,
        }
    }

    pub fn message(&self) -> &IncomingMessage {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut IncomingMessage {
        &mut self.message
    }

    pub fn message_id(&self) -> &str {
        self.message.message_id()
    }

    /// Address of the queue this endpoint receives from.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Ask the transport to roll back the receive so the message is delivered again.
    pub fn abort_receive_operation(&mut self) {
        self.aborted = true;
    }

    pub fn receive_operation_was_aborted(&self) -> bool {
        self.aborted
    }

    pub fn raise_notification(&self, notification: Notification) {
        self.notifications.raise(notification);
    }

    pub fn into_message(self) -> IncomingMessage {
        self.message
    }
}
