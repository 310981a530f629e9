//! Terminal stage: forwards permanently failed messages to the error queue.

use crate::context::ReceiveContext;
use crate::critical_error::CriticalError;
use crate::dispatch::{Dispatcher, TransportOperation};
use crate::error::PipelineError;
use crate::headers;
use crate::message::OutgoingMessage;
use crate::notifications::Notification;
use crate::pipeline::{Behavior, Next};
use crate::storage::FailureInfoStorage;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

/// How the forward is performed, chosen from the transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// Record the failure and abort; the next delivery is forwarded outside
    /// the failed transaction.
    AbortReceive,

    /// Forward as soon as the failure reaches this stage.
    Immediate,
}

pub struct MoveFaultsToErrorQueue {
    mode: FaultMode,
    error_queue: String,
    storage: Arc<FailureInfoStorage>,
    dispatcher: Arc<dyn Dispatcher>,
    critical_error: CriticalError,
}

impl MoveFaultsToErrorQueue {
    pub fn new(
        mode: FaultMode,
        error_queue: impl Into<String>,
        storage: Arc<FailureInfoStorage>,
        dispatcher: Arc<dyn Dispatcher>,
        critical_error: CriticalError,
    ) -> Self {
        Self {
            mode,
            error_queue: error_queue.into(),
            storage,
            dispatcher,
            critical_error,
        }
    }

    pub fn mode(&self) -> FaultMode {
        self.mode
    }

    async fn move_to_error_queue(
        &self,
        context: &mut ReceiveContext,
        error: PipelineError,
    ) -> Result<(), PipelineError> {
        let message_id = context.message_id().to_string();
        let failed_queue = context.local_address().to_string();

        let message = context.message_mut();
        message.revert_to_original_body_if_needed();
        headers::set_exception_headers(message.headers_mut(), &error, &failed_queue, Utc::now());
        message.headers_mut().remove(headers::RETRIES);

        let operation =
            TransportOperation::new(OutgoingMessage::from_incoming(message), &self.error_queue);

        if let Err(dispatch_error) = self.dispatcher.dispatch(operation).await {
            self.critical_error
                .raise("Failed to forward message to error queue", &dispatch_error);
            return Err(dispatch_error);
        }

        self.storage.clear_failure_info(&message_id);

        info!(
            message_id = %message_id,
            error_queue = %self.error_queue,
            error = %error,
            category = %error.category(),
            "Message moved to error queue"
        );

        context.raise_notification(Notification::MessageFaulted {
            message: context.message().clone(),
            error,
        });

        Ok(())
    }
}

#[async_trait]
impl Behavior for MoveFaultsToErrorQueue {
    async fn invoke(
        &self,
        context: &mut ReceiveContext,
        next: Next<'_>,
    ) -> Result<(), PipelineError> {
        match self.mode {
            FaultMode::AbortReceive => {
                let message_id = context.message_id().to_string();
                let info = self.storage.get_failure_info(&message_id);

                if let (true, Some(error)) = (info.should_move_to_error_queue, info.exception) {
                    return self.move_to_error_queue(context, error).await;
                }

                if let Err(error) = next.run(context).await {
                    debug!(
                        message_id = %message_id,
                        error = %error,
                        "Aborting receive to forward message to error queue"
                    );
                    self.storage.record_failure(&message_id, error, true, false);
                    context.abort_receive_operation();
                }
                Ok(())
            }
            FaultMode::Immediate => match next.run(context).await {
                Ok(()) => Ok(()),
                Err(error) => self.move_to_error_queue(context, error).await,
            },
        }
    }
}
