//! Delayed retries: the message is sent back to its own queue with a delay.

use crate::context::ReceiveContext;
use crate::critical_error::CriticalError;
use crate::dispatch::{DeliveryConstraint, Dispatcher, TransportOperation};
use crate::error::PipelineError;
use crate::headers;
use crate::message::OutgoingMessage;
use crate::notifications::Notification;
use crate::pipeline::{Behavior, Next};
use crate::policy::SecondLevelRetryPolicy;
use crate::storage::FailureInfoStorage;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How a delayed retry is carried out, chosen from the transport's
/// transaction mode when the pipeline is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondLevelMode {
    /// Record the decision and abort the receive; the redelivered message is
    /// deferred without running the inner stages again.
    AbortReceive,

    /// Dispatch the delayed copy right away.
    Immediate,
}

pub struct SecondLevelRetries {
    mode: SecondLevelMode,
    policy: Arc<dyn SecondLevelRetryPolicy>,
    storage: Arc<FailureInfoStorage>,
    dispatcher: Arc<dyn Dispatcher>,
    critical_error: CriticalError,
}

impl SecondLevelRetries {
    pub fn new(
        mode: SecondLevelMode,
        policy: Arc<dyn SecondLevelRetryPolicy>,
        storage: Arc<FailureInfoStorage>,
        dispatcher: Arc<dyn Dispatcher>,
        critical_error: CriticalError,
    ) -> Self {
        Self {
            mode,
            policy,
            storage,
            dispatcher,
            critical_error,
        }
    }

    pub fn mode(&self) -> SecondLevelMode {
        self.mode
    }

    /// Retry number and delay for another delayed delivery, if allowed.
    fn retry_delay(&self, context: &ReceiveContext, error: &PipelineError) -> Option<(u32, Duration)> {
        if !error.category().is_retryable() {
            return None;
        }
        let current_retry =
            headers::second_level_retries(context.message().headers()).saturating_add(1);
        self.policy
            .try_get_delay(context.message(), error, current_retry)
            .map(|delay| (current_retry, delay))
    }

    /// Hand the failure on to the error queue stage with a clean retry count.
    fn give_up(&self, context: &mut ReceiveContext, error: PipelineError) -> Result<(), PipelineError> {
        context.message_mut().headers_mut().remove(headers::RETRIES);

        if !error.is_deserialization() {
            warn!(
                message_id = %context.message_id(),
                error = %error,
                "Delayed retries exhausted"
            );
        }
        Err(error)
    }

    async fn defer(
        &self,
        context: &mut ReceiveContext,
        error: PipelineError,
        current_retry: u32,
        delay: Duration,
    ) -> Result<(), PipelineError> {
        let message_id = context.message_id().to_string();
        let destination = context.local_address().to_string();

        context.message_mut().revert_to_original_body_if_needed();

        // Only the outgoing copy is stamped; a failed dispatch leaves the
        // received message as it was for the error queue.
        let mut outgoing = OutgoingMessage::from_incoming(context.message());
        outgoing
            .headers
            .insert(headers::RETRIES.to_string(), current_retry.to_string());
        outgoing
            .headers
            .entry(headers::RETRIES_TIMESTAMP.to_string())
            .or_insert_with(|| headers::to_wire_format(Utc::now()));
        let retried = outgoing.clone().into_incoming();

        let operation = TransportOperation::new(outgoing, &destination)
            .with_constraint(DeliveryConstraint::DelayDeliveryWith(delay));

        if let Err(dispatch_error) = self.dispatcher.dispatch(operation).await {
            self.critical_error
                .raise("Failed to schedule delayed retry", &dispatch_error);
            return Err(dispatch_error);
        }

        self.storage.clear_failure_info(&message_id);

        info!(
            message_id = %message_id,
            retry = current_retry,
            delay_ms = delay.as_millis() as u64,
            destination = %destination,
            error = %error,
            "Message scheduled for delayed retry"
        );

        context.raise_notification(Notification::MessageToBeRetried {
            attempt: current_retry,
            delay,
            message: retried,
            error,
            immediate: false,
        });

        Ok(())
    }
}

#[async_trait]
impl Behavior for SecondLevelRetries {
    async fn invoke(
        &self,
        context: &mut ReceiveContext,
        next: Next<'_>,
    ) -> Result<(), PipelineError> {
        match self.mode {
            SecondLevelMode::AbortReceive => {
                let message_id = context.message_id().to_string();
                let info = self.storage.get_failure_info(&message_id);

                if let (true, Some(error)) = (info.should_defer_for_retry, info.exception) {
                    return match self.retry_delay(context, &error) {
                        Some((current_retry, delay)) => {
                            self.defer(context, error, current_retry, delay).await
                        }
                        None => {
                            self.storage.clear_failure_info(&message_id);
                            self.give_up(context, error)
                        }
                    };
                }

                let error = match next.run(context).await {
                    Ok(()) => return Ok(()),
                    Err(error) => error,
                };

                if !error.category().is_retryable() {
                    return self.give_up(context, error);
                }

                // The policy is consulted once, on the redelivery.
                debug!(message_id = %message_id, "Aborting receive to defer message");
                self.storage.record_failure(&message_id, error, false, true);
                context.abort_receive_operation();
                Ok(())
            }
            SecondLevelMode::Immediate => {
                let error = match next.run(context).await {
                    Ok(()) => return Ok(()),
                    Err(error) => error,
                };

                match self.retry_delay(context, &error) {
                    Some((current_retry, delay)) => {
                        self.defer(context, error, current_retry, delay).await
                    }
                    None => self.give_up(context, error),
                }
            }
        }
    }
}
