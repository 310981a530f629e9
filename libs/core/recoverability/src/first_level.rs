//! Immediate, in-process retries.

use crate::context::ReceiveContext;
use crate::error::PipelineError;
use crate::headers;
use crate::notifications::Notification;
use crate::pipeline::{Behavior, Next};
use crate::policy::FirstLevelRetryPolicy;
use crate::storage::FailureInfoStorage;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retries a failing message in-process by aborting the receive.
///
/// A failure below the retry bound is recorded and the receive is aborted,
/// so the caller re-runs the pipeline with the same message; nothing is
/// propagated. Once the bound is reached the number of immediate retries is
/// stamped on the message, the record is dropped and the failure moves on
/// to the next tier. Deserialization failures are never retried.
pub struct FirstLevelRetries {
    policy: FirstLevelRetryPolicy,
    storage: Arc<FailureInfoStorage>,
}

impl FirstLevelRetries {
    pub fn new(policy: FirstLevelRetryPolicy, storage: Arc<FailureInfoStorage>) -> Self {
        Self { policy, storage }
    }
}

#[async_trait]
impl Behavior for FirstLevelRetries {
    async fn invoke(
        &self,
        context: &mut ReceiveContext,
        next: Next<'_>,
    ) -> Result<(), PipelineError> {
        let message_id = context.message_id().to_string();
        let failed_attempts = self
            .storage
            .get_failure_info(&message_id)
            .number_of_failed_attempts;

        let error = match next.run(context).await {
            Ok(()) => {
                self.storage.clear_failure_info(&message_id);
                return Ok(());
            }
            Err(error) => error,
        };

        if !error.category().is_retryable() {
            return Err(error);
        }

        if self.policy.should_give_up(failed_attempts) {
            context
                .message_mut()
                .headers_mut()
                .insert(headers::FL_RETRIES.to_string(), failed_attempts.to_string());
            self.storage.clear_failure_info(&message_id);

            warn!(
                message_id = %message_id,
                attempts = failed_attempts,
                error = %error,
                "Immediate retries exhausted"
            );
            return Err(error);
        }

        self.storage
            .record_failure(&message_id, error.clone(), false, false);
        context.abort_receive_operation();

        let attempt = failed_attempts + 1;
        debug!(
            message_id = %message_id,
            attempt,
            max_retries = self.policy.max_retries(),
            error = %error,
            "Scheduling immediate retry"
        );

        context.raise_notification(Notification::MessageToBeRetried {
            attempt,
            delay: Duration::ZERO,
            message: context.message().clone(),
            error,
            immediate: true,
        });

        Ok(())
    }
}
