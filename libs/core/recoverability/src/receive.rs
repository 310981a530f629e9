//! Composition of the receive pipeline and the per-message runner.

use crate::config::RecoverabilityConfig;
use crate::context::ReceiveContext;
use crate::critical_error::CriticalError;
use crate::dispatch::Dispatcher;
use crate::error::PipelineError;
use crate::faults::{FaultMode, MoveFaultsToErrorQueue};
use crate::first_level::FirstLevelRetries;
use crate::message::IncomingMessage;
use crate::notifications::Notifications;
use crate::pipeline::{Behavior, HandlerInvocation, MessageHandler, Pipeline, Stage};
use crate::policy::{
    CustomSecondLevelRetryPolicy, DefaultSecondLevelRetryPolicy, FirstLevelRetryPolicy,
    SecondLevelRetryPolicy,
};
use crate::second_level::{SecondLevelMode, SecondLevelRetries};
use crate::storage::FailureInfoStorage;
use core_config::ConfigError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const MOVE_FAULTS_STAGE: &str = "MoveFaultsToErrorQueue";
pub const SECOND_LEVEL_RETRIES_STAGE: &str = "SecondLevelRetries";
pub const FIRST_LEVEL_RETRIES_STAGE: &str = "FirstLevelRetries";

/// Result of one pass through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// The message is settled and can be removed from the queue.
    Completed,
    /// The receive was aborted; the same message must be delivered again.
    Aborted,
}

/// Summary of [`ReceivePipeline::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingReport {
    /// Passes through the pipeline, the first delivery included.
    pub deliveries: u32,
}

/// Assembled pipeline for one endpoint.
#[derive(Debug)]
pub struct ReceivePipeline {
    pipeline: Pipeline,
    local_address: String,
    notifications: Notifications,
    storage: Arc<FailureInfoStorage>,
}

impl ReceivePipeline {
    pub fn builder(
        config: RecoverabilityConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> ReceivePipelineBuilder {
        ReceivePipelineBuilder::new(config, dispatcher)
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.pipeline.stage_names()
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn notifications(&self) -> &Notifications {
        &self.notifications
    }

    pub fn storage(&self) -> &Arc<FailureInfoStorage> {
        &self.storage
    }

    /// Run one delivery of `message` through the stages.
    pub async fn invoke(&self, message: IncomingMessage) -> Result<ReceiveOutcome, PipelineError> {
        let mut context =
            ReceiveContext::new(message, &self.local_address, self.notifications.clone());

        self.pipeline.invoke(&mut context).await?;

        if context.receive_operation_was_aborted() {
            Ok(ReceiveOutcome::Aborted)
        } else {
            Ok(ReceiveOutcome::Completed)
        }
    }

    /// Run `message` until it is settled, redelivering the message as
    /// received whenever a stage aborts the receive.
    pub async fn process(&self, message: IncomingMessage) -> Result<ProcessingReport, PipelineError> {
        let mut deliveries = 0;
        loop {
            deliveries += 1;
            match self.invoke(message.clone()).await? {
                ReceiveOutcome::Completed => return Ok(ProcessingReport { deliveries }),
                ReceiveOutcome::Aborted => {
                    debug!(
                        message_id = %message.message_id(),
                        deliveries,
                        "Receive aborted, redelivering"
                    );
                }
            }
        }
    }
}

/// Builds a [`ReceivePipeline`] from configuration.
///
/// Recoverability stages are placed in front of the handler stages:
/// error-queue forwarding outermost, then delayed retries (when active),
/// then immediate retries.
pub struct ReceivePipelineBuilder {
    config: RecoverabilityConfig,
    dispatcher: Arc<dyn Dispatcher>,
    notifications: Notifications,
    critical_error: CriticalError,
    storage: Option<Arc<FailureInfoStorage>>,
    second_level_policy: Option<Arc<dyn SecondLevelRetryPolicy>>,
    stages: Vec<Stage>,
}

impl ReceivePipelineBuilder {
    pub fn new(config: RecoverabilityConfig, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            notifications: Notifications::new(),
            critical_error: CriticalError::new(),
            storage: None,
            second_level_policy: None,
            stages: Vec::new(),
        }
    }

    /// Share a notification bus with the pipeline.
    pub fn with_notifications(mut self, notifications: Notifications) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn with_critical_error(mut self, critical_error: CriticalError) -> Self {
        self.critical_error = critical_error;
        self
    }

    /// Use an existing failure storage instead of a fresh one.
    pub fn with_storage(mut self, storage: Arc<FailureInfoStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Replace the default delayed retry policy.
    pub fn with_second_level_policy(mut self, policy: Arc<dyn SecondLevelRetryPolicy>) -> Self {
        self.second_level_policy = Some(policy);
        self
    }

    /// Compute the delayed retry delay from the message; zero means no retry.
    pub fn with_custom_retry_delay<F>(self, delay_for: F) -> Self
    where
        F: Fn(&IncomingMessage) -> Duration + Send + Sync + 'static,
    {
        self.with_second_level_policy(Arc::new(CustomSecondLevelRetryPolicy::new(delay_for)))
    }

    /// Append a handler stage.
    pub fn with_handler(self, handler: Arc<dyn MessageHandler>) -> Self {
        let name = handler.name();
        self.with_stage(name, HandlerInvocation::new(handler))
    }

    /// Append an arbitrary stage after the recoverability stages.
    pub fn with_stage(mut self, name: impl Into<String>, behavior: impl Behavior + 'static) -> Self {
        self.stages.push(Stage::new(name, behavior));
        self
    }

    pub fn build(self) -> Result<ReceivePipeline, ConfigError> {
        if self.config.send_only {
            return Err(ConfigError::Invalid {
                key: "send_only".to_string(),
                details: "send-only endpoints have no receive pipeline".to_string(),
            });
        }
        self.config.validate()?;

        let config = self.config;
        let storage = self.storage.unwrap_or_else(|| {
            Arc::new(FailureInfoStorage::with_capacity(config.failure_storage_capacity))
        });
        let abortable = config.transaction_mode.can_abort_receive();

        let mut stages = Vec::with_capacity(self.stages.len() + 3);

        let fault_mode = if abortable {
            FaultMode::AbortReceive
        } else {
            FaultMode::Immediate
        };
        stages.push(Stage::new(
            MOVE_FAULTS_STAGE,
            MoveFaultsToErrorQueue::new(
                fault_mode,
                config.error_queue.clone(),
                Arc::clone(&storage),
                Arc::clone(&self.dispatcher),
                self.critical_error.clone(),
            ),
        ));

        let second_level_policy = match self.second_level_policy {
            Some(policy) => Some(policy),
            None if config.second_level.is_active() => {
                let policy: Arc<dyn SecondLevelRetryPolicy> =
                    Arc::new(DefaultSecondLevelRetryPolicy::new(
                        config.second_level.number_of_retries,
                        config.second_level.time_increase,
                    ));
                Some(policy)
            }
            None => None,
        };
        if let Some(policy) = second_level_policy {
            let mode = if abortable {
                SecondLevelMode::AbortReceive
            } else {
                SecondLevelMode::Immediate
            };
            stages.push(Stage::new(
                SECOND_LEVEL_RETRIES_STAGE,
                SecondLevelRetries::new(
                    mode,
                    policy,
                    Arc::clone(&storage),
                    Arc::clone(&self.dispatcher),
                    self.critical_error.clone(),
                ),
            ));
        }

        stages.push(Stage::new(
            FIRST_LEVEL_RETRIES_STAGE,
            FirstLevelRetries::new(
                FirstLevelRetryPolicy::new(config.max_immediate_retries),
                Arc::clone(&storage),
            ),
        ));

        stages.extend(self.stages);
        let pipeline = Pipeline::new(stages);

        info!(
            endpoint = %config.local_address,
            error_queue = %config.error_queue,
            transaction_mode = %config.transaction_mode,
            max_immediate_retries = config.max_immediate_retries,
            stages = ?pipeline.stage_names(),
            "Receive pipeline built"
        );

        Ok(ReceivePipeline {
            pipeline,
            local_address: config.local_address,
            notifications: self.notifications,
            storage,
        })
    }
}
