//! Stage chain executed for every received message.
//!
//! Stages are composed once when the endpoint starts and run in order; each
//! stage decides whether and when to call the rest of the chain through
//! [`Next`].

use crate::context::ReceiveContext;
use crate::error::PipelineError;
use crate::message::IncomingMessage;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// A pipeline stage.
///
/// # Example
///
/// ```rust,ignore
/// struct Timing;
///
/// #[async_trait]
/// impl Behavior for Timing {
///     async fn invoke(&self, context: &mut ReceiveContext, next: Next<'_>) -> Result<(), PipelineError> {
///         let start = Instant::now();
///         let result = next.run(context).await;
///         debug!(elapsed_ms = start.elapsed().as_millis() as u64, "Message processed");
///         result
///     }
/// }
/// ```
#[async_trait]
pub trait Behavior: Send + Sync {
    async fn invoke(&self, context: &mut ReceiveContext, next: Next<'_>)
        -> Result<(), PipelineError>;
}

/// Continuation running the stages after the current one.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Stage],
}

impl<'a> Next<'a> {
    pub(crate) fn new(stages: &'a [Stage]) -> Self {
        Self { stages }
    }

    /// Run the remaining stages. Succeeds immediately at the end of the chain.
    pub async fn run(self, context: &mut ReceiveContext) -> Result<(), PipelineError> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                trace!(stage = stage.name(), message_id = %context.message_id(), "Invoking stage");
                stage.behavior.invoke(context, Next::new(rest)).await
            }
            None => Ok(()),
        }
    }
}

/// A named behavior in the chain.
#[derive(Clone)]
pub struct Stage {
    name: String,
    behavior: Arc<dyn Behavior>,
}

impl Stage {
    pub fn new(name: impl Into<String>, behavior: impl Behavior + 'static) -> Self {
        Self {
            name: name.into(),
            behavior: Arc::new(behavior),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage").field("name", &self.name).finish()
    }
}

/// Ordered list of stages.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(Stage::name).collect()
    }

    pub async fn invoke(&self, context: &mut ReceiveContext) -> Result<(), PipelineError> {
        Next::new(&self.stages).run(context).await
    }
}

/// User code handling a message.
///
/// Handlers may replace the body (see [`IncomingMessage::update_body`]);
/// retries and the error queue still receive the original bytes.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &mut IncomingMessage) -> Result<(), PipelineError>;

    /// Name recorded as the failure source.
    fn name(&self) -> &'static str;
}

/// Stage invoking a [`MessageHandler`] before the rest of the chain.
pub struct HandlerInvocation {
    handler: Arc<dyn MessageHandler>,
}

impl HandlerInvocation {
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl Behavior for HandlerInvocation {
    async fn invoke(
        &self,
        context: &mut ReceiveContext,
        next: Next<'_>,
    ) -> Result<(), PipelineError> {
        self.handler
            .handle(context.message_mut())
            .await
            .map_err(|e| e.with_source_stage(self.handler.name()))?;
        next.run(context).await
    }
}
