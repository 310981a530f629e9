//! Recoverability
//!
//! Failure handling for a message receive pipeline.
//!
//! ## Features
//!
//! - **Immediate retries**: a failed message is redelivered in-process up to a
//!   configured number of times
//! - **Delayed retries**: the message is sent back to its own queue with a
//!   growing delay and a retry counter header
//! - **Error queue**: exhausted messages are forwarded with exception headers
//! - **Abort-capable transports**: decisions are recorded in a shared
//!   [`FailureInfoStorage`] and acted upon on the next delivery
//! - **Prometheus metrics**: retries, faults and critical errors are counted
//!
//! ## Example
//!
//! ```ignore
//! use recoverability::{InMemoryTransport, MessageReceiver, ReceivePipeline, RecoverabilityConfig};
//!
//! let transport = InMemoryTransport::new();
//! let config = RecoverabilityConfig::new("sales").with_max_immediate_retries(3);
//!
//! let pipeline = ReceivePipeline::builder(config, Arc::new(transport.clone()))
//!     .with_handler(Arc::new(PlaceOrderHandler))
//!     .build()?;
//!
//! let receiver = MessageReceiver::new(Arc::new(transport.queue("sales")), Arc::new(pipeline), 4);
//! receiver.run(shutdown_rx).await;
//! ```

mod config;
mod context;
mod critical_error;
mod dispatch;
mod error;
mod faults;
mod first_level;
pub mod headers;
mod message;
pub mod metrics;
mod notifications;
mod pipeline;
mod policy;
mod receive;
mod second_level;
mod storage;
mod transport;
mod worker;

pub use config::{RecoverabilityConfig, SecondLevelRetriesConfig, TransportTransactionMode};
pub use context::ReceiveContext;
pub use critical_error::CriticalError;
pub use dispatch::{DeliveryConstraint, Dispatcher, TransportOperation};
pub use error::{
    DESERIALIZATION_ERROR_TYPE, DISPATCH_ERROR_TYPE, ErrorCategory, HandlerFailure, PipelineError,
};
pub use faults::{FaultMode, MoveFaultsToErrorQueue};
pub use first_level::FirstLevelRetries;
pub use message::{Headers, IncomingMessage, OutgoingMessage};
pub use self::metrics::{RecoverabilityMetrics, init_metrics, render_metrics};
pub use notifications::{Notification, Notifications};
pub use pipeline::{Behavior, HandlerInvocation, MessageHandler, Next, Pipeline, Stage};
pub use policy::{
    CustomSecondLevelRetryPolicy, DefaultSecondLevelRetryPolicy, FirstLevelRetryPolicy,
    SecondLevelRetryPolicy,
};
pub use receive::{
    FIRST_LEVEL_RETRIES_STAGE, MOVE_FAULTS_STAGE, ProcessingReport, ReceiveOutcome,
    ReceivePipeline, ReceivePipelineBuilder, SECOND_LEVEL_RETRIES_STAGE,
};
pub use second_level::{SecondLevelMode, SecondLevelRetries};
pub use storage::{DEFAULT_CAPACITY, FailureInfoStorage, ProcessingFailureInfo};
pub use transport::{InMemoryQueue, InMemoryTransport};
pub use worker::{MessageReceiver, MessageSource};

// Re-export commonly used types
pub use async_trait::async_trait;
pub use core_config::{ConfigError, FromEnv};
