//! Receive loop pulling messages into the pipeline with bounded concurrency.

use crate::error::{ErrorCategory, PipelineError};
use crate::message::IncomingMessage;
use crate::metrics::RecoverabilityMetrics;
use crate::receive::ReceivePipeline;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Input queue as seen by the receiver.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Next message, or `None` when nothing arrived within the poll window.
    async fn receive(&self) -> Result<Option<IncomingMessage>, PipelineError>;

    /// Remove a settled message from the queue.
    async fn complete(&self, message_id: String) -> Result<(), PipelineError>;

    /// Give a message back to the queue after an unrecoverable pipeline error.
    async fn abandon(&self, message: IncomingMessage) -> Result<(), PipelineError>;
}

/// Pumps messages from a [`MessageSource`] through a [`ReceivePipeline`].
///
/// At most `max_concurrency` messages are in flight; stages for a single
/// message run sequentially on one task.
pub struct MessageReceiver<S: MessageSource> {
    source: Arc<S>,
    pipeline: Arc<ReceivePipeline>,
    concurrency_semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    poll_interval: Duration,
    metrics: RecoverabilityMetrics,
}

impl<S> MessageReceiver<S>
where
    S: MessageSource + 'static,
{
    pub fn new(source: Arc<S>, pipeline: Arc<ReceivePipeline>, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        let metrics = RecoverabilityMetrics::new(pipeline.local_address());

        Self {
            source,
            pipeline,
            concurrency_semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            poll_interval: Duration::from_millis(100),
            metrics,
        }
    }

    /// Wait between polls when the source has nothing to deliver.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run until the shutdown signal flips to `true`, then drain in-flight work.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            endpoint = %self.pipeline.local_address(),
            max_concurrency = self.max_concurrency,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Starting message receiver"
        );

        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut consecutive_errors: u32 = 0;
        const MAX_BACKOFF_SECS: u64 = 30;

        loop {
            if *shutdown.borrow() {
                info!("Received shutdown signal, stopping receiver");
                break;
            }

            let permit = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                permit = Arc::clone(&self.concurrency_semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                received = self.source.receive() => received,
            };

            match received {
                Ok(Some(message)) => {
                    consecutive_errors = 0;
                    let pipeline = Arc::clone(&self.pipeline);
                    let source = Arc::clone(&self.source);
                    let metrics = self.metrics.clone();

                    in_flight.spawn(async move {
                        let _permit = permit;
                        process_message(&pipeline, source.as_ref(), &metrics, message).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if wait_or_shutdown(&mut shutdown, self.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff_secs =
                        std::cmp::min(2u64.pow(consecutive_errors.min(5)), MAX_BACKOFF_SECS);
                    warn!(
                        error = %e,
                        consecutive_errors,
                        backoff_secs,
                        "Failed to receive message, backing off"
                    );
                    drop(permit);
                    if wait_or_shutdown(&mut shutdown, Duration::from_secs(backoff_secs)).await {
                        break;
                    }
                }
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Message task panicked");
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Message task panicked");
            }
        }

        info!("Message receiver stopped");
    }
}

/// Sleep for `duration`; true when the receiver should stop instead.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(duration) => false,
    }
}

async fn process_message<S: MessageSource + ?Sized>(
    pipeline: &Arc<ReceivePipeline>,
    source: &S,
    metrics: &RecoverabilityMetrics,
    message: IncomingMessage,
) {
    let message_id = message.message_id().to_string();
    let start = Instant::now();

    // Own task so a panicking handler still leaves the message to abandon.
    let processing = {
        let pipeline = Arc::clone(pipeline);
        let message = message.clone();
        tokio::spawn(async move { pipeline.process(message).await })
    };

    match processing.await {
        Ok(Ok(report)) => {
            metrics.message_processed(start.elapsed());
            debug!(
                message_id = %message_id,
                deliveries = report.deliveries,
                "Message settled"
            );

            if let Err(e) = source.complete(message_id.clone()).await {
                error!(message_id = %message_id, error = %e, "Failed to complete message");
            }
            return;
        }
        Ok(Err(e)) => {
            metrics.message_failed(e.category());
            error!(
                message_id = %message_id,
                error = %e,
                category = %e.category(),
                "Pipeline failed, returning message to the queue"
            );
        }
        Err(join_error) => {
            metrics.message_failed(ErrorCategory::Handler);
            error!(
                message_id = %message_id,
                error = %join_error,
                "Message processing panicked, returning message to the queue"
            );
        }
    }

    if let Err(abandon_err) = source.abandon(message).await {
        error!(message_id = %message_id, error = %abandon_err, "Failed to abandon message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoverabilityConfig;
    use crate::dispatch::MockDispatcher;
    use crate::message::Headers;
    use crate::pipeline::MessageHandler;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, _message: &mut IncomingMessage) -> Result<(), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Counting"
        }
    }

    struct Panicking;

    #[async_trait]
    impl MessageHandler for Panicking {
        async fn handle(&self, _message: &mut IncomingMessage) -> Result<(), PipelineError> {
            panic!("handler blew up");
        }

        fn name(&self) -> &'static str {
            "Panicking"
        }
    }

    fn pipeline(handler: Arc<dyn MessageHandler>, dispatcher: MockDispatcher) -> Arc<ReceivePipeline> {
        Arc::new(
            ReceivePipeline::builder(RecoverabilityConfig::new("sales"), Arc::new(dispatcher))
                .with_handler(handler)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_processes_and_completes_messages() {
        let handler = Arc::new(Counting {
            calls: AtomicU32::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let mut source = MockMessageSource::new();
        source
            .expect_receive()
            .times(1)
            .returning(|| Ok(Some(IncomingMessage::new("m-1", Headers::new(), Vec::new()))));
        source
            .expect_receive()
            .returning(|| Ok(None));
        let signal = Arc::clone(&shutdown_tx);
        source
            .expect_complete()
            .withf(|message_id| message_id == "m-1")
            .times(1)
            .returning(move |_| {
                let _ = signal.send(true);
                Ok(())
            });
        source.expect_abandon().never();

        let receiver = MessageReceiver::new(
            Arc::new(source),
            pipeline(handler.clone(), MockDispatcher::new()),
            2,
        );
        receiver.run(shutdown_rx).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_shutdown_without_messages() {
        let handler = Arc::new(Counting {
            calls: AtomicU32::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut source = MockMessageSource::new();
        source.expect_receive().returning(|| Ok(None));
        source.expect_complete().never();

        let receiver = MessageReceiver::new(
            Arc::new(source),
            pipeline(handler.clone(), MockDispatcher::new()),
            1,
        );

        shutdown_tx.send(true).unwrap();
        receiver.run(shutdown_rx).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_abandons_message() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let mut source = MockMessageSource::new();
        source
            .expect_receive()
            .times(1)
            .returning(|| Ok(Some(IncomingMessage::new("m-1", Headers::new(), b"body".to_vec()))));
        source
            .expect_receive()
            .returning(|| Ok(None));
        let signal = Arc::clone(&shutdown_tx);
        source
            .expect_abandon()
            .withf(|message| message.message_id() == "m-1" && message.body() == b"body")
            .times(1)
            .returning(move |_| {
                let _ = signal.send(true);
                Ok(())
            });
        source.expect_complete().never();

        let receiver = MessageReceiver::new(
            Arc::new(source),
            pipeline(Arc::new(Panicking), MockDispatcher::new()),
            1,
        );
        receiver.run(shutdown_rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_interval_spaces_empty_receives() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let polls = Arc::new(AtomicU32::new(0));

        let mut source = MockMessageSource::new();
        let counter = Arc::clone(&polls);
        source.expect_receive().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });

        let receiver = MessageReceiver::new(
            Arc::new(source),
            pipeline(Arc::new(Counting { calls: AtomicU32::new(0) }), MockDispatcher::new()),
            1,
        )
        .with_poll_interval(Duration::from_millis(250));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(900)).await;
            let _ = shutdown_tx.send(true);
        });
        receiver.run(shutdown_rx).await;

        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }
}
