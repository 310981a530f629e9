use recoverability::{
    CriticalError, ErrorCategory, IncomingMessage, InMemoryTransport, MessageHandler,
    MessageReceiver, Notification, Notifications, OutgoingMessage, PipelineError, ReceivePipeline,
    RecoverabilityConfig, TransportTransactionMode, async_trait, headers,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

const ENDPOINT: &str = "sales";
const ERROR_QUEUE: &str = "error";

/// Fails `failures` times, then succeeds.
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

impl Flaky {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for Flaky {
    async fn handle(&self, message: &mut IncomingMessage) -> Result<(), PipelineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        message.update_body(b"decoded".to_vec());
        if call <= self.failures {
            return Err(PipelineError::handler_message(format!("attempt {call} failed")));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "PlaceOrderHandler"
    }
}

struct Undecodable {
    calls: AtomicU32,
}

#[async_trait]
impl MessageHandler for Undecodable {
    async fn handle(&self, message: &mut IncomingMessage) -> Result<(), PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::deserialization(
            message.message_id(),
            "unexpected end of input",
        ))
    }

    fn name(&self) -> &'static str {
        "Undecodable"
    }
}

fn message(id: &str) -> IncomingMessage {
    IncomingMessage::new(id, Default::default(), b"order-42".to_vec())
}

#[tokio::test]
async fn test_immediate_retries_then_success() {
    let transport = InMemoryTransport::new();
    let handler = Flaky::new(2);
    let config = RecoverabilityConfig::new(ENDPOINT)
        .with_max_immediate_retries(2)
        .without_second_level_retries();

    let pipeline = ReceivePipeline::builder(config, Arc::new(transport.clone()))
        .with_handler(handler.clone())
        .build()
        .unwrap();

    let report = pipeline.process(message("m-1")).await.unwrap();

    assert_eq!(report.deliveries, 3);
    assert_eq!(handler.calls(), 3);
    assert_eq!(transport.len(ENDPOINT), 0);
    assert_eq!(transport.len(ERROR_QUEUE), 0);
    assert!(pipeline.storage().is_empty());
}

#[tokio::test]
async fn test_exhausted_immediate_retries_forward_to_error_queue() {
    let transport = InMemoryTransport::new();
    let handler = Flaky::new(u32::MAX);
    let config = RecoverabilityConfig::new(ENDPOINT)
        .with_max_immediate_retries(3)
        .without_second_level_retries()
        .with_transaction_mode(TransportTransactionMode::None);

    let pipeline = ReceivePipeline::builder(config, Arc::new(transport.clone()))
        .with_handler(handler.clone())
        .build()
        .unwrap();

    let report = pipeline.process(message("m-1")).await.unwrap();

    assert_eq!(report.deliveries, 4);
    assert_eq!(handler.calls(), 4);

    let faulted = transport.messages(ERROR_QUEUE);
    assert_eq!(faulted.len(), 1);
    assert_eq!(faulted[0].header(headers::FL_RETRIES), Some("3"));
    assert_eq!(faulted[0].header(headers::FAILED_QUEUE), Some(ENDPOINT));
    assert_eq!(faulted[0].body(), b"order-42");
}

#[tokio::test(start_paused = true)]
async fn test_delayed_retries_exhausted_end_in_error_queue() {
    let transport = InMemoryTransport::new();
    let handler = Flaky::new(u32::MAX);
    let notifications = Notifications::new();
    let delayed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delayed);
    notifications.subscribe(move |notification| {
        if let Notification::MessageToBeRetried { immediate: false, .. } = notification {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let config = RecoverabilityConfig::new(ENDPOINT)
        .with_max_immediate_retries(0)
        .with_second_level_retries(3, Duration::from_secs(1));

    let pipeline = ReceivePipeline::builder(config, Arc::new(transport.clone()))
        .with_notifications(notifications)
        .with_handler(handler.clone())
        .build()
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let receiver = MessageReceiver::new(Arc::new(transport.queue(ENDPOINT)), Arc::new(pipeline), 2)
        .with_poll_interval(Duration::from_millis(20));
    let running = tokio::spawn(async move { receiver.run(shutdown_rx).await });

    transport.send(
        ENDPOINT,
        OutgoingMessage::new("m-1", Default::default(), b"order-42".to_vec()),
    );

    for _ in 0..600 {
        if transport.len(ERROR_QUEUE) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    shutdown_tx.send(true).unwrap();
    running.await.unwrap();

    assert_eq!(handler.calls(), 4);
    assert_eq!(delayed.load(Ordering::SeqCst), 3);

    let faulted = transport.messages(ERROR_QUEUE);
    assert_eq!(faulted.len(), 1);
    let faulted = &faulted[0];
    assert_eq!(faulted.body(), b"order-42");
    assert_eq!(faulted.header(headers::RETRIES), None);
    assert!(faulted.header(headers::RETRIES_TIMESTAMP).is_some());
    assert_eq!(faulted.header(headers::EXCEPTION_MESSAGE), Some("attempt 4 failed"));
    assert_eq!(faulted.header(headers::EXCEPTION_SOURCE), Some("PlaceOrderHandler"));
    assert_eq!(transport.len(ENDPOINT), 0);
}

#[tokio::test]
async fn test_custom_policy_returning_zero_skips_delayed_retries() {
    let transport = InMemoryTransport::new();
    let handler = Flaky::new(u32::MAX);
    let config = RecoverabilityConfig::new(ENDPOINT)
        .with_max_immediate_retries(0)
        .with_transaction_mode(TransportTransactionMode::None);

    let pipeline = ReceivePipeline::builder(config, Arc::new(transport.clone()))
        .with_custom_retry_delay(|_| Duration::ZERO)
        .with_handler(handler.clone())
        .build()
        .unwrap();

    pipeline.process(message("m-1")).await.unwrap();

    assert_eq!(handler.calls(), 1);
    assert_eq!(transport.len(ENDPOINT), 0);
    assert_eq!(transport.len(ERROR_QUEUE), 1);
}

#[tokio::test]
async fn test_deserialization_failure_skips_all_retries() {
    let transport = InMemoryTransport::new();
    let handler = Arc::new(Undecodable {
        calls: AtomicU32::new(0),
    });
    let config = RecoverabilityConfig::new(ENDPOINT).with_max_immediate_retries(5);

    let pipeline = ReceivePipeline::builder(config, Arc::new(transport.clone()))
        .with_handler(handler.clone())
        .build()
        .unwrap();

    pipeline.process(message("m-1")).await.unwrap();

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(transport.len(ENDPOINT), 0);
    let faulted = transport.messages(ERROR_QUEUE);
    assert_eq!(faulted.len(), 1);
    assert_eq!(
        faulted[0].header(headers::EXCEPTION_TYPE),
        Some(recoverability::DESERIALIZATION_ERROR_TYPE)
    );
}

#[tokio::test]
async fn test_unreachable_error_queue_raises_critical_error() {
    let transport = InMemoryTransport::new();
    transport.set_unavailable(ERROR_QUEUE, true);
    let critical_error = CriticalError::new();
    let config = RecoverabilityConfig::new(ENDPOINT)
        .with_max_immediate_retries(0)
        .without_second_level_retries()
        .with_transaction_mode(TransportTransactionMode::None);

    let pipeline = ReceivePipeline::builder(config, Arc::new(transport.clone()))
        .with_critical_error(critical_error.clone())
        .with_handler(Flaky::new(u32::MAX))
        .build()
        .unwrap();

    let err = pipeline.process(message("m-1")).await.unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Dispatch);
    assert_eq!(critical_error.times_raised(), 1);
    assert_eq!(transport.len(ERROR_QUEUE), 0);
}
