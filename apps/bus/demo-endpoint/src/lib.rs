//! Demo Endpoint
//!
//! A single endpoint on the in-memory transport that sends itself a batch of
//! stock reservations and processes them through the recoverability stages.
//!
//! ## Architecture
//!
//! ```text
//! InMemoryTransport (queue: ENDPOINT_NAME)
//!   ↓
//! MessageReceiver (MAX_CONCURRENCY in flight)
//!   ↓
//! MoveFaultsToErrorQueue → SecondLevelRetries → FirstLevelRetries
//!   ↓
//! ReserveStockHandler
//!   ↓ (exhausted or malformed)
//! InMemoryTransport (queue: ERROR_QUEUE)
//! ```
//!
//! The run ends on Ctrl+C / SIGTERM or once every message is either reserved
//! or forwarded to the error queue.

mod handler;

pub use handler::{ReserveStock, ReserveStockHandler, StockError};

use core_config::{ConfigError, Environment, FromEnv};
use eyre::{Result, WrapErr};
use recoverability::{
    CriticalError, IncomingMessage, InMemoryTransport, MessageReceiver, Notification,
    Notifications, OutgoingMessage, ReceivePipeline, RecoverabilityConfig,
    RecoverabilityMetrics, headers, metrics,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

const DEMO_ENDPOINT: &str = "demo-endpoint";

/// How often the run checks whether every message is settled.
const SETTLE_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Wait between polls of an empty input queue.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Failures per message before the reservation succeeds.
/// `u32::MAX` never succeeds and ends up in the error queue.
const FAILURE_PLAN: [u32; 8] = [0, 1, 2, 3, 0, 1, u32::MAX, 0];

/// Outcome of [`run_endpoint`].
#[derive(Debug)]
pub struct DemoSummary {
    pub sent: usize,
    pub reserved: usize,
    pub faulted: usize,
    pub error_queue: Vec<IncomingMessage>,
}

/// Configuration used when `ENDPOINT_NAME` is not set.
pub fn demo_config() -> RecoverabilityConfig {
    RecoverabilityConfig::new(DEMO_ENDPOINT)
        .with_max_immediate_retries(2)
        .with_second_level_retries(2, Duration::from_secs(1))
}

fn load_config() -> Result<RecoverabilityConfig> {
    match RecoverabilityConfig::from_env() {
        Ok(config) => Ok(config),
        Err(ConfigError::MissingEnvVar(key)) => {
            info!(key = %key, "Endpoint not configured, using demo configuration");
            Ok(demo_config())
        }
        Err(e) => Err(e).wrap_err("Failed to load recoverability configuration"),
    }
}

/// Run the demo endpoint
///
/// This is the main entry point. It:
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Installs the Prometheus recorder
/// 3. Loads the recoverability configuration
/// 4. Processes the demo batch until settled or interrupted
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics();

    info!("Starting demo endpoint");
    info!("Environment: {:?}", environment);

    let config = load_config()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let summary = run_endpoint(config, shutdown_rx).await?;

    for message in &summary.error_queue {
        warn!(
            message_id = %message.message_id(),
            exception_type = message.header(headers::EXCEPTION_TYPE).unwrap_or_default(),
            exception_message = message.header(headers::EXCEPTION_MESSAGE).unwrap_or_default(),
            immediate_retries = message.header(headers::FL_RETRIES).unwrap_or_default(),
            "Message in error queue"
        );
    }

    info!(
        sent = summary.sent,
        reserved = summary.reserved,
        faulted = summary.faulted,
        "Demo endpoint stopped"
    );
    info!("Metrics:\n{}", metrics::render_metrics());

    Ok(())
}

/// Send the demo batch to the endpoint and process it.
///
/// Returns once every message is settled or `shutdown` flips to `true`.
pub async fn run_endpoint(
    config: RecoverabilityConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<DemoSummary> {
    let transport = InMemoryTransport::new();
    let handler = Arc::new(ReserveStockHandler::new());
    let reserved = handler.reserved();

    let notifications = Notifications::new();
    let faulted = Arc::new(AtomicUsize::new(0));
    let faulted_counter = Arc::clone(&faulted);
    notifications.subscribe(move |notification| {
        if let Notification::MessageFaulted { .. } = notification {
            faulted_counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    RecoverabilityMetrics::new(&config.local_address).subscribe(&notifications);

    let critical_error = CriticalError::with_action(|message, error| {
        error!(error = %error, "Endpoint needs attention: {}", message);
    });

    let pipeline = ReceivePipeline::builder(config.clone(), Arc::new(transport.clone()))
        .with_notifications(notifications)
        .with_critical_error(critical_error)
        .with_handler(handler)
        .build()
        .wrap_err("Failed to build receive pipeline")?;
    info!(stages = ?pipeline.stage_names(), "Receive pipeline ready");

    let sent = send_batch(&transport, &config.local_address)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let settled_reserved = Arc::clone(&reserved);
    let settled_faulted = Arc::clone(&faulted);
    let watcher = tokio::spawn(async move {
        loop {
            let settled =
                settled_reserved.load(Ordering::SeqCst) + settled_faulted.load(Ordering::SeqCst);
            if settled >= sent {
                info!(settled, "All messages settled");
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(SETTLE_CHECK_INTERVAL) => {}
            }
        }
        let _ = stop_tx.send(true);
    });

    let receiver = MessageReceiver::new(
        Arc::new(transport.queue(&config.local_address)),
        Arc::new(pipeline),
        config.max_concurrency,
    )
    .with_poll_interval(RECEIVE_POLL_INTERVAL);
    receiver.run(stop_rx).await;
    watcher.await.wrap_err("Settlement watcher failed")?;

    Ok(DemoSummary {
        sent,
        reserved: reserved.load(Ordering::SeqCst),
        faulted: faulted.load(Ordering::SeqCst),
        error_queue: transport.messages(&config.error_queue),
    })
}

/// Enqueue one message per [`FAILURE_PLAN`] entry plus one malformed body.
fn send_batch(transport: &InMemoryTransport, address: &str) -> Result<usize> {
    for (order, fail_times) in FAILURE_PLAN.iter().copied().enumerate() {
        let command = ReserveStock {
            order: order as u32,
            sku: format!("SKU-{:03}", order),
            fail_times,
        };
        let body = serde_json::to_vec(&command).wrap_err("Failed to serialize command")?;
        transport.send(
            address,
            OutgoingMessage::new(Uuid::now_v7().to_string(), Default::default(), body),
        );
    }

    transport.send(
        address,
        OutgoingMessage::new(
            Uuid::now_v7().to_string(),
            Default::default(),
            b"{\"order\": ".to_vec(),
        ),
    );

    let sent = FAILURE_PLAN.len() + 1;
    info!(count = sent, address = %address, "Demo batch sent");
    Ok(sent)
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
