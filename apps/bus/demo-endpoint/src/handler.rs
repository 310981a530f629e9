use async_trait::async_trait;
use recoverability::{IncomingMessage, MessageHandler, PipelineError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;

/// Payload sent by the demo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveStock {
    pub order: u32,
    pub sku: String,
    /// Failed attempts before the reservation goes through.
    pub fail_times: u32,
}

#[derive(Debug, Error)]
pub enum StockError {
    #[error("Warehouse unavailable for {sku} (attempt {attempt})")]
    WarehouseUnavailable { sku: String, attempt: u32 },
}

/// Reserves stock, failing each message a fixed number of times.
///
/// Attempts are counted per message id across deliveries, so a message
/// keeps its failure budget through immediate and delayed retries.
#[derive(Debug, Default)]
pub struct ReserveStockHandler {
    attempts: Mutex<HashMap<String, u32>>,
    reserved: Arc<AtomicUsize>,
}

impl ReserveStockHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter of successful reservations.
    pub fn reserved(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reserved)
    }

    fn next_attempt(&self, message_id: &str) -> u32 {
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let attempt = attempts.entry(message_id.to_string()).or_insert(0);
        *attempt += 1;
        *attempt
    }
}

#[async_trait]
impl MessageHandler for ReserveStockHandler {
    async fn handle(&self, message: &mut IncomingMessage) -> Result<(), PipelineError> {
        let command: ReserveStock = serde_json::from_slice(message.body()).map_err(|e| {
            PipelineError::deserialization(message.message_id(), e.to_string())
        })?;

        let attempt = self.next_attempt(message.message_id());
        if attempt <= command.fail_times {
            return Err(PipelineError::handler(StockError::WarehouseUnavailable {
                sku: command.sku,
                attempt,
            }));
        }

        self.reserved.fetch_add(1, Ordering::SeqCst);
        info!(
            message_id = %message.message_id(),
            order = command.order,
            sku = %command.sku,
            attempt,
            "Stock reserved"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ReserveStockHandler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recoverability::{ErrorCategory, Headers};

    fn message(id: &str, command: &ReserveStock) -> IncomingMessage {
        IncomingMessage::new(id, Headers::new(), serde_json::to_vec(command).unwrap())
    }

    #[tokio::test]
    async fn test_fails_configured_number_of_times() {
        let handler = ReserveStockHandler::new();
        let mut message = message(
            "m-1",
            &ReserveStock {
                order: 1,
                sku: "SKU-1".to_string(),
                fail_times: 2,
            },
        );

        let err = handler.handle(&mut message).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Handler);
        assert!(err.to_string().contains("attempt 1"));
        assert!(handler.handle(&mut message).await.is_err());
        assert!(handler.handle(&mut message).await.is_ok());
        assert_eq!(handler.reserved().load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_body_is_deserialization_error() {
        let handler = ReserveStockHandler::new();
        let mut message = IncomingMessage::new("m-1", Headers::new(), b"{not json".to_vec());

        let err = handler.handle(&mut message).await.unwrap_err();

        assert!(err.is_deserialization());
        assert_eq!(handler.reserved().load(Ordering::SeqCst), 0);
    }
}
