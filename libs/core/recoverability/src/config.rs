//! Recoverability configuration.

use crate::storage;
use core_config::{env_or_default, env_parse, env_required, ConfigError, FromEnv};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Transaction guarantees offered by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[derive(Display, AsRefStr, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum TransportTransactionMode {
    /// No receive transaction; a consumed message cannot be put back.
    None,
    /// The receive can be rolled back.
    #[default]
    ReceiveOnly,
    /// Outgoing sends commit atomically with the receive.
    SendsAtomicWithReceive,
    /// Distributed transaction spanning the receive and user code.
    TransactionScope,
}

impl TransportTransactionMode {
    /// Whether an aborted receive makes the message available again.
    pub fn can_abort_receive(&self) -> bool {
        !matches!(self, TransportTransactionMode::None)
    }
}

/// Delayed retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondLevelRetriesConfig {
    pub enabled: bool,
    pub number_of_retries: u32,
    pub time_increase: Duration,
}

impl Default for SecondLevelRetriesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            number_of_retries: 3,
            time_increase: Duration::from_secs(10),
        }
    }
}

impl SecondLevelRetriesConfig {
    /// Delayed retries take part in the pipeline only with a non-zero budget.
    pub fn is_active(&self) -> bool {
        self.enabled && self.number_of_retries > 0
    }
}

/// Settings consumed by the recoverability stages and the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverabilityConfig {
    /// Queue this endpoint receives from; delayed retries are sent here.
    pub local_address: String,

    /// Queue receiving permanently failed messages
    pub error_queue: String,

    /// Immediate retries before escalating to delayed retries
    pub max_immediate_retries: u32,

    pub second_level: SecondLevelRetriesConfig,

    pub transaction_mode: TransportTransactionMode,

    /// Maximum messages processed concurrently
    pub max_concurrency: usize,

    /// Message ids tracked by the failure storage
    pub failure_storage_capacity: usize,

    /// Send-only endpoints never receive
    pub send_only: bool,
}

impl Default for RecoverabilityConfig {
    fn default() -> Self {
        Self {
            local_address: String::new(),
            error_queue: "error".to_string(),
            max_immediate_retries: 5,
            second_level: SecondLevelRetriesConfig::default(),
            transaction_mode: TransportTransactionMode::default(),
            max_concurrency: 4,
            failure_storage_capacity: storage::DEFAULT_CAPACITY,
            send_only: false,
        }
    }
}

impl RecoverabilityConfig {
    /// Create a configuration for the endpoint receiving from `local_address`.
    pub fn new(local_address: impl Into<String>) -> Self {
        Self {
            local_address: local_address.into(),
            ..Default::default()
        }
    }

    /// Set the error queue.
    pub fn with_error_queue(mut self, error_queue: impl Into<String>) -> Self {
        self.error_queue = error_queue.into();
        self
    }

    /// Set the number of immediate retries.
    pub fn with_max_immediate_retries(mut self, retries: u32) -> Self {
        self.max_immediate_retries = retries;
        self
    }

    /// Configure delayed retries.
    pub fn with_second_level_retries(mut self, number_of_retries: u32, time_increase: Duration) -> Self {
        self.second_level = SecondLevelRetriesConfig {
            enabled: true,
            number_of_retries,
            time_increase,
        };
        self
    }

    /// Disable delayed retries.
    pub fn without_second_level_retries(mut self) -> Self {
        self.second_level.enabled = false;
        self
    }

    /// Set the transport transaction mode.
    pub fn with_transaction_mode(mut self, mode: TransportTransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }

    /// Set the maximum concurrency.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Set the failure storage capacity.
    pub fn with_failure_storage_capacity(mut self, capacity: usize) -> Self {
        self.failure_storage_capacity = capacity;
        self
    }

    /// Mark the endpoint as send-only.
    pub fn send_only(mut self) -> Self {
        self.send_only = true;
        self
    }

    /// Reject settings no pipeline can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_address.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "local_address".to_string(),
                details: "must not be empty".to_string(),
            });
        }
        if self.error_queue.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "error_queue".to_string(),
                details: "must not be empty".to_string(),
            });
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "max_concurrency".to_string(),
                details: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl FromEnv for RecoverabilityConfig {
    /// Reads from environment variables:
    /// - ENDPOINT_NAME: required
    /// - ERROR_QUEUE: defaults to "error"
    /// - FLR_MAX_RETRIES: defaults to 5
    /// - SLR_ENABLED: defaults to true
    /// - SLR_NUMBER_OF_RETRIES: defaults to 3
    /// - SLR_TIME_INCREASE_SECS: defaults to 10
    /// - TRANSPORT_TRANSACTION_MODE: defaults to ReceiveOnly
    /// - MAX_CONCURRENCY: defaults to 4
    /// - FAILURE_STORAGE_CAPACITY: defaults to 1000
    /// - SEND_ONLY: defaults to false
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            local_address: env_required("ENDPOINT_NAME")?,
            error_queue: env_or_default("ERROR_QUEUE", &defaults.error_queue),
            max_immediate_retries: env_parse("FLR_MAX_RETRIES", defaults.max_immediate_retries)?,
            second_level: SecondLevelRetriesConfig {
                enabled: env_parse("SLR_ENABLED", defaults.second_level.enabled)?,
                number_of_retries: env_parse(
                    "SLR_NUMBER_OF_RETRIES",
                    defaults.second_level.number_of_retries,
                )?,
                time_increase: Duration::from_secs(env_parse(
                    "SLR_TIME_INCREASE_SECS",
                    defaults.second_level.time_increase.as_secs(),
                )?),
            },
            transaction_mode: env_parse("TRANSPORT_TRANSACTION_MODE", defaults.transaction_mode)?,
            max_concurrency: env_parse("MAX_CONCURRENCY", defaults.max_concurrency)?,
            failure_storage_capacity: env_parse(
                "FAILURE_STORAGE_CAPACITY",
                defaults.failure_storage_capacity,
            )?,
            send_only: env_parse("SEND_ONLY", defaults.send_only)?,
        };

        config.validate()?;
        Ok(config)
    }
}
