//! Wire-level header keys and helpers.
//!
//! Keys and formats are shared with other endpoints on the bus and must not
//! change.

use crate::error::PipelineError;
use crate::message::Headers;
use chrono::{DateTime, Utc};
use tracing::warn;

/// Number of delayed retries already performed.
pub const RETRIES: &str = "NServiceBus.Retries";

/// Time of the first delayed retry.
pub const RETRIES_TIMESTAMP: &str = "NServiceBus.Retries.Timestamp";

/// Number of immediate retries performed before giving up.
pub const FL_RETRIES: &str = "NServiceBus.FLRetries";

pub const FAILED_QUEUE: &str = "NServiceBus.FailedQ";
pub const TIME_OF_FAILURE: &str = "NServiceBus.TimeOfFailure";

pub const EXCEPTION_TYPE: &str = "NServiceBus.ExceptionInfo.ExceptionType";
pub const EXCEPTION_MESSAGE: &str = "NServiceBus.ExceptionInfo.Message";
pub const EXCEPTION_SOURCE: &str = "NServiceBus.ExceptionInfo.Source";
pub const EXCEPTION_STACK_TRACE: &str = "NServiceBus.ExceptionInfo.StackTrace";

/// `yyyy-MM-dd HH:mm:ss:ffffff Z`
const WIRE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S:%6f Z";

/// Format a UTC instant the way it travels in headers.
pub fn to_wire_format(time: DateTime<Utc>) -> String {
    time.format(WIRE_TIME_FORMAT).to_string()
}

/// Delayed retries already performed according to the `Retries` header.
///
/// A missing or malformed header counts as zero.
pub fn second_level_retries(headers: &Headers) -> u32 {
    match headers.get(RETRIES) {
        None => 0,
        Some(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!(header = RETRIES, value = %value, "Malformed retries header, treating as absent");
            0
        }),
    }
}

/// Stamp the failure description onto a message bound for the error queue.
pub fn set_exception_headers(
    headers: &mut Headers,
    error: &PipelineError,
    failed_queue: &str,
    time_of_failure: DateTime<Utc>,
) {
    headers.insert(EXCEPTION_TYPE.to_string(), error.exception_type().to_string());
    headers.insert(EXCEPTION_MESSAGE.to_string(), error.to_string());
    headers.insert(EXCEPTION_STACK_TRACE.to_string(), error.stack_trace());
    if let Some(stage) = error.source_stage() {
        headers.insert(EXCEPTION_SOURCE.to_string(), stage.to_string());
    }
    headers.insert(FAILED_QUEUE.to_string(), failed_queue.to_string());
    headers.insert(
        TIME_OF_FAILURE.to_string(),
        to_wire_format(time_of_failure),
    );
}
