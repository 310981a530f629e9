//! Retry policies for both recoverability tiers.

use crate::error::PipelineError;
use crate::message::IncomingMessage;
use std::fmt;
use std::time::Duration;

/// Bound on in-process retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirstLevelRetryPolicy {
    max_retries: u32,
}

impl FirstLevelRetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether no further immediate retry is allowed after `failed_attempts`.
    pub fn should_give_up(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.max_retries
    }
}

/// Decides whether a message gets another delayed delivery, and when.
pub trait SecondLevelRetryPolicy: Send + Sync {
    /// `current_retry` is the retry about to be attempted (header value + 1).
    ///
    /// Returns `None` when the message should not be retried again.
    fn try_get_delay(
        &self,
        message: &IncomingMessage,
        error: &PipelineError,
        current_retry: u32,
    ) -> Option<Duration>;
}

/// Linear back-off: retry `n` waits `n * time_increase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultSecondLevelRetryPolicy {
    number_of_retries: u32,
    time_increase: Duration,
}

impl DefaultSecondLevelRetryPolicy {
    pub const DEFAULT_NUMBER_OF_RETRIES: u32 = 3;
    pub const DEFAULT_TIME_INCREASE: Duration = Duration::from_secs(10);

    pub fn new(number_of_retries: u32, time_increase: Duration) -> Self {
        Self {
            number_of_retries,
            time_increase,
        }
    }
}

impl Default for DefaultSecondLevelRetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_NUMBER_OF_RETRIES, Self::DEFAULT_TIME_INCREASE)
    }
}

impl SecondLevelRetryPolicy for DefaultSecondLevelRetryPolicy {
    fn try_get_delay(
        &self,
        _message: &IncomingMessage,
        _error: &PipelineError,
        current_retry: u32,
    ) -> Option<Duration> {
        if current_retry == 0 || current_retry > self.number_of_retries {
            return None;
        }
        Some(self.time_increase.saturating_mul(current_retry))
    }
}

/// User-supplied retry schedule computed from the message alone.
///
/// A zero delay means "do not retry".
pub struct CustomSecondLevelRetryPolicy<F> {
    delay_for: F,
}

impl<F> CustomSecondLevelRetryPolicy<F>
where
    F: Fn(&IncomingMessage) -> Duration + Send + Sync,
{
    pub fn new(delay_for: F) -> Self {
        Self { delay_for }
    }
}

impl<F> SecondLevelRetryPolicy for CustomSecondLevelRetryPolicy<F>
where
    F: Fn(&IncomingMessage) -> Duration + Send + Sync,
{
    fn try_get_delay(
        &self,
        message: &IncomingMessage,
        _error: &PipelineError,
        _current_retry: u32,
    ) -> Option<Duration> {
        let delay = (self.delay_for)(message);
        (!delay.is_zero()).then_some(delay)
    }
}

impl<F> fmt::Debug for CustomSecondLevelRetryPolicy<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomSecondLevelRetryPolicy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers;
    use crate::message::Headers;

    fn message() -> IncomingMessage {
        IncomingMessage::new("id", Headers::new(), Vec::new())
    }

    fn error() -> PipelineError {
        PipelineError::handler_message("test")
    }

    #[test]
    fn test_first_level_gives_up_at_max() {
        let policy = FirstLevelRetryPolicy::new(2);

        assert!(!policy.should_give_up(0));
        assert!(!policy.should_give_up(1));
        assert!(policy.should_give_up(2));
        assert!(FirstLevelRetryPolicy::new(0).should_give_up(0));
    }

    #[test]
    fn test_default_policy_linear_delay() {
        let policy = DefaultSecondLevelRetryPolicy::new(3, Duration::from_secs(10));

        assert_eq!(
            policy.try_get_delay(&message(), &error(), 1),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            policy.try_get_delay(&message(), &error(), 3),
            Some(Duration::from_secs(30))
        );
        assert_eq!(policy.try_get_delay(&message(), &error(), 4), None);
    }

    #[test]
    fn test_default_policy_defaults() {
        let policy = DefaultSecondLevelRetryPolicy::default();
        assert_eq!(
            policy.try_get_delay(&message(), &error(), 1),
            Some(Duration::from_secs(10))
        );
        assert_eq!(policy.try_get_delay(&message(), &error(), 4), None);
    }

    #[test]
    fn test_custom_policy_reads_message() {
        let policy = CustomSecondLevelRetryPolicy::new(|message: &IncomingMessage| {
            match headers::second_level_retries(message.headers()) {
                0 => Duration::from_secs(1),
                _ => Duration::ZERO,
            }
        });

        assert_eq!(
            policy.try_get_delay(&message(), &error(), 1),
            Some(Duration::from_secs(1))
        );

        let mut retried = Headers::new();
        retried.insert(headers::RETRIES.to_string(), "1".to_string());
        let retried = IncomingMessage::new("id", retried, Vec::new());
        assert_eq!(policy.try_get_delay(&retried, &error(), 2), None);
    }
}
