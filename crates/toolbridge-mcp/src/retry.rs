//! Tool call retry functionality.
//!
//! Classifies failures into retry classes and computes exponential backoff.
//! Classification reads the structured fields of [`McpError`] first (variant,
//! HTTP status, JSON-RPC code) and only falls back to message text for opaque
//! errors from third-party servers.

use crate::error::McpError;
use crate::protocol::{INVALID_PARAMS, METHOD_NOT_FOUND};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

/// Initial retry delay in milliseconds.
pub const RETRY_INITIAL_DELAY_MS: u64 = 500;

/// Backoff factor for exponential delay.
pub const RETRY_BACKOFF_FACTOR: u32 = 2;

/// Maximum delay between attempts in milliseconds.
pub const RETRY_MAX_DELAY_MS: u64 = 10_000;

/// Maximum number of attempts, including the first.
pub const RETRY_MAX_ATTEMPTS: u32 = 3;

/// Retry class of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Credentials missing or rejected. Never retried.
    Authentication,
    /// Time budget exceeded. Retried only on request.
    Timeout,
    /// Will fail the same way again. Never retried.
    Permanent,
    /// May succeed on another attempt.
    Transient,
}

impl ErrorClass {
    /// Whether a call that failed this way should be attempted again.
    pub fn is_retryable(self, retry_timeouts: bool) -> bool {
        match self {
            Self::Transient => true,
            Self::Timeout => retry_timeouts,
            Self::Authentication | Self::Permanent => false,
        }
    }
}

/// Classify an execution failure.
pub fn classify(error: &McpError) -> ErrorClass {
    if error.is_authentication() {
        return ErrorClass::Authentication;
    }
    if error.is_timeout() {
        return ErrorClass::Timeout;
    }

    for cause in error.chain() {
        match cause {
            McpError::InvalidArguments(_)
            | McpError::Protocol(_)
            | McpError::Json(_)
            | McpError::Unsupported(_)
            | McpError::StreamingUnsupported { .. } => return ErrorClass::Permanent,
            McpError::Rpc { code, .. } if *code == METHOD_NOT_FOUND || *code == INVALID_PARAMS => {
                return ErrorClass::Permanent
            }
            _ => {}
        }
    }

    if let Some(status) = error.http_status() {
        return match status {
            408 | 429 | 500..=599 => ErrorClass::Transient,
            400..=499 => ErrorClass::Permanent,
            _ => ErrorClass::Transient,
        };
    }

    classify_message(&error.to_string())
}

static STATUS_401: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b401\b").expect("valid status regex"));

/// Best-effort classification from error text alone.
pub fn classify_message(message: &str) -> ErrorClass {
    let message = message.to_lowercase();

    if message.contains("unauthorized") || STATUS_401.is_match(&message) {
        return ErrorClass::Authentication;
    }
    if message.contains("timed out") || message.contains("timeout") {
        return ErrorClass::Timeout;
    }
    if message.contains("method not found")
        || message.contains("tool not found")
        || message.contains("unknown tool")
        || message.contains("validation")
        || message.contains("invalid params")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Transient
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(RETRY_INITIAL_DELAY_MS),
            backoff_factor: RETRY_BACKOFF_FACTOR,
            max_delay: Duration::from_millis(RETRY_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_factor
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Sleep for the specified duration, respecting cancellation.
///
/// Returns false if cancelled.
pub async fn sleep_with_cancel(
    duration: Duration,
    cancel: Option<&tokio_util::sync::CancellationToken>,
) -> bool {
    match cancel {
        Some(token) => tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = token.cancelled() => false,
        },
        None => {
            tokio::time::sleep(duration).await;
            true
        }
    }
}
