//! Retry policy: exponential backoff with jitter and failure classification.
//!
//! Rate limits honour any provider-supplied delay (the `retry-after` header
//! or a hint in the error body). Authentication failures rotate credentials.
//! Context-length rejections are handed back to the executor for trimming.
//! Other 4xx responses are never retried.

use crate::ApiError;
use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = no retries, just fail immediately).
    pub max_retries: u32,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier (typically 2.0 for exponential backoff).
    pub multiplier: f64,
    /// Whether to add jitter to prevent thundering herd.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with the given number of retries. Uses sensible defaults.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter {
            // Keep at least half the delay so bursts from many workers still
            // back off meaningfully.
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            Duration::from_secs_f64(capped * factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }

    /// Delay before the next attempt, preferring a provider hint (capped at
    /// `max_delay`) over computed backoff.
    pub fn delay_with_hint(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        match hint {
            Some(d) => d.min(self.max_delay),
            None => self.delay_for_attempt(attempt),
        }
    }
}

/// How the executor should react to a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// 401/403: rotate to the next credential and retry.
    Auth,
    /// 429: rotate, wait the hinted delay (or backoff), retry.
    RateLimited { retry_after: Option<Duration> },
    /// 5xx, transport, decode, provider-side errors.
    Transient,
    /// The request exceeded the model's context window.
    ContextOverflow,
    /// Any other 4xx. Not retried.
    Fatal,
}

/// Classify a failed attempt.
pub fn classify_error(err: &ApiError) -> FailureClass {
    match err {
        ApiError::Http {
            status,
            body,
            retry_after,
        } => match *status {
            401 | 403 => FailureClass::Auth,
            429 => FailureClass::RateLimited {
                retry_after: (*retry_after).or_else(|| retry_hint_from_body(body)),
            },
            413 => FailureClass::ContextOverflow,
            400 if is_context_overflow(body) => FailureClass::ContextOverflow,
            408 | 409 => FailureClass::Transient,
            s if s >= 500 => FailureClass::Transient,
            _ => FailureClass::Fatal,
        },
        ApiError::Provider(message) if is_context_overflow(message) => {
            FailureClass::ContextOverflow
        }
        ApiError::Transport(_) | ApiError::Decode(_) | ApiError::Provider(_) => {
            FailureClass::Transient
        }
    }
}

fn is_context_overflow(body: &str) -> bool {
    let lower = body.to_lowercase();
    [
        "context_length_exceeded",
        "context length",
        "maximum context",
        "context window",
        "prompt is too long",
        "too many tokens",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

/// Parse a `retry-after` header value: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

fn retry_hint_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:retry after|try again in|retry in)\s+(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?)?\b",
        )
        .ok()
    })
    .as_ref()
}

/// Extract a delay hint such as `"Please try again in 1.5s"` from an error body.
pub fn retry_hint_from_body(body: &str) -> Option<Duration> {
    let caps = retry_hint_regex()?.captures(body)?;
    let amount: f64 = caps.get(1)?.as_str().parse().ok()?;
    let millis = caps
        .get(2)
        .is_some_and(|unit| unit.as_str().to_lowercase().starts_with("m"));
    let secs = if millis { amount / 1000.0 } else { amount };
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16, body: &str) -> ApiError {
        ApiError::Http {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    #[test]
    fn with_retries_sets_count() {
        let config = RetryConfig::with_retries(3);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn delay_increases_exponentially() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::with_retries(5)
        };
        let d0 = config.delay_for_attempt(0);
        let d1 = config.delay_for_attempt(1);
        let d2 = config.delay_for_attempt(2);

        assert!(d1 > d0, "d1={d1:?} should be > d0={d0:?}");
        assert!(d2 > d1, "d2={d2:?} should be > d1={d1:?}");
    }

    #[test]
    fn delay_capped_at_max() {
        let config = RetryConfig {
            jitter: false,
            max_delay: Duration::from_secs(2),
            ..RetryConfig::with_retries(10)
        };
        let d10 = config.delay_for_attempt(10);
        assert!(d10 <= Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let config = RetryConfig::with_retries(3);
        let no_jitter = RetryConfig {
            jitter: false,
            ..RetryConfig::with_retries(3)
        };
        let full = no_jitter.delay_for_attempt(2);
        for _ in 0..50 {
            let d = config.delay_for_attempt(2);
            assert!(d <= full);
            assert!(d >= full / 2);
        }
    }

    #[test]
    fn hint_overrides_backoff_but_is_capped() {
        let config = RetryConfig {
            max_delay: Duration::from_secs(10),
            ..RetryConfig::default()
        };
        assert_eq!(
            config.delay_with_hint(0, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(
            config.delay_with_hint(0, Some(Duration::from_secs(300))),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn auth_failures_rotate() {
        assert_eq!(classify_error(&http(401, "bad key")), FailureClass::Auth);
        assert_eq!(classify_error(&http(403, "forbidden")), FailureClass::Auth);
    }

    #[test]
    fn rate_limit_uses_header_then_body_hint() {
        let with_header = ApiError::Http {
            status: 429,
            body: "slow down".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(
            classify_error(&with_header),
            FailureClass::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
        assert_eq!(
            classify_error(&http(429, "Rate limit reached. Please try again in 1.5s.")),
            FailureClass::RateLimited {
                retry_after: Some(Duration::from_millis(1500))
            }
        );
        assert_eq!(
            classify_error(&http(429, "busy")),
            FailureClass::RateLimited { retry_after: None }
        );
    }

    #[test]
    fn server_and_transport_errors_are_transient() {
        assert_eq!(classify_error(&http(502, "bad gateway")), FailureClass::Transient);
        assert_eq!(classify_error(&http(529, "overloaded")), FailureClass::Transient);
        assert_eq!(
            classify_error(&ApiError::Transport("connection reset".into())),
            FailureClass::Transient
        );
        assert_eq!(
            classify_error(&ApiError::Provider("upstream overloaded".into())),
            FailureClass::Transient
        );
    }

    #[test]
    fn context_overflow_detected() {
        assert_eq!(
            classify_error(&http(
                400,
                r#"{"error":{"code":"context_length_exceeded","message":"..."}}"#
            )),
            FailureClass::ContextOverflow
        );
        assert_eq!(
            classify_error(&http(400, "prompt is too long: 210000 tokens > 200000 maximum")),
            FailureClass::ContextOverflow
        );
        assert_eq!(classify_error(&http(413, "")), FailureClass::ContextOverflow);
    }

    #[test]
    fn other_client_errors_are_fatal() {
        assert_eq!(classify_error(&http(400, "invalid tool schema")), FailureClass::Fatal);
        assert_eq!(classify_error(&http(404, "no such model")), FailureClass::Fatal);
    }

    #[test]
    fn retry_after_header_formats() {
        assert_eq!(parse_retry_after("12"), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after(" 0.5 "), Some(Duration::from_millis(500)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO),
            "dates in the past mean retry now"
        );
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after("-3"), None);
    }

    #[test]
    fn body_hint_units() {
        assert_eq!(
            retry_hint_from_body("retry after 20 seconds"),
            Some(Duration::from_secs(20))
        );
        assert_eq!(
            retry_hint_from_body("Try again in 250ms"),
            Some(Duration::from_millis(250))
        );
        assert_eq!(retry_hint_from_body("no hint here"), None);
    }

    #[test]
    fn oversized_delays_are_ignored() {
        assert_eq!(parse_retry_after("1e300"), None);
        assert_eq!(parse_retry_after("NaN"), None);
        assert_eq!(
            retry_hint_from_body("retry after 99999999999999999999999 seconds"),
            None
        );
        assert_eq!(
            classify_error(&http(429, "retry after 99999999999999999999999 seconds")),
            FailureClass::RateLimited { retry_after: None }
        );
    }
}
