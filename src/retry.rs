use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{info, warn};

/// How a failed call should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Quota or rate violation: long backoff, never shorter than the minimum delay.
    RateLimited,
    /// Anything else worth another try: short exponential backoff with jitter.
    Transient,
    /// Retrying cannot help (missing credentials, bad request).
    Permanent,
}

const RATE_LIMIT_MARKERS: &[&str] = &["429", "quota", "rate limit", "resource_exhausted"];

/// Classify an error by the markers in its text.
pub fn classify_error_text(msg: &str) -> ErrorClass {
    let lower = msg.to_lowercase();
    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::RateLimited
    } else {
        ErrorClass::Transient
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per call, including the first.
    pub max_retries: u32,
    /// Minimum spacing between two calls (derived from the per-minute quota).
    pub min_delay: Duration,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random addition to transient backoffs.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            min_delay: Duration::from_secs(31),
            initial_delay: Duration::from_secs(31),
            max_delay: Duration::from_secs(120),
            jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt `attempt` (zero-indexed).
    pub fn backoff_delay(&self, class: ErrorClass, attempt: u32, jitter: Duration) -> Duration {
        let exp = self.initial_delay.saturating_mul(2u32.saturating_pow(attempt));
        match class {
            ErrorClass::RateLimited => exp
                .max(self.min_delay)
                .min(self.max_delay.max(self.min_delay)),
            ErrorClass::Transient => exp.saturating_add(jitter).min(self.max_delay),
            ErrorClass::Permanent => Duration::ZERO,
        }
    }

    fn sample_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let secs = rand::thread_rng().gen_range(0.0..self.jitter.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Spaces calls so that at least `min_delay` passes between the end of one
/// call and the start of the next.
#[derive(Debug)]
pub struct RateLimiter {
    min_delay: Duration,
    last_call: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_delay: Duration) -> Self {
        RateLimiter { min_delay, last_call: None }
    }

    /// Sleep for whatever is left of the minimum delay. Returns the time slept.
    pub async fn wait(&mut self) -> Duration {
        let Some(last) = self.last_call else {
            return Duration::ZERO;
        };
        let elapsed = last.elapsed();
        if elapsed >= self.min_delay {
            return Duration::ZERO;
        }
        let remaining = self.min_delay - elapsed;
        if remaining >= Duration::from_secs(1) {
            info!(
                "Rate limiting - waiting {:.1}s before next request",
                remaining.as_secs_f64()
            );
        }
        tokio::time::sleep(remaining).await;
        remaining
    }

    /// Record that a call just finished.
    pub fn mark(&mut self) {
        self.last_call = Some(Instant::now());
    }
}

/// Run `op` under the rate limiter, retrying failures with backoff.
///
/// The final failure is returned to the caller without a trailing sleep.
/// `Permanent` errors are returned immediately.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    limiter: &mut RateLimiter,
    policy: &RetryPolicy,
    classify: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    C: Fn(&E) -> ErrorClass,
{
    let attempts = policy.max_retries.max(1);
    let mut attempt = 0;
    loop {
        limiter.wait().await;
        let result = op().await;
        limiter.mark();

        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let class = classify(&err);
        if class == ErrorClass::Permanent || attempt + 1 >= attempts {
            return Err(err);
        }

        let delay = policy.backoff_delay(class, attempt, policy.sample_jitter());
        warn!(
            "Attempt {}/{} failed ({:?}): {}. Retrying in {:.1}s",
            attempt + 1,
            attempts,
            class,
            err,
            delay.as_secs_f64()
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
