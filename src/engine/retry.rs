//! Backoff for transient fetch failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Growth factor used when a configured one would not grow.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Smallest first delay; a zero delay would never grow.
pub const MIN_INITIAL_BACKOFF: Duration = Duration::from_millis(1);

/// Bounded exponential backoff.
///
/// The delay before retry `n` (1-based) is
/// `min(initial_backoff * multiplier^(n-1), max_backoff)`, raised to any
/// server-requested `Retry-After` and then capped at `max_backoff` again.
/// Within one fetch, [`Backoff`] also keeps every delay above the previous
/// one until the cap is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per fetch, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(with = "millis", rename = "initial_backoff_ms")]
    pub initial_backoff: Duration,

    /// Growth factor between consecutive delays.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    #[serde(with = "millis", rename = "max_backoff_ms")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            multiplier: DEFAULT_MULTIPLIER,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total number of attempts (at least 1).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the first delay. Zero becomes [`MIN_INITIAL_BACKOFF`].
    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = sanitize_initial(delay);
        self
    }

    /// Set the growth factor. Values that do not grow (at most 1.0, or not
    /// finite) become [`DEFAULT_MULTIPLIER`].
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = sanitize_multiplier(multiplier);
        self
    }

    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts.max(1)
    }

    /// Backoff state for the retries of one fetch.
    pub fn backoff(&self) -> Backoff<'_> {
        Backoff {
            policy: self,
            retries: 0,
            previous: None,
        }
    }

    /// Delay before retry number `retry` (1-based), ignoring earlier delays.
    pub fn delay_for(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = sanitize_initial(self.initial_backoff).as_secs_f64()
            * sanitize_multiplier(self.multiplier).powi(exponent);
        let capped = scaled.min(self.max_backoff.as_secs_f64());
        let backoff = Duration::try_from_secs_f64(capped).unwrap_or(self.max_backoff);

        match retry_after {
            Some(requested) => backoff.max(requested).min(self.max_backoff),
            None => backoff,
        }
    }
}

/// Successive delays for the retries of a single fetch.
///
/// A delay raised by a server `Retry-After` becomes the base for the next
/// one, so delays never shrink between retries.
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    retries: u32,
    previous: Option<Duration>,
}

impl Backoff<'_> {
    /// Delay before the next retry.
    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Duration {
        self.retries = self.retries.saturating_add(1);
        let mut delay = self.policy.delay_for(self.retries, retry_after);
        if let Some(previous) = self.previous {
            let grown = previous.mul_f64(sanitize_multiplier(self.policy.multiplier));
            delay = delay.max(grown).min(self.policy.max_backoff);
        }
        self.previous = Some(delay);
        delay
    }

    /// Retries handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

fn sanitize_multiplier(multiplier: f64) -> f64 {
    if multiplier.is_finite() && multiplier > 1.0 {
        multiplier
    } else {
        DEFAULT_MULTIPLIER
    }
}

fn sanitize_initial(delay: Duration) -> Duration {
    delay.max(MIN_INITIAL_BACKOFF)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
