use std::time;

use rand::Rng;
use tracing::warn;

use crate::config::RetryConfig;

pub const DEFAULT_RETRY_TIMEOUT: time::Duration = time::Duration::from_secs(5);
pub const DEFAULT_DIAL_TIMEOUT: time::Duration = time::Duration::from_secs(5);
pub const DEFAULT_RETRY_MAX: u32 = 3;
pub const DEFAULT_INITIAL_BACKOFF: time::Duration = time::Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: time::Duration = time::Duration::from_secs(60);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
/// 0 means unlimited
pub const DEFAULT_MAX_RECONNECT_TRIES: u32 = 0;

const JITTER_LOW: f64 = 0.8;
const JITTER_HIGH: f64 = 1.2;

#[derive(Copy, Clone, Debug, PartialEq)]
/// Connection and reconnection settings shared by every broker client.
/// Every duration is non-zero and the multiplier is greater than one.
pub struct RetryPolicy {
    /// Backoff between metadata retries.
    pub timeout: time::Duration,
    /// Metadata retries after the first attempt.
    pub max_count: u32,
    /// Timeout for establishing a broker connection.
    pub dial_timeout: time::Duration,
    /// Backoff base for consumer reconnects.
    pub initial_backoff: time::Duration,
    /// Upper bound of the un-jittered reconnect backoff.
    pub max_backoff: time::Duration,
    /// Growth factor applied per reconnect attempt.
    pub backoff_multiplier: f64,
    /// Reconnect attempts allowed before a consumer gives up, 0 for unlimited.
    pub max_reconnect_tries: u32,
}

impl RetryPolicy {
    /// Jittered delay to wait before reconnect number `attempt`.
    pub fn reconnect_backoff(&self, attempt: u32) -> time::Duration {
        calculate_backoff(
            attempt,
            self.initial_backoff,
            self.max_backoff,
            self.backoff_multiplier,
        )
    }

    pub fn reconnects_exhausted(&self, attempt: u32) -> bool {
        self.max_reconnect_tries > 0 && attempt > self.max_reconnect_tries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RETRY_TIMEOUT,
            max_count: DEFAULT_RETRY_MAX,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_reconnect_tries: DEFAULT_MAX_RECONNECT_TRIES,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        let defaults = RetryPolicy::default();
        let or_default = |value: time::Duration, default: time::Duration| {
            if value.is_zero() {
                default
            } else {
                value
            }
        };

        let backoff_multiplier = match config.backoff_multiplier {
            m if m == 0.0 => defaults.backoff_multiplier,
            m if m.is_finite() && m > 1.0 => m,
            m => {
                warn!(
                    "backoff multiplier {} must be greater than 1, using {}",
                    m, defaults.backoff_multiplier
                );
                defaults.backoff_multiplier
            }
        };

        Self {
            timeout: or_default(config.timeout.0, defaults.timeout),
            max_count: match config.max_count {
                0 => defaults.max_count,
                n => n,
            },
            dial_timeout: or_default(config.dial_timeout.0, defaults.dial_timeout),
            initial_backoff: or_default(config.initial_backoff.0, defaults.initial_backoff),
            max_backoff: or_default(config.max_backoff.0, defaults.max_backoff),
            backoff_multiplier,
            max_reconnect_tries: config.max_reconnect_tries,
        }
    }
}

/// Exponential delay for reconnect attempt `attempt`, capped at `max`, before jitter.
pub fn capped_backoff(
    attempt: u32,
    initial: time::Duration,
    max: time::Duration,
    multiplier: f64,
) -> time::Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let candidate = initial.as_secs_f64() * multiplier.powi(exponent);

    // powi overflows to infinity long before attempt does
    if candidate.is_nan() || candidate >= max.as_secs_f64() {
        max
    } else {
        time::Duration::from_secs_f64(candidate)
    }
}

/// `min(initial * multiplier^attempt, max)` scaled by a uniform factor in
/// [0.8, 1.2], so consumers failing together do not reconnect in lockstep.
pub fn calculate_backoff(
    attempt: u32,
    initial: time::Duration,
    max: time::Duration,
    multiplier: f64,
) -> time::Duration {
    let jitter = rand::thread_rng().gen_range(JITTER_LOW..=JITTER_HIGH);
    capped_backoff(attempt, initial, max, multiplier).mul_f64(jitter)
}
