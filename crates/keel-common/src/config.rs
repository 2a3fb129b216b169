//! Controller runtime configuration
//!
//! Defaults match what the controllers need in production; every value can be
//! overridden through a `KEEL_*` environment variable so the Deployment can
//! tune a controller without a rebuild.

use std::str::FromStr;
use std::time::Duration;

use crate::Error;

/// Number of concurrent reconcile workers per controller
pub const DEFAULT_WORKERS: usize = 10;

/// Upper bound on one sync of one key
pub const DEFAULT_MAX_SYNC_DURATION: Duration = Duration::from_secs(30);

/// First retry delay for a failing key
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Cap on the per-key retry delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Sustained rate of requeues across all keys
pub const DEFAULT_QPS: f64 = 10.0;

/// Burst allowance on top of [`DEFAULT_QPS`]
pub const DEFAULT_BURST: u32 = 100;

/// Tunables shared by every controller built on the reconcile kernel
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Concurrent workers pulling keys from the queue
    pub workers: usize,
    /// Deadline applied to each sync
    pub max_sync_duration: Duration,
    /// Initial per-key backoff
    pub base_delay: Duration,
    /// Maximum per-key backoff
    pub max_delay: Duration,
    /// Overall requeue rate (tokens per second)
    pub qps: f64,
    /// Overall requeue burst
    pub burst: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_sync_duration: DEFAULT_MAX_SYNC_DURATION,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            qps: DEFAULT_QPS,
            burst: DEFAULT_BURST,
        }
    }
}

impl ControllerConfig {
    /// Read overrides from the process environment
    ///
    /// Recognized variables: `KEEL_WORKERS`, `KEEL_MAX_SYNC_SECONDS`,
    /// `KEEL_BASE_DELAY_MS`, `KEEL_MAX_DELAY_SECONDS`, `KEEL_QPS`, `KEEL_BURST`.
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides from an arbitrary key/value source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> crate::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            workers: parse_or(&lookup, "KEEL_WORKERS", defaults.workers)?,
            max_sync_duration: parse_or(&lookup, "KEEL_MAX_SYNC_SECONDS", None)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_sync_duration),
            base_delay: parse_or(&lookup, "KEEL_BASE_DELAY_MS", None)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: parse_or(&lookup, "KEEL_MAX_DELAY_SECONDS", None)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_delay),
            qps: parse_or(&lookup, "KEEL_QPS", defaults.qps)?,
            burst: parse_or(&lookup, "KEEL_BURST", defaults.burst)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the kernel cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.workers == 0 {
            return Err(Error::validation_for_field(
                "controller-config",
                "workers",
                "at least one worker is required",
            ));
        }
        if self.max_sync_duration.is_zero() {
            return Err(Error::validation_for_field(
                "controller-config",
                "max_sync_duration",
                "sync deadline must be positive",
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::validation_for_field(
                "controller-config",
                "base_delay",
                "base delay must not exceed max delay",
            ));
        }
        if !(self.qps.is_finite() && self.qps > 0.0) {
            return Err(Error::validation_for_field(
                "controller-config",
                "qps",
                "qps must be a positive number",
            ));
        }
        Ok(())
    }
}

/// Parse `key` when present, otherwise fall back to `default`
///
/// `Option<T>` defaults parse into `Some(T)` so callers can post-process units.
fn parse_or<T: ParseValue>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> crate::Result<T> {
    match lookup(key) {
        Some(raw) => T::parse_value(raw.trim()).ok_or_else(|| {
            Error::validation_for_field(
                "controller-config",
                key,
                format!("cannot parse '{raw}'"),
            )
        }),
        None => Ok(default),
    }
}

trait ParseValue: Sized {
    fn parse_value(raw: &str) -> Option<Self>;
}

macro_rules! parse_value_from_str {
    ($($ty:ty),*) => {
        $(impl ParseValue for $ty {
            fn parse_value(raw: &str) -> Option<Self> {
                <$ty>::from_str(raw).ok()
            }
        })*
    };
}

parse_value_from_str!(usize, u32, u64, f64);

impl<T: ParseValue> ParseValue for Option<T> {
    fn parse_value(raw: &str) -> Option<Self> {
        T::parse_value(raw).map(Some)
    }
}
