//! Transient failure classification and retry backoff
//!
//! Only one class of failure is retried: an I/O failure caused by the peer
//! resetting the connection. Everything else aborts the run.
//!
//! # Example
//!
//! ```
//! use release_miner::retry::IsRetryable;
//! use release_miner::error::Error;
//! use std::io;
//!
//! let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
//! let wrapped = Error::Io(io::Error::new(io::ErrorKind::Other, reset));
//! assert!(wrapped.is_retryable());
//!
//! let refused = Error::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
//! assert!(!refused.is_retryable());
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Io(e) => io_chain_has_reset(e),
            // reqwest wraps hyper which wraps the socket error
            Error::Network(e) => error_chain_has_reset(e),
            Error::Config { .. }
            | Error::Plan(_)
            | Error::Transfer(_)
            | Error::Extraction(_)
            | Error::Job { .. }
            | Error::ExternalTool(_)
            | Error::NotSupported(_)
            | Error::Cancelled
            | Error::Other(_) => false,
        }
    }
}

/// Whether an `io::Error` is, or wraps, a connection reset
fn io_chain_has_reset(e: &std::io::Error) -> bool {
    if e.kind() == std::io::ErrorKind::ConnectionReset {
        return true;
    }
    // io::Error::source() skips the custom payload itself, so descend through get_ref
    match e.get_ref() {
        Some(inner) => error_chain_has_reset(inner),
        None => false,
    }
}

/// Walk an error's source chain looking for a connection reset
fn error_chain_has_reset(e: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(e);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return io_chain_has_reset(io);
        }
        current = err.source();
    }
    false
}

/// Retry schedule derived from [`RetryConfig`]
#[derive(Clone, Debug)]
pub struct Backoff {
    config: RetryConfig,
}

impl Backoff {
    /// Create a schedule from configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Whether another retry is allowed after `retries_so_far` retries
    pub fn allows(&self, retries_so_far: u32) -> bool {
        match self.config.max_retries {
            Some(max) => retries_so_far < max,
            None => true,
        }
    }

    /// Delay before retry number `retry` (1-based)
    ///
    /// With the default multiplier of 1.0 this is the same fixed delay every time.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.config.initial_delay.as_secs_f64()
            * self.config.backoff_multiplier.powi(exponent);
        // overflows (infinite or beyond Duration::MAX) saturate at the cap
        let base = Duration::try_from_secs_f64(secs)
            .map_or(self.config.max_delay, |d| d.min(self.config.max_delay));

        if self.config.jitter {
            add_jitter(base)
        } else {
            base
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::try_from_secs_f64(jittered_secs).unwrap_or(delay)
}
