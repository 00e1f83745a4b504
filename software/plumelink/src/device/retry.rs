//! Retry-with-backoff for fallible device calls.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DeviceError;

/// Exponential backoff. Only transient errors are retried; anything else
/// is returned on the first failure.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub initial_delay: Duration,
    /// Delay multiplier between attempts
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(10),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn once() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    pub fn run<T>(
        &self,
        mut op: impl FnMut() -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        let attempts = self.attempts.max(1);
        let mut delay = self.initial_delay;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(DeviceError::RetriesExhausted {
                        attempts,
                        last: Box::new(e),
                    })
                }
                Err(e) => {
                    debug!("Attempt {attempt}/{attempts} failed: {e}; retrying in {delay:?}");
                    thread::sleep(delay);
                    delay = delay.saturating_mul(self.factor.max(1));
                    attempt += 1;
                }
            }
        }
    }
}
