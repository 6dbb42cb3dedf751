//! Bounded retries used for every wait on a daemon.

use anyhow::Result;
use log::debug;
use std::thread;
use std::time::Duration;

use super::constants::{RETRY_ATTEMPTS, RETRY_DELAY};

/// Fixed-delay, fixed-attempt retry discipline.
///
/// Only the last error is reported once the attempts run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of attempts, including the first one
    pub attempts: u32,
    /// Delay between two attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: RETRY_ATTEMPTS,
            delay: RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempt ceiling and delay.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Runs `op` until it succeeds or the attempt ceiling is reached.
    pub fn run<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    debug!("attempt {}/{} failed: {:#}", attempt, attempts, e);
                    attempt += 1;
                    thread::sleep(self.delay);
                }
            }
        }
    }
}
