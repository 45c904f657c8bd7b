//! Per-sender sliding-window admission quota.
//!
//! A sender may admit up to `per_sender_limit` transactions in any window of
//! `window` length.  Timestamps are pruned lazily on every check and by the
//! periodic sweep task.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::types::Address;

pub const DEFAULT_PER_SENDER_LIMIT: usize = 10;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct RateLimiter {
    per_sender_limit: usize,
    window: Duration,
    admissions: Mutex<HashMap<Address, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(per_sender_limit: usize, window: Duration) -> Self {
        Self {
            per_sender_limit,
            window,
            admissions: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `sender` is under its quota right now.  Does not record.
    pub fn check(&self, sender: &Address) -> bool {
        let now = Instant::now();
        let mut admissions = self.admissions.lock();
        if let Some(times) = admissions.get_mut(sender) {
            times.retain(|t| now.duration_since(*t) < self.window);
            times.len() < self.per_sender_limit
        } else {
            true
        }
    }

    /// Record a successful admission for `sender`.
    pub fn record(&self, sender: &Address) {
        self.admissions
            .lock()
            .entry(*sender)
            .or_default()
            .push(Instant::now());
    }

    pub fn count(&self, sender: &Address) -> usize {
        let now = Instant::now();
        self.admissions
            .lock()
            .get(sender)
            .map(|times| {
                times
                    .iter()
                    .filter(|t| now.duration_since(**t) < self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop expired timestamps and empty sender records.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut admissions = self.admissions.lock();
        admissions.retain(|_, times| {
            times.retain(|t| now.duration_since(*t) < self.window);
            !times.is_empty()
        });
    }

    pub fn sender_count(&self) -> usize {
        self.admissions.lock().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_PER_SENDER_LIMIT, DEFAULT_WINDOW)
    }
}
