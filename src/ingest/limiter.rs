// src/ingest/limiter.rs
//! Bounded admission for outbound fetches.
//!
//! A [`RateLimiter`] hands out at most `capacity` permits at a time. Dropping a
//! [`RatePermit`] returns its slot, so a slot is released on every exit path of the
//! holder, including errors and cancellation.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("run cancelled while waiting for a fetch slot")]
pub struct Cancelled;

#[derive(Debug, Clone)]
pub struct RateLimiter {
    slots: Arc<Semaphore>,
    capacity: usize,
}

/// A held slot. Released on drop.
#[derive(Debug)]
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

impl RatePermit {
    /// Explicit release; same as dropping the permit.
    pub fn release(self) {}
}

impl RateLimiter {
    /// Capacity is clamped to at least one slot.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Wait for a free slot, or give up as soon as `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<RatePermit, Cancelled> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            permit = self.slots.clone().acquire_owned() => permit
                .map(|p| RatePermit { _permit: p })
                // The semaphore is never closed; treat it like a cancelled run if it ever is.
                .map_err(|_| Cancelled),
        }
    }
}

/// Per-run handles shared by every stage.
///
/// Built fresh for each run so independent runs (tests, concurrent batches) never share
/// admission state.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub limiter: RateLimiter,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(rate_limit: usize, cancel: CancellationToken) -> Self {
        Self {
            limiter: RateLimiter::new(rate_limit),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
