//! Admission gate: bounds how many relays may be active at once.
//!
//! The gate wraps a [`Semaphore`] sized to the configured maximum. Capacity
//! `0` means unbounded and uses the largest pool the semaphore supports, so
//! acquiring never blocks in practice. Every token returns its slot when
//! dropped, so a token moved into a relay task keeps the slot occupied until
//! the task ends.

use crate::error::{TeeError, TeeResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting gate shared between the engine and its relays.
///
/// Cloning is cheap and every clone refers to the same pool.
#[derive(Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl AdmissionGate {
    /// Create a gate with room for `capacity` simultaneous tokens.
    ///
    /// `0` means unbounded.
    pub fn new(capacity: usize) -> Self {
        let permits = if capacity == 0 {
            Semaphore::MAX_PERMITS
        } else {
            capacity
        };
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            capacity,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Wait until a slot is free and take it.
    ///
    /// The semaphore queues waiters in FIFO order, so a waiter is served as
    /// soon as every earlier waiter has been.
    ///
    /// # Errors
    ///
    /// Returns [`TeeError::GateClosed`] once [`close`](Self::close) was called,
    /// including for callers already waiting.
    pub async fn acquire(&self) -> TeeResult<AdmissionToken> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TeeError::GateClosed)?;

        let now = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);

        Ok(AdmissionToken {
            _permit: permit,
            counters: self.counters.clone(),
        })
    }

    /// Return a token to the pool. Equivalent to dropping it.
    pub fn release(&self, token: AdmissionToken) {
        drop(token);
    }

    /// Refuse all further admissions. Outstanding tokens stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Configured capacity, or `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        (self.capacity > 0).then_some(self.capacity)
    }

    /// Tokens currently outstanding.
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Highest number of tokens ever outstanding at the same time.
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }
}

/// One unit of relay capacity. Dropping it frees the slot.
pub struct AdmissionToken {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        // Decrement before the permit field drops so `active` never exceeds capacity.
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}
