//! Per-origin admission control.
//!
//! Each origin may have at most `max_per_origin` calls in flight. A call takes
//! a slot with [`AdmissionQueue::acquire`] and gives it back when the returned
//! [`AdmissionPermit`] is dropped, on every exit path.

use crate::error::{BrokerError, BrokerResult};
use corral_types::Origin;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::error;

/// In-flight call counts keyed by origin.
#[derive(Debug)]
pub struct AdmissionQueue {
    max_per_origin: usize,
    counts: Mutex<HashMap<Origin, usize>>,
}

impl AdmissionQueue {
    pub fn new(max_per_origin: usize) -> Self {
        Self {
            max_per_origin,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_per_origin(&self) -> usize {
        self.max_per_origin
    }

    /// Takes a slot for `origin`. Fails with `QueueFull` at the limit.
    pub fn increment(&self, origin: &Origin) -> BrokerResult<()> {
        let mut counts = crate::lock(&self.counts);
        if counts.get(origin).copied().unwrap_or(0) >= self.max_per_origin {
            return Err(BrokerError::QueueFull {
                origin: origin.clone(),
                max: self.max_per_origin,
            });
        }
        *counts.entry(origin.clone()).or_insert(0) += 1;
        Ok(())
    }

    /// Releases a slot for `origin`. Fails with `QueueUnderflow` at zero.
    pub fn decrement(&self, origin: &Origin) -> BrokerResult<()> {
        let mut counts = crate::lock(&self.counts);
        match counts.get_mut(origin) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                counts.remove(origin);
                Ok(())
            }
            None => Err(BrokerError::QueueUnderflow {
                origin: origin.clone(),
            }),
        }
    }

    /// Current in-flight count for `origin`.
    pub fn get(&self, origin: &Origin) -> usize {
        crate::lock(&self.counts).get(origin).copied().unwrap_or(0)
    }

    /// Takes a slot that is released when the permit drops.
    pub fn acquire(self: &Arc<Self>, origin: &Origin) -> BrokerResult<AdmissionPermit> {
        self.increment(origin)?;
        Ok(AdmissionPermit {
            queue: Arc::clone(self),
            origin: origin.clone(),
        })
    }
}

/// One admitted call. Dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    queue: Arc<AdmissionQueue>,
    origin: Origin,
}

impl AdmissionPermit {
    pub fn origin(&self) -> &Origin {
        &self.origin
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Err(e) = self.queue.decrement(&self.origin) {
            error!(origin = %self.origin, error = %e, "admission permit released twice");
        }
    }
}
