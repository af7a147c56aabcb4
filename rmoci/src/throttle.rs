use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Bounds the number of reconciliations doing I/O at once. Acquire blocks
/// until a slot frees or the token cancels; a slot is returned by dropping
/// it, and a holder may release around a sleep and re-acquire after. No
/// FIFO ordering is promised.
#[derive(Clone)]
pub struct Throttle {
    sem: Arc<Semaphore>,
}

pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    pub fn release(self) {}
}

impl Throttle {
    pub fn new(limit: usize) -> Throttle {
        Throttle {
            sem: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Slot> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Canceled),
            permit = self.sem.clone().acquire_owned() => {
                // the semaphore is never closed
                permit.map(|p| Slot { _permit: p }).map_err(|_| Error::Canceled)
            }
        }
    }
}
