use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::runtime::types::CoreError;

/// RAII guard for one worker slot; dropping it frees the slot.
///
/// Workers hold this for the whole attempt, backend call included.
pub struct Permit {
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish()
    }
}

/// Fixed-size pool of worker slots backed by a semaphore.
#[derive(Debug, Clone)]
pub struct WorkerSlots {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerSlots {
    /// A pool of `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held by running attempts.
    pub fn in_flight(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Wait for a free slot. Cancel-safe.
    pub async fn acquire(&self) -> Result<Permit, CoreError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map(|permit| Permit { permit })
            .map_err(|_| CoreError::Shutdown)
    }

    #[cfg(test)]
    pub fn try_acquire(&self) -> Option<Permit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| Permit { permit })
    }

    /// Wait until every slot is free (all running attempts finished), then
    /// close the pool. Returns `false` if `grace` ran out first.
    pub async fn drain(&self, grace: Duration) -> bool {
        let all = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(grace, self.semaphore.acquire_many(all))
            .await
            .is_ok_and(|r| r.is_ok());
        self.semaphore.close();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_acquired_and_released() {
        let slots = WorkerSlots::new(2);

        let p1 = slots.try_acquire().expect("first permit");
        let p2 = slots.try_acquire().expect("second permit");
        assert!(slots.try_acquire().is_none(), "third permit should be denied");
        assert_eq!(slots.in_flight(), 2);

        drop(p1);
        let _p3 = slots.try_acquire().expect("permit after release");
        drop(p2);
        assert_eq!(slots.in_flight(), 1);
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let slots = WorkerSlots::new(0);
        assert_eq!(slots.capacity(), 1);
        assert!(slots.try_acquire().is_some());
    }

    #[tokio::test]
    async fn drain_waits_for_running_attempts() {
        let slots = WorkerSlots::new(1);
        let permit = slots.acquire().await.expect("permit");

        assert!(!slots.clone().drain(Duration::from_millis(20)).await);
        drop(permit);

        let slots = WorkerSlots::new(1);
        let permit = slots.acquire().await.expect("permit");
        let drain = tokio::spawn({
            let slots = slots.clone();
            async move { slots.drain(Duration::from_secs(2)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(permit);
        assert!(drain.await.expect("join"));
        assert!(matches!(slots.acquire().await, Err(CoreError::Shutdown)));
    }
}
