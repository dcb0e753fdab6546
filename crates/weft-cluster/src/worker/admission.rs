//! Worker admission control.
//!
//! A bounded semaphore in front of the inference path. Admission either
//! succeeds immediately or fails fast; in-flight work is never blocked.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ClusterError;

/// RAII guard that releases its slot when dropped.
///
/// Hold it until the corresponding request fully settles.
pub struct Permit {
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish()
    }
}

/// Caps concurrent in-flight inference on this node.
#[derive(Debug, Clone)]
pub struct ResourceManager {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl ResourceManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Try to admit one request. `Err` means the node is at capacity and
    /// the caller must fail the request immediately.
    pub fn try_acquire(&self) -> Result<Permit, ClusterError> {
        self.slots
            .clone()
            .try_acquire_owned()
            .map(|permit| Permit { permit })
            .map_err(|_| ClusterError::ResourceLimit)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_release_on_drop() {
        let rm = ResourceManager::new(2);
        let p1 = rm.try_acquire().expect("first permit");
        let p2 = rm.try_acquire().expect("second permit");
        assert!(rm.try_acquire().is_err(), "third admission denied");

        drop(p1);
        let _p3 = rm.try_acquire().expect("slot released");
        drop(p2);
    }

    #[test]
    fn zero_capacity_rejects_everything() {
        let rm = ResourceManager::new(0);
        assert!(matches!(
            rm.try_acquire(),
            Err(ClusterError::ResourceLimit)
        ));
    }
}
