//! Per-specification write locks.
//!
//! The sync engine and the conflict resolver both mutate the two stores for
//! a given spec. Holding the spec's lock for the whole backup, write and
//! rollback sequence keeps their writes from interleaving. Different specs
//! proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::SpecId;

#[derive(Debug, Default)]
pub struct SpecLocks {
    locks: Mutex<HashMap<SpecId, Arc<AsyncMutex<()>>>>,
}

impl SpecLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `spec_id`. Released when the guard drops.
    pub async fn acquire(&self, spec_id: &SpecId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            // Entries nobody holds or waits on only cost memory.
            locks.retain(|id, l| id == spec_id || Arc::strong_count(l) > 1);
            locks.entry(spec_id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of specs with a live lock entry.
    pub fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
