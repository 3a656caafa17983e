//! Per-thread serialization.
//!
//! Every inbound message and every scheduled-job dispatch for a thread
//! runs under that thread's lock, so a single conversation is processed
//! strictly in arrival order while different conversations proceed in
//! parallel. The locks are cooperative (`tokio::sync::Mutex`): waiting
//! never blocks the runtime, and guards release on every exit path.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Registry of one async mutex per thread id.
#[derive(Default)]
pub struct ThreadLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `thread_id`, creating it on first use. The
    /// returned guard serializes the caller against every other holder
    /// of the same thread's lock.
    pub async fn acquire(&self, thread_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(thread_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
