//! Peer registry: process-wide collection of accepted client connections.
//!
//! Guarded by `peer_lock`, a separate short-critical-section mutex from
//! `instance_lock` — insert/remove only, never held across socket I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::task::JoinHandle;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

pub type PeerId = u64;

pub fn next_peer_id() -> PeerId {
    NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed)
}

pub struct PeerHandle {
    pub task: JoinHandle<()>,
}

#[derive(Default)]
pub struct PeerRegistry {
    inner: Mutex<HashMap<PeerId, PeerHandle>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        PeerRegistry {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, id: PeerId, handle: PeerHandle) {
        self.inner.lock().expect("peer_lock poisoned").insert(id, handle);
    }

    pub fn remove(&self, id: PeerId) -> Option<PeerHandle> {
        self.inner.lock().expect("peer_lock poisoned").remove(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("peer_lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_remove() {
        let reg = PeerRegistry::new();
        let id = next_peer_id();
        let task = tokio::spawn(async {});
        reg.insert(id, PeerHandle { task });
        assert_eq!(reg.len(), 1);
        let handle = reg.remove(id).expect("present");
        let _ = handle.task.await;
        assert!(reg.is_empty());
    }

    #[test]
    fn ids_are_distinct() {
        let a = next_peer_id();
        let b = next_peer_id();
        assert_ne!(a, b);
    }
}
