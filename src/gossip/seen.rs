//! Per-session set of `(namespace, key)` pairs the initiator mentioned.

use std::collections::HashSet;
use std::sync::Mutex;

/// Keys the initiator offered during remote phase 1.
///
/// Scoped to one session; phase 2 skips these when pushing objects back.
#[derive(Debug, Default)]
pub struct SeenSet {
    keys: Mutex<HashSet<(String, Vec<u8>)>>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, namespace: &str, key: &[u8]) {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.insert((namespace.to_string(), key.to_vec()));
    }

    pub fn contains(&self, namespace: &str, key: &[u8]) -> bool {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        // Allocation per lookup; the tuple key can't borrow.
        keys.contains(&(namespace.to_string(), key.to_vec()))
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
