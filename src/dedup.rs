// ===============================
// src/dedup.rs
// ===============================
//
// Bounded FIFO set of dedup keys.
// - check_and_insert: test-and-set, false when the key is already resident.
// - Full store: the oldest half of the insertion order is dropped in one go.
// - State can be saved/loaded as a JSON array (oldest first).
//
use ahash::AHashSet;
use std::collections::VecDeque;
use std::path::Path;
use tracing::{info, warn};

use crate::error::StoreError;

pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug)]
pub struct DedupStore {
    capacity: usize,
    order: VecDeque<String>,
    seen: AHashSet<String>,
    dirty: bool,
}

impl DedupStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: AHashSet::with_capacity(capacity),
            dirty: false,
        }
    }

    /// Returns true when the key was not present and has been inserted.
    pub fn check_and_insert(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            self.evict_oldest_half();
        }
        self.order.push_back(key.to_string());
        self.seen.insert(key.to_string());
        self.dirty = true;
        true
    }

    fn evict_oldest_half(&mut self) {
        let n = self.order.len() / 2;
        for k in self.order.drain(..n) {
            self.seen.remove(&k);
        }
    }

    pub fn len(&self) -> usize { self.order.len() }

    pub fn contains(&self, key: &str) -> bool { self.seen.contains(key) }

    pub fn is_dirty(&self) -> bool { self.dirty }

    /// Loads keys saved by `save`; only the newest `capacity` survive.
    /// A missing or unreadable file yields an empty store.
    pub async fn load(path: &Path, capacity: usize) -> Self {
        let mut store = Self::new(capacity);
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return store,
            Err(e) => {
                warn!(?e, path = %path.display(), "dedup: state unreadable, starting empty");
                return store;
            }
        };
        let keys: Vec<String> = match serde_json::from_slice(&bytes) {
            Ok(k) => k,
            Err(e) => {
                warn!(?e, path = %path.display(), "dedup: state corrupt, starting empty");
                return store;
            }
        };
        let skip = keys.len().saturating_sub(store.capacity);
        for k in keys.into_iter().skip(skip) {
            if store.seen.insert(k.clone()) {
                store.order.push_back(k);
            }
        }
        info!(keys = store.len(), path = %path.display(), "dedup: state loaded");
        store
    }

    pub async fn save(&mut self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let keys: Vec<&String> = self.order.iter().collect();
        let body = serde_json::to_vec(&keys)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await?;
        self.dirty = false;
        Ok(())
    }
}
