//! Interfaces the runtime consumes from the versioned key-value store, plus a
//! deterministic in-memory implementation.
//!
//! The production hash-tree engine lives outside this crate; everything here
//! is written against [VersionedStore]. Writes take `&self` (the handle is
//! shared between the block pipeline and query paths) and buffer through
//! [StoreTx], the atomic sub-transaction used by every block-processing phase.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::warn;
use parking_lot::RwLock;
use sha3::Digest;
use thiserror::Error;

use crate::common::Hash;

pub type KVPair = (Vec<u8>, Vec<u8>);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("unknown store version {0}")]
    UnknownVersion(u64),
}

pub trait KVReader: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// All entries whose key starts with `prefix`, in ascending key order.
    fn range(&self, prefix: &[u8]) -> Vec<KVPair>;
}

pub trait KVWriter {
    fn set(&self, key: &[u8], value: &[u8]);
    fn delete(&self, key: &[u8]);
}

/// A point-in-time read view of a committed version. Must be released when the
/// caller is done with it; holding snapshots impedes store compaction.
pub trait StoreSnapshot: KVReader {
    /// Idempotent; reads after release return nothing.
    fn release(&self);
}

/// The versioned application store. Each [save_version](Self::save_version)
/// freezes the live contents into an immutable, hash-addressed version.
pub trait VersionedStore: KVReader + KVWriter + Send + Sync {
    /// Number of committed versions so far.
    fn version(&self) -> u64;

    /// Content hash of the last committed version.
    fn app_hash(&self) -> Hash;

    fn save_version(&self) -> Result<(Hash, u64), StoreError>;

    /// Drop saved versions older than the most recent `keep_recent`.
    fn prune_versions(&self, keep_recent: u64) -> Result<(), StoreError>;

    /// Snapshot of the last committed version.
    fn snapshot(&self) -> Arc<dyn StoreSnapshot>;
}

pub type SharedStore = Arc<dyn VersionedStore>;

/// First key past all keys carrying `prefix`, or None when the prefix is the
/// upper end of the keyspace.
fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(end)
        }
        end.pop();
    }
    None
}

fn range_of<'a>(
    map: &'a BTreeMap<Vec<u8>, Option<Vec<u8>>>, prefix: &[u8],
) -> impl Iterator<Item = (&'a Vec<u8>, &'a Option<Vec<u8>>)> {
    use std::ops::Bound;
    let upper = match prefix_end(prefix) {
        Some(end) => Bound::Excluded(end),
        None => Bound::Unbounded,
    };
    map.range((Bound::Included(prefix.to_vec()), upper))
}

/// Buffered, all-or-nothing batch of writes over a shared store. Reads see
/// the buffer first and fall through to the parent. Exactly one of
/// [commit](Self::commit) or [rollback](Self::rollback) ends the transaction;
/// sub-transactions never nest.
pub struct StoreTx {
    parent: SharedStore,
    // None marks a buffered delete
    ops: RwLock<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl StoreTx {
    pub fn new(parent: SharedStore) -> Arc<Self> {
        Arc::new(Self {
            parent,
            ops: RwLock::new(BTreeMap::new()),
        })
    }

    /// Apply every buffered write to the parent store in key order.
    pub fn commit(&self) {
        let mut ops = self.ops.write();
        for (key, op) in std::mem::take(&mut *ops) {
            match op {
                Some(val) => self.parent.set(&key, &val),
                None => self.parent.delete(&key),
            }
        }
    }

    /// Discard every buffered write.
    pub fn rollback(&self) {
        self.ops.write().clear();
    }

    pub fn pending_writes(&self) -> usize {
        self.ops.read().len()
    }
}

impl KVReader for StoreTx {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.ops.read().get(key) {
            Some(op) => op.clone(),
            None => self.parent.get(key),
        }
    }

    fn has(&self, key: &[u8]) -> bool {
        match self.ops.read().get(key) {
            Some(op) => op.is_some(),
            None => self.parent.has(key),
        }
    }

    fn range(&self, prefix: &[u8]) -> Vec<KVPair> {
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = self
            .parent
            .range(prefix)
            .into_iter()
            .map(|(k, v)| (k, Some(v)))
            .collect();
        let ops = self.ops.read();
        for (k, op) in range_of(&ops, prefix) {
            merged.insert(k.clone(), op.clone());
        }
        merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect()
    }
}

impl KVWriter for StoreTx {
    fn set(&self, key: &[u8], value: &[u8]) {
        self.ops.write().insert(key.to_vec(), Some(value.to_vec()));
    }

    fn delete(&self, key: &[u8]) {
        self.ops.write().insert(key.to_vec(), None);
    }
}

/// In-memory versioned store. `save_version` freezes the live map and digests
/// its sorted contents, so two nodes applying the same writes produce the same
/// app hash. Used by tests and demos; the interface is what matters.
pub struct MemStore {
    inner: RwLock<MemStoreInner>,
}

struct MemStoreInner {
    live: BTreeMap<Vec<u8>, Vec<u8>>,
    saved: BTreeMap<u64, Arc<BTreeMap<Vec<u8>, Vec<u8>>>>,
    version: u64,
    app_hash: Hash,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(MemStoreInner {
                live: BTreeMap::new(),
                saved: BTreeMap::new(),
                version: 0,
                app_hash: Hash::zero().clone(),
            }),
        })
    }

    fn digest(map: &BTreeMap<Vec<u8>, Vec<u8>>) -> Hash {
        let mut hasher = sha3::Keccak256::new();
        for (k, v) in map.iter() {
            hasher.update((k.len() as u64).to_le_bytes());
            hasher.update(k);
            hasher.update((v.len() as u64).to_le_bytes());
            hasher.update(v);
        }
        Hash::from_slice(hasher.finalize().as_slice())
    }

    pub fn saved_versions(&self) -> Vec<u64> {
        self.inner.read().saved.keys().copied().collect()
    }
}

impl KVReader for MemStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.read().live.get(key).cloned()
    }

    fn has(&self, key: &[u8]) -> bool {
        self.inner.read().live.contains_key(key)
    }

    fn range(&self, prefix: &[u8]) -> Vec<KVPair> {
        use std::ops::Bound;
        let upper = match prefix_end(prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        self.inner
            .read()
            .live
            .range((Bound::Included(prefix.to_vec()), upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl KVWriter for MemStore {
    fn set(&self, key: &[u8], value: &[u8]) {
        self.inner.write().live.insert(key.to_vec(), value.to_vec());
    }

    fn delete(&self, key: &[u8]) {
        self.inner.write().live.remove(key);
    }
}

impl VersionedStore for MemStore {
    fn version(&self) -> u64 {
        self.inner.read().version
    }

    fn app_hash(&self) -> Hash {
        self.inner.read().app_hash.clone()
    }

    fn save_version(&self) -> Result<(Hash, u64), StoreError> {
        let mut inner = self.inner.write();
        inner.version += 1;
        inner.app_hash = Self::digest(&inner.live);
        let frozen = Arc::new(inner.live.clone());
        let version = inner.version;
        inner.saved.insert(version, frozen);
        Ok((inner.app_hash.clone(), version))
    }

    fn prune_versions(&self, keep_recent: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let cutoff = inner.version.saturating_sub(keep_recent);
        inner.saved.retain(|v, _| *v > cutoff);
        Ok(())
    }

    fn snapshot(&self) -> Arc<dyn StoreSnapshot> {
        let inner = self.inner.read();
        let data = inner
            .saved
            .get(&inner.version)
            .cloned()
            .unwrap_or_else(|| Arc::new(BTreeMap::new()));
        Arc::new(MemSnapshot {
            data: RwLock::new(Some(data)),
        })
    }
}

pub struct MemSnapshot {
    data: RwLock<Option<Arc<BTreeMap<Vec<u8>, Vec<u8>>>>>,
}

impl KVReader for MemSnapshot {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match &*self.data.read() {
            Some(data) => data.get(key).cloned(),
            None => {
                warn!("read from a released snapshot");
                None
            }
        }
    }

    fn range(&self, prefix: &[u8]) -> Vec<KVPair> {
        use std::ops::Bound;
        let data = match &*self.data.read() {
            Some(data) => data.clone(),
            None => {
                warn!("range over a released snapshot");
                return Vec::new()
            }
        };
        let upper = match prefix_end(prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        data.range((Bound::Included(prefix.to_vec()), upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl StoreSnapshot for MemSnapshot {
    fn release(&self) {
        self.data.write().take();
    }
}
