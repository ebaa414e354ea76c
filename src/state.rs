//! Read/write view over the versioned store scoped to one block.
//!
//! A [State] wraps the current sub-transaction; a [Snapshot] wraps a released
//! point-in-time read view. Both share the same core so queries and block
//! processing go through one interface. Derived views made with
//! [with_prefix](State::with_prefix)/[with_context](State::with_context) are
//! live: they share the underlying sub-transaction and the validator cache.

use std::sync::Arc;

use log::warn;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{Addr, Bytes, Hash};
use crate::store::{KVPair, KVReader, KVWriter, StoreSnapshot, StoreTx};

/// Keys gating optional chain behavior live under this prefix, one byte each.
pub const FEATURE_PREFIX: &[u8] = b"feature";

#[derive(Error, Debug)]
pub enum StateError {
    #[error("no validator resolver attached to this state")]
    NoValidatorResolver,
    #[error("validator resolution failed: {0}")]
    ValidatorResolution(String),
}

/// Immutable once attached to a state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub chain_id: String,
    pub height: u64,
    pub time: i64,
    pub last_block_hash: Hash,
    pub current_hash: Hash,
    pub num_txs: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    pub pub_key: Bytes,
    pub power: i64,
}

/// Values carried alongside a state for downstream auth hooks; the signature
/// middleware records the recovered origin here before dispatch.
#[derive(Clone, Debug, Default)]
pub struct TxContext {
    pub origin: Option<Addr>,
}

pub type GetValidatorSet =
    Arc<dyn Fn(&State) -> Result<Vec<Validator>, StateError> + Send + Sync>;

type ValidatorCache = Arc<RwLock<Option<Arc<Vec<Validator>>>>>;

#[derive(Clone)]
enum StoreView {
    Tx(Arc<StoreTx>),
    Snap(Arc<dyn StoreSnapshot>),
}

impl StoreView {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self {
            StoreView::Tx(tx) => tx.get(key),
            StoreView::Snap(s) => s.get(key),
        }
    }

    fn has(&self, key: &[u8]) -> bool {
        match self {
            StoreView::Tx(tx) => tx.has(key),
            StoreView::Snap(s) => s.has(key),
        }
    }

    fn range(&self, prefix: &[u8]) -> Vec<KVPair> {
        match self {
            StoreView::Tx(tx) => tx.range(prefix),
            StoreView::Snap(s) => s.range(prefix),
        }
    }

    fn set(&self, key: &[u8], value: &[u8]) {
        match self {
            StoreView::Tx(tx) => tx.set(key, value),
            StoreView::Snap(_) => warn!("write dropped on read-only state"),
        }
    }

    fn delete(&self, key: &[u8]) {
        match self {
            StoreView::Tx(tx) => tx.delete(key),
            StoreView::Snap(_) => warn!("delete dropped on read-only state"),
        }
    }
}

#[derive(Clone)]
pub struct State {
    view: StoreView,
    prefix: Vec<u8>,
    header: Arc<BlockHeader>,
    ctx: Arc<TxContext>,
    validators: ValidatorCache,
    resolver: Option<GetValidatorSet>,
}

impl State {
    pub fn new(
        tx: Arc<StoreTx>, header: BlockHeader,
        resolver: Option<GetValidatorSet>,
    ) -> Self {
        Self {
            view: StoreView::Tx(tx),
            prefix: Vec::new(),
            header: Arc::new(header),
            ctx: Arc::new(TxContext::default()),
            validators: Arc::new(RwLock::new(None)),
            resolver,
        }
    }

    fn data_key(&self, key: &[u8]) -> Vec<u8> {
        let mut k = self.prefix.clone();
        k.extend_from_slice(key);
        k
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.view.get(&self.data_key(key))
    }

    pub fn has(&self, key: &[u8]) -> bool {
        self.view.has(&self.data_key(key))
    }

    pub fn set(&self, key: &[u8], value: &[u8]) {
        self.view.set(&self.data_key(key), value)
    }

    pub fn delete(&self, key: &[u8]) {
        self.view.delete(&self.data_key(key))
    }

    /// Entries under `prefix` (relative to this view), keys stripped of the
    /// view prefix.
    pub fn range(&self, prefix: &[u8]) -> Vec<KVPair> {
        let full = self.data_key(prefix);
        self.view
            .range(&full)
            .into_iter()
            .map(|(k, v)| (k[self.prefix.len()..].to_vec(), v))
            .collect()
    }

    /// A live view whose keys are transparently prefixed; shares this state's
    /// sub-transaction, context and validator cache.
    pub fn with_prefix(&self, prefix: &[u8]) -> State {
        let mut out = self.clone();
        out.prefix.extend_from_slice(prefix);
        out
    }

    pub fn with_context(&self, ctx: TxContext) -> State {
        let mut out = self.clone();
        out.ctx = Arc::new(ctx);
        out
    }

    pub fn context(&self) -> &TxContext {
        &self.ctx
    }

    pub fn block_header(&self) -> &BlockHeader {
        &self.header
    }

    // Feature flags are chain-global: they bypass the view prefix.

    fn feature_key(name: &str) -> Vec<u8> {
        let mut k = FEATURE_PREFIX.to_vec();
        k.extend_from_slice(name.as_bytes());
        k
    }

    /// Absent key yields `default`; a stored byte other than 0x01 reads as
    /// disabled.
    pub fn feature_enabled(&self, name: &str, default: bool) -> bool {
        match self.view.get(&Self::feature_key(name)) {
            Some(v) => v.first() == Some(&0x01),
            None => default,
        }
    }

    pub fn set_feature(&self, name: &str, enabled: bool) {
        let v = [if enabled { 0x01 } else { 0x00 }];
        self.view.set(&Self::feature_key(name), &v)
    }

    /// Validator set, resolved at most once per state family and cached for
    /// its lifetime. The cache is shared by derived views and is never
    /// invalidated mid-lifetime, even if a hook changes the set underneath.
    pub fn validators(&self) -> Result<Arc<Vec<Validator>>, StateError> {
        if let Some(cached) = self.validators.read().as_ref() {
            return Ok(cached.clone())
        }
        let resolver =
            self.resolver.as_ref().ok_or(StateError::NoValidatorResolver)?;
        let resolved = Arc::new((**resolver)(self)?);
        *self.validators.write() = Some(resolved.clone());
        Ok(resolved)
    }
}

/// Read-only view over a committed version, owning the releasable snapshot
/// resource. All data operations delegate to the embedded state core.
pub struct Snapshot {
    state: State,
    snap: Arc<dyn StoreSnapshot>,
}

impl Snapshot {
    pub fn new(snap: Arc<dyn StoreSnapshot>, header: BlockHeader) -> Self {
        let state = State {
            view: StoreView::Snap(snap.clone()),
            prefix: Vec::new(),
            header: Arc::new(header),
            ctx: Arc::new(TxContext::default()),
            validators: Arc::new(RwLock::new(None)),
            resolver: None,
        };
        Self { state, snap }
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.get(key)
    }

    pub fn has(&self, key: &[u8]) -> bool {
        self.state.has(key)
    }

    pub fn range(&self, prefix: &[u8]) -> Vec<KVPair> {
        self.state.range(prefix)
    }

    pub fn block_header(&self) -> &BlockHeader {
        self.state.block_header()
    }

    /// Read-only state view for running queries and static calls.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Release the underlying store resource. Idempotent; reads afterwards
    /// return nothing.
    pub fn release(&self) {
        self.snap.release()
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.snap.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, VersionedStore};

    fn make_state(resolver: Option<GetValidatorSet>) -> (Arc<MemStore>, State) {
        let store = MemStore::new();
        let tx = StoreTx::new(store.clone());
        (store, State::new(tx, BlockHeader::default(), resolver))
    }

    #[test]
    fn prefix_views_are_live_and_isolated() {
        let (_store, state) = make_state(None);
        let a = state.with_prefix(b"a/");
        let b = state.with_prefix(b"b/");
        a.set(b"k", b"1");
        b.set(b"k", b"2");
        assert_eq!(a.get(b"k").as_deref(), Some(&b"1"[..]));
        assert_eq!(b.get(b"k").as_deref(), Some(&b"2"[..]));
        assert_eq!(state.get(b"a/k").as_deref(), Some(&b"1"[..]));
        assert_eq!(a.range(b""), vec![(b"k".to_vec(), b"1".to_vec())]);
    }

    #[test]
    fn feature_flags_default_and_bytes() {
        let (_store, state) = make_state(None);
        assert!(state.feature_enabled("tx:nonce", true));
        assert!(!state.feature_enabled("tx:nonce", false));
        state.set_feature("tx:nonce", true);
        assert!(state.feature_enabled("tx:nonce", false));
        state.set_feature("tx:nonce", false);
        assert!(!state.feature_enabled("tx:nonce", true));
        // feature keys are not subject to view prefixes
        let sub = state.with_prefix(b"sub/");
        assert!(sub.feature_enabled("tx:nonce", true) == false);
    }

    #[test]
    fn validators_resolve_once_and_share_across_views() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let resolver: GetValidatorSet = Arc::new(move |_s| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Validator {
                pub_key: (&b"v1"[..]).into(),
                power: 10,
            }])
        });
        let (_store, state) = make_state(Some(resolver));
        let derived = state.with_prefix(b"p/");
        assert_eq!(state.validators().unwrap().len(), 1);
        assert_eq!(derived.validators().unwrap().len(), 1);
        assert_eq!(state.validators().unwrap()[0].power, 10);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshot_reads_and_release() {
        let store = MemStore::new();
        store.set(b"k", b"1");
        store.save_version().unwrap();
        let snap = Snapshot::new(store.snapshot(), BlockHeader::default());
        assert_eq!(snap.get(b"k").as_deref(), Some(&b"1"[..]));
        snap.release();
        snap.release();
        assert!(snap.get(b"k").is_none());
    }
}
