//! Transaction receipts for bytecode-VM executions.
//!
//! A receipt is computed in memory when the VM finishes
//! ([ReceiptHandler::cache_receipt]), promoted to the block-scoped pending
//! list once its transaction commits, and flushed to the configured backend
//! in one atomic operation at EndBlock. Two backends exist: receipts written
//! into the versioned application store (retention follows store pruning),
//! and a bounded FIFO kept in the embedded aux store.

use std::collections::HashMap;

use bitvec::prelude::*;
use parking_lot::RwLock;
use rlp_derive::{RlpDecodable, RlpEncodable};
use serde::Serialize;
use sha3::Digest;
use thiserror::Error;

use crate::common::{Addr, Hash};
use crate::events::EventData;
use crate::evmaux::{
    height_key, receipt_key, AuxError, EvmAuxStore, BLOOM_PREFIX,
    LIST_HEAD_KEY, LIST_SIZE_KEY, LIST_TAIL_KEY, TX_HASH_PREFIX,
};
use crate::config::{AppConfig, ReceiptBackendKind};
use crate::state::State;

pub const RECEIPT_STATUS_SUCCESS: u32 = 1;
pub const RECEIPT_STATUS_FAILED: u32 = 0;

// application-store key prefixes for the unbounded backend
const RECEIPT_STATE_PREFIX: &[u8] = b"receipt";
const TX_HASH_STATE_PREFIX: &[u8] = b"txHash";
const BLOOM_STATE_PREFIX: &[u8] = b"bloomFilter";

#[derive(Error, Debug)]
pub enum ReceiptError {
    #[error(transparent)]
    Aux(#[from] AuxError),
    #[error("corrupt receipt record: {0}")]
    Corrupt(rlp::DecoderError),
    #[error("receipt list pointer chain broken at {0}")]
    BrokenChain(Hash),
}

impl From<rlp::DecoderError> for ReceiptError {
    fn from(e: rlp::DecoderError) -> Self {
        ReceiptError::Corrupt(e)
    }
}

/// Durable record of a bytecode-VM transaction outcome, keyed by a content
/// hash over every field except the hash itself.
#[derive(RlpEncodable, RlpDecodable, Serialize, Clone, Debug, PartialEq)]
pub struct EvmTxReceipt {
    pub tx_hash: Hash,
    pub block_hash: Hash,
    pub block_number: u64,
    pub tx_index: u32,
    pub nonce: u64,
    pub contract_addr: Addr,
    pub caller_addr: Addr,
    pub status: u32,
    pub events: Vec<EventData>,
}

impl EvmTxReceipt {
    /// Deterministic content hash; excludes `tx_hash`.
    pub fn compute_hash(&self) -> Hash {
        let mut stream = rlp::RlpStream::new_list(8);
        stream
            .append(&self.block_hash)
            .append(&self.block_number)
            .append(&self.tx_index)
            .append(&self.nonce)
            .append(&self.contract_addr)
            .append(&self.caller_addr)
            .append(&self.status)
            .append_list(&self.events);
        Hash::hash(&stream.out())
    }
}

pub const BLOOM_BITS: usize = 2048;

/// Per-height aggregate digest of event addresses and topics. Answers "can
/// this block contain a matching event" without replaying receipts.
#[derive(Clone, Debug, PartialEq)]
pub struct BloomFilter(BitVec<u8, Msb0>);

impl BloomFilter {
    pub fn new() -> Self {
        Self(BitVec::repeat(false, BLOOM_BITS))
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut bits = BitVec::from_vec(bytes.to_vec());
        bits.resize(BLOOM_BITS, false);
        Self(bits)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.clone().into_vec()
    }

    fn indices(item: &[u8]) -> [usize; 3] {
        let d = sha3::Keccak256::digest(item);
        let mut out = [0; 3];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = (((d[2 * i] as usize) << 8) | d[2 * i + 1] as usize) %
                BLOOM_BITS;
        }
        out
    }

    pub fn add(&mut self, item: &[u8]) {
        for idx in Self::indices(item) {
            self.0.set(idx, true);
        }
    }

    pub fn matches(&self, item: &[u8]) -> bool {
        Self::indices(item).into_iter().all(|idx| self.0[idx])
    }

    pub fn is_empty(&self) -> bool {
        self.0.not_any()
    }

    /// Digest over every event's contract address and topics.
    pub fn from_events(events: &[EventData]) -> Self {
        let mut bloom = Self::new();
        for ev in events {
            bloom.add(ev.contract.as_bytes());
            for topic in &ev.topics {
                bloom.add(topic);
            }
        }
        bloom
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable destination for a block's worth of receipts. `state` is the
/// EndBlock phase-1 sub-transaction; the store-backed backend writes through
/// it, the aux-backed backend ignores it.
pub trait ReceiptBackend: Send + Sync {
    fn commit_block(
        &self, state: &State, receipts: &[EvmTxReceipt], height: u64,
    ) -> Result<(), ReceiptError>;

    fn get_receipt(
        &self, state: &State, tx_hash: &Hash,
    ) -> Result<Option<EvmTxReceipt>, ReceiptError>;

    fn bloom_at(
        &self, state: &State, height: u64,
    ) -> Result<Option<BloomFilter>, ReceiptError>;

    fn tx_hashes_at(
        &self, state: &State, height: u64,
    ) -> Result<Vec<Hash>, ReceiptError>;
}

fn state_height_key(prefix: &[u8], height: u64) -> Vec<u8> {
    let mut k = prefix.to_vec();
    k.extend_from_slice(&height.to_le_bytes());
    k
}

fn state_receipt_key(tx_hash: &Hash) -> Vec<u8> {
    let mut k = RECEIPT_STATE_PREFIX.to_vec();
    k.extend_from_slice(tx_hash.as_bytes());
    k
}

/// Unbounded backend: receipts live in the versioned application store and
/// age out with store version pruning.
pub struct StateReceiptBackend;

impl ReceiptBackend for StateReceiptBackend {
    fn commit_block(
        &self, state: &State, receipts: &[EvmTxReceipt], height: u64,
    ) -> Result<(), ReceiptError> {
        if receipts.is_empty() {
            return Ok(())
        }
        let mut hashes = Vec::with_capacity(receipts.len());
        let mut events = Vec::new();
        for r in receipts {
            state.set(&state_receipt_key(&r.tx_hash), &rlp::encode(r));
            hashes.push(r.tx_hash.clone());
            events.extend_from_slice(&r.events);
        }
        state.set(
            &state_height_key(TX_HASH_STATE_PREFIX, height),
            &rlp::encode_list::<Hash, _>(&hashes),
        );
        state.set(
            &state_height_key(BLOOM_STATE_PREFIX, height),
            &BloomFilter::from_events(&events).to_bytes(),
        );
        Ok(())
    }

    fn get_receipt(
        &self, state: &State, tx_hash: &Hash,
    ) -> Result<Option<EvmTxReceipt>, ReceiptError> {
        match state.get(&state_receipt_key(tx_hash)) {
            None => Ok(None),
            Some(raw) => Ok(Some(rlp::decode(&raw)?)),
        }
    }

    fn bloom_at(
        &self, state: &State, height: u64,
    ) -> Result<Option<BloomFilter>, ReceiptError> {
        Ok(state
            .get(&state_height_key(BLOOM_STATE_PREFIX, height))
            .map(|raw| BloomFilter::from_bytes(&raw)))
    }

    fn tx_hashes_at(
        &self, state: &State, height: u64,
    ) -> Result<Vec<Hash>, ReceiptError> {
        match state.get(&state_height_key(TX_HASH_STATE_PREFIX, height)) {
            None => Ok(Vec::new()),
            Some(raw) => Ok(rlp::Rlp::new(&raw).as_list()?),
        }
    }
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug)]
struct ReceiptRecord {
    receipt: EvmTxReceipt,
    /// Hash of the receipt inserted right after this one; zero terminates.
    next: Hash,
}

/// Bounded backend: a singly linked FIFO in the embedded aux store. Head is
/// the oldest retained receipt; inserting past `max_receipts` evicts from the
/// head. List entries and the head/tail/size pointers always move in the same
/// atomic batch.
pub struct AuxReceiptBackend {
    aux: std::sync::Arc<EvmAuxStore>,
    max_receipts: u64,
}

impl AuxReceiptBackend {
    pub fn new(aux: std::sync::Arc<EvmAuxStore>, max_receipts: u64) -> Self {
        Self { aux, max_receipts }
    }

    fn load_record(&self, tx_hash: &Hash) -> Result<ReceiptRecord, ReceiptError> {
        match self.aux.get(&receipt_key(tx_hash))? {
            None => Err(ReceiptError::BrokenChain(tx_hash.clone())),
            Some(raw) => Ok(rlp::decode(&raw)?),
        }
    }

    /// Receipts reachable from the head, oldest first.
    pub fn walk(&self) -> Result<Vec<EvmTxReceipt>, ReceiptError> {
        let mut out = Vec::new();
        let mut cursor = self.aux.get_hash(LIST_HEAD_KEY)?;
        while let Some(h) = cursor {
            if h.is_zero() {
                break
            }
            let rec = self.load_record(&h)?;
            cursor = if rec.next.is_zero() {
                None
            } else {
                Some(rec.next.clone())
            };
            out.push(rec.receipt);
        }
        Ok(out)
    }

    pub fn size(&self) -> Result<u64, ReceiptError> {
        Ok(self.aux.get_u64(LIST_SIZE_KEY)?)
    }
}

impl ReceiptBackend for AuxReceiptBackend {
    fn commit_block(
        &self, _state: &State, receipts: &[EvmTxReceipt], height: u64,
    ) -> Result<(), ReceiptError> {
        if receipts.is_empty() {
            return Ok(())
        }
        let mut head = self.aux.get_hash(LIST_HEAD_KEY)?;
        let mut tail = self.aux.get_hash(LIST_TAIL_KEY)?;
        let mut size = self.aux.get_u64(LIST_SIZE_KEY)?;
        let mut batch = sled::Batch::default();
        // records written or rewritten by this commit; links between receipts
        // of the same block resolve here instead of the store
        let mut staged: HashMap<Hash, ReceiptRecord> = HashMap::new();

        let mut hashes = Vec::with_capacity(receipts.len());
        let mut events = Vec::new();
        for r in receipts {
            let h = r.tx_hash.clone();
            match &tail {
                None => head = Some(h.clone()),
                Some(t) => {
                    if let Some(prev) = staged.get_mut(t) {
                        prev.next = h.clone();
                    } else {
                        let mut prev = self.load_record(t)?;
                        prev.next = h.clone();
                        staged.insert(t.clone(), prev);
                    }
                }
            }
            staged.insert(
                h.clone(),
                ReceiptRecord {
                    receipt: r.clone(),
                    next: Hash::zero().clone(),
                },
            );
            tail = Some(h.clone());
            size += 1;
            hashes.push(h);
            events.extend_from_slice(&r.events);
        }

        if self.max_receipts > 0 {
            while size > self.max_receipts {
                let h = match &head {
                    Some(h) => h.clone(),
                    None => {
                        return Err(ReceiptError::BrokenChain(
                            Hash::zero().clone(),
                        ))
                    }
                };
                let rec = match staged.remove(&h) {
                    Some(rec) => rec,
                    None => self.load_record(&h)?,
                };
                batch.remove(receipt_key(&h));
                head = if rec.next.is_zero() {
                    None
                } else {
                    Some(rec.next)
                };
                size -= 1;
            }
        }
        if size == 0 {
            head = None;
            tail = None;
        }

        for (h, rec) in staged {
            batch.insert(receipt_key(&h), rlp::encode(&rec).to_vec());
        }
        match &head {
            Some(h) => batch.insert(LIST_HEAD_KEY, h.as_bytes()),
            None => batch.remove(LIST_HEAD_KEY),
        }
        match &tail {
            Some(t) => batch.insert(LIST_TAIL_KEY, t.as_bytes()),
            None => batch.remove(LIST_TAIL_KEY),
        }
        batch.insert(LIST_SIZE_KEY, &size.to_le_bytes()[..]);
        batch.insert(
            height_key(TX_HASH_PREFIX, height),
            rlp::encode_list::<Hash, _>(&hashes).to_vec(),
        );
        batch.insert(
            height_key(BLOOM_PREFIX, height),
            BloomFilter::from_events(&events).to_bytes(),
        );
        self.aux.apply(batch)?;
        Ok(())
    }

    fn get_receipt(
        &self, _state: &State, tx_hash: &Hash,
    ) -> Result<Option<EvmTxReceipt>, ReceiptError> {
        match self.aux.get(&receipt_key(tx_hash))? {
            None => Ok(None),
            Some(raw) => {
                let rec: ReceiptRecord = rlp::decode(&raw)?;
                Ok(Some(rec.receipt))
            }
        }
    }

    fn bloom_at(
        &self, _state: &State, height: u64,
    ) -> Result<Option<BloomFilter>, ReceiptError> {
        Ok(self
            .aux
            .get(&height_key(BLOOM_PREFIX, height))?
            .map(|raw| BloomFilter::from_bytes(&raw)))
    }

    fn tx_hashes_at(
        &self, _state: &State, height: u64,
    ) -> Result<Vec<Hash>, ReceiptError> {
        match self.aux.get(&height_key(TX_HASH_PREFIX, height))? {
            None => Ok(Vec::new()),
            Some(raw) => Ok(rlp::Rlp::new(&raw).as_list()?),
        }
    }
}

#[derive(Default)]
struct PendingReceipts {
    current: Option<EvmTxReceipt>,
    pending: Vec<EvmTxReceipt>,
}

/// Write path for receipts. The pending list and the in-flight receipt are
/// guarded by one reader/writer lock; query paths read them concurrently with
/// block processing.
pub struct ReceiptHandler {
    backend: Box<dyn ReceiptBackend>,
    inner: RwLock<PendingReceipts>,
}

impl ReceiptHandler {
    pub fn new(backend: Box<dyn ReceiptBackend>) -> Self {
        Self {
            backend,
            inner: RwLock::new(PendingReceipts::default()),
        }
    }

    /// Backend selection per node configuration.
    pub fn from_config(
        config: &AppConfig, aux: std::sync::Arc<EvmAuxStore>,
    ) -> Self {
        match config.receipt_backend {
            ReceiptBackendKind::Store => Self::new(Box::new(StateReceiptBackend)),
            ReceiptBackendKind::Bounded => Self::new(Box::new(
                AuxReceiptBackend::new(aux, config.max_receipts),
            )),
        }
    }

    /// Compute a receipt in memory from the current block header and the
    /// execution outcome. Not durable until the transaction and then the
    /// block commit it.
    pub fn cache_receipt(
        &self, state: &State, caller: Addr, contract: Addr,
        mut events: Vec<EventData>, success: bool,
    ) -> Hash {
        let header = state.block_header();
        for ev in events.iter_mut() {
            ev.block_height = header.height;
        }
        let mut inner = self.inner.write();
        let mut receipt = EvmTxReceipt {
            tx_hash: Hash::zero().clone(),
            block_hash: header.current_hash.clone(),
            block_number: header.height,
            tx_index: inner.pending.len() as u32,
            nonce: crate::tx::account_nonce(state, &caller),
            contract_addr: contract,
            caller_addr: caller,
            status: if success {
                RECEIPT_STATUS_SUCCESS
            } else {
                RECEIPT_STATUS_FAILED
            },
            events,
        };
        receipt.tx_hash = receipt.compute_hash();
        let hash = receipt.tx_hash.clone();
        inner.current = Some(receipt);
        hash
    }

    /// Promote the in-flight receipt into the block-scoped pending list.
    /// No-op when nothing is cached.
    pub fn commit_current(&self) {
        let mut inner = self.inner.write();
        if let Some(receipt) = inner.current.take() {
            inner.pending.push(receipt);
        }
    }

    /// Drop the in-flight receipt; used when its transaction failed.
    pub fn discard_current(&self) {
        self.inner.write().current.take();
    }

    pub fn current_receipt(&self) -> Option<EvmTxReceipt> {
        self.inner.read().current.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.read().pending.len()
    }

    pub fn get_pending_receipt(&self, tx_hash: &Hash) -> Option<EvmTxReceipt> {
        self.inner
            .read()
            .pending
            .iter()
            .find(|r| &r.tx_hash == tx_hash)
            .cloned()
    }

    /// Flush the whole pending list to the backend in one atomic operation.
    /// The pending list is cleared unconditionally, even when the flush
    /// fails.
    pub fn commit_block(
        &self, state: &State, height: u64,
    ) -> Result<(), ReceiptError> {
        let taken = {
            let mut inner = self.inner.write();
            inner.current.take();
            std::mem::take(&mut inner.pending)
        };
        self.backend.commit_block(state, &taken, height)
    }

    pub fn get_receipt(
        &self, state: &State, tx_hash: &Hash,
    ) -> Result<Option<EvmTxReceipt>, ReceiptError> {
        self.backend.get_receipt(state, tx_hash)
    }

    pub fn bloom_at(
        &self, state: &State, height: u64,
    ) -> Result<Option<BloomFilter>, ReceiptError> {
        self.backend.bloom_at(state, height)
    }

    pub fn tx_hashes_at(
        &self, state: &State, height: u64,
    ) -> Result<Vec<Hash>, ReceiptError> {
        self.backend.tx_hashes_at(state, height)
    }
}
