//! The block-lifecycle state machine driven by the consensus engine.
//!
//! Call order per height: `begin_block` → `check_tx`*/`deliver_tx`* →
//! `end_block` → `commit`. Every phase opens its own atomic sub-transaction
//! over the shared store; a rollback in one phase never affects a sibling
//! that already committed. Errors split into two kinds: recoverable
//! transaction failures surface as non-zero response codes, while
//! [FatalError] means continuing risks a silent fork: the node boundary
//! must stop the process when it sees one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, warn};
use thiserror::Error;

use crate::common::{Bytes, Hash};
use crate::config::AppConfig;
use crate::events::{EventDispatcher, EventHandler};
use crate::evmaux::EvmAuxStore;
use crate::receipts::ReceiptHandler;
use crate::state::{
    BlockHeader, GetValidatorSet, Snapshot, State, Validator,
};
use crate::store::{SharedStore, StoreTx, VersionedStore};
use crate::tx::{Tag, TxError, TxHandler, TxHandlerResult, CALL_EVM, DEPLOY_EVM};

pub const CODE_OK: u32 = 0;
pub const CODE_ERR: u32 = 1;

pub type HookResult<T> =
    Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Invariant violations that make further correct processing provably
/// impossible. The boundary that drives this Application must terminate the
/// process on any of these.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("block height {got} does not match app height {expected}")]
    HeightMismatch { expected: u64, got: u64 },
    #[error("init chain at app height {0}, expected 1")]
    LateInitChain(u64),
    #[error("no block in progress")]
    NoCurrentBlock,
    #[error("mandatory {hook} hook failed: {reason}")]
    Hook { hook: &'static str, reason: String },
    #[error("store persistence failed at height {height}: {reason}")]
    Persistence { height: u64, reason: String },
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("no query handler registered")]
    NoHandler,
    #[error("query failed: {0}")]
    Handler(String),
}

enum TxRejection {
    Admission(String),
    Handler(TxError),
}

impl fmt::Display for TxRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxRejection::Admission(msg) => write!(f, "{}", msg),
            TxRejection::Handler(e) => write!(f, "{}", e),
        }
    }
}

pub struct InitChainRequest {
    pub chain_id: String,
    pub time: i64,
    pub validators: Vec<Validator>,
}

pub struct InfoResponse {
    pub last_block_height: u64,
    pub last_block_app_hash: Hash,
}

/// Status code plus log string plus opaque result bytes/tags, the shape both
/// CheckTx and DeliverTx answer with.
#[derive(Debug, Default)]
pub struct TxResponse {
    pub code: u32,
    pub data: Bytes,
    pub log: String,
    pub tags: Vec<Tag>,
}

pub type InitFn =
    Box<dyn FnOnce(&State, &InitChainRequest) -> HookResult<()> + Send>;

pub trait ValidatorManager: Send + Sync {
    fn begin_block(
        &self, state: &State, header: &BlockHeader,
    ) -> HookResult<()>;

    /// Returns validator-set updates for the consensus engine.
    fn end_block(&self, state: &State) -> HookResult<Vec<Validator>>;
}

pub trait ChainConfigManager: Send + Sync {
    /// Auto-enable features that reached their activation condition.
    fn enable_features(&self, state: &State) -> HookResult<()>;
}

pub trait ContractUpkeepHandler: Send + Sync {
    fn upkeep(&self, state: &State) -> HookResult<()>;
}

/// Per-height origin admission: reset at BeginBlock, consulted by CheckTx.
pub trait OriginGuard: Send + Sync {
    fn reset(&self, height: u64);
    fn validate(&self, state: &State, tx_bytes: &[u8]) -> HookResult<()>;
}

pub trait QueryHandler: Send + Sync {
    fn handle(
        &self, snapshot: &Snapshot, path: &str, data: &[u8],
    ) -> HookResult<Bytes>;
}

/// Process-wide counters, constructed once at bootstrap and passed in
/// explicitly.
#[derive(Default)]
pub struct Metrics {
    pub blocks_committed: AtomicU64,
    pub txs_processed: AtomicU64,
    pub txs_failed: AtomicU64,
    pub receipt_flushes_failed: AtomicU64,
    pub block_events_dropped: AtomicU64,
}

impl Metrics {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Application {
    store: SharedStore,
    aux: Arc<EvmAuxStore>,
    config: AppConfig,
    tx_handler: Arc<dyn TxHandler>,
    receipts: Arc<ReceiptHandler>,
    events: Arc<dyn EventHandler>,
    dispatcher: EventDispatcher,
    metrics: Arc<Metrics>,
    resolver: Option<GetValidatorSet>,
    init: Option<InitFn>,
    validator_manager: Option<Arc<dyn ValidatorManager>>,
    chain_config: Option<Arc<dyn ChainConfigManager>>,
    upkeep: Option<Arc<dyn ContractUpkeepHandler>>,
    origin_guard: Option<Arc<dyn OriginGuard>>,
    query_handler: Option<Arc<dyn QueryHandler>>,
    last_block_header: Option<BlockHeader>,
    cur_block_header: Option<BlockHeader>,
}

impl Application {
    pub fn new(
        store: SharedStore, aux: Arc<EvmAuxStore>, config: AppConfig,
        tx_handler: Arc<dyn TxHandler>, receipts: Arc<ReceiptHandler>,
        events: Arc<dyn EventHandler>, metrics: Arc<Metrics>,
    ) -> Self {
        let dispatcher =
            EventDispatcher::new(events.clone(), config.event_queue_size);
        Self {
            store,
            aux,
            config,
            tx_handler,
            receipts,
            events,
            dispatcher,
            metrics,
            resolver: None,
            init: None,
            validator_manager: None,
            chain_config: None,
            upkeep: None,
            origin_guard: None,
            query_handler: None,
            last_block_header: None,
            cur_block_header: None,
        }
    }

    pub fn with_init(mut self, init: InitFn) -> Self {
        self.init = Some(init);
        self
    }

    pub fn with_validator_manager(
        mut self, manager: Arc<dyn ValidatorManager>,
    ) -> Self {
        self.validator_manager = Some(manager);
        self
    }

    pub fn with_chain_config(
        mut self, manager: Arc<dyn ChainConfigManager>,
    ) -> Self {
        self.chain_config = Some(manager);
        self
    }

    pub fn with_upkeep(
        mut self, upkeep: Arc<dyn ContractUpkeepHandler>,
    ) -> Self {
        self.upkeep = Some(upkeep);
        self
    }

    pub fn with_origin_guard(mut self, guard: Arc<dyn OriginGuard>) -> Self {
        self.origin_guard = Some(guard);
        self
    }

    pub fn with_query_handler(
        mut self, handler: Arc<dyn QueryHandler>,
    ) -> Self {
        self.query_handler = Some(handler);
        self
    }

    pub fn with_validator_resolver(
        mut self, resolver: GetValidatorSet,
    ) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Always `store.version() + 1`: the height the next block must carry.
    pub fn height(&self) -> u64 {
        self.store.version() + 1
    }

    pub fn receipts(&self) -> &Arc<ReceiptHandler> {
        &self.receipts
    }

    pub fn info(&self) -> InfoResponse {
        InfoResponse {
            last_block_height: self.store.version(),
            last_block_app_hash: self.store.app_hash(),
        }
    }

    fn block_state(&self, tx: Arc<StoreTx>, header: BlockHeader) -> State {
        State::new(tx, header, self.resolver.clone())
    }

    /// One-time genesis initialization. Must run before any block.
    pub fn init_chain(
        &mut self, request: InitChainRequest,
    ) -> Result<(), FatalError> {
        if self.height() != 1 {
            return Err(FatalError::LateInitChain(self.height()))
        }
        let init = match self.init.take() {
            Some(init) => init,
            None => return Ok(()),
        };
        let header = BlockHeader {
            chain_id: request.chain_id.clone(),
            time: request.time,
            ..Default::default()
        };
        let tx = StoreTx::new(self.store.clone());
        let state = self.block_state(tx.clone(), header);
        match init(&state, &request) {
            Ok(()) => {
                tx.commit();
                Ok(())
            }
            Err(e) => {
                tx.rollback();
                Err(FatalError::Hook {
                    hook: "genesis init",
                    reason: e.to_string(),
                })
            }
        }
    }

    pub fn begin_block(
        &mut self, header: BlockHeader,
    ) -> Result<(), FatalError> {
        if header.height != self.height() {
            return Err(FatalError::HeightMismatch {
                expected: self.height(),
                got: header.height,
            })
        }

        // phase (a): contract upkeep, committed on its own
        if let Some(upkeep) = &self.upkeep {
            let tx = StoreTx::new(self.store.clone());
            let state = self.block_state(tx.clone(), header.clone());
            match upkeep.upkeep(&state) {
                Ok(()) => tx.commit(),
                Err(e) => {
                    tx.rollback();
                    return Err(FatalError::Hook {
                        hook: "contract upkeep",
                        reason: e.to_string(),
                    })
                }
            }
        }

        // phase (b): per-height origin admission reset
        if let Some(guard) = &self.origin_guard {
            guard.reset(header.height);
        }

        // phase (c): validator + chain-config hooks, committed together
        let tx = StoreTx::new(self.store.clone());
        let state = self.block_state(tx.clone(), header.clone());
        if let Some(manager) = &self.validator_manager {
            if let Err(e) = manager.begin_block(&state, &header) {
                tx.rollback();
                return Err(FatalError::Hook {
                    hook: "validator begin-block",
                    reason: e.to_string(),
                })
            }
        }
        if let Some(chain_config) = &self.chain_config {
            if let Err(e) = chain_config.enable_features(&state) {
                tx.rollback();
                return Err(FatalError::Hook {
                    hook: "chain config",
                    reason: e.to_string(),
                })
            }
        }
        tx.commit();

        self.cur_block_header = Some(header);
        Ok(())
    }

    fn cur_header(&self) -> Result<BlockHeader, FatalError> {
        self.cur_block_header
            .clone()
            .ok_or(FatalError::NoCurrentBlock)
    }

    pub fn check_tx(
        &mut self, tx_bytes: &[u8],
    ) -> Result<TxResponse, FatalError> {
        let header = self.cur_header()?;
        Ok(Self::tx_response(self.process_tx(header, tx_bytes, true)))
    }

    pub fn deliver_tx(
        &mut self, tx_bytes: &[u8],
    ) -> Result<TxResponse, FatalError> {
        let header = self.cur_header()?;
        Ok(Self::tx_response(self.process_tx(header, tx_bytes, false)))
    }

    fn tx_response(
        result: Result<TxHandlerResult, TxRejection>,
    ) -> TxResponse {
        match result {
            Ok(r) => TxResponse {
                code: CODE_OK,
                data: r.data,
                log: String::new(),
                tags: r.tags,
            },
            Err(e) => TxResponse {
                code: CODE_ERR,
                log: e.to_string(),
                ..Default::default()
            },
        }
    }

    /// Shared CheckTx/DeliverTx path. One sub-transaction per transaction;
    /// CheckTx never commits it.
    fn process_tx(
        &self, header: BlockHeader, tx_bytes: &[u8], is_check: bool,
    ) -> Result<TxHandlerResult, TxRejection> {
        let tx = StoreTx::new(self.store.clone());
        let state = self.block_state(tx.clone(), header);

        if is_check {
            if let Some(guard) = &self.origin_guard {
                if let Err(e) = guard.validate(&state, tx_bytes) {
                    tx.rollback();
                    return Err(TxRejection::Admission(e.to_string()))
                }
            }
        }

        let result =
            match self.tx_handler.process_tx(&state, tx_bytes, is_check) {
                Ok(result) => result,
                Err(e) => {
                    tx.rollback();
                    self.receipts.discard_current();
                    Metrics::inc(&self.metrics.txs_failed);
                    return Err(TxRejection::Handler(e))
                }
            };

        if is_check {
            tx.rollback();
        } else {
            if result.info == CALL_EVM || result.info == DEPLOY_EVM {
                if let Some(receipt) = self.receipts.current_receipt() {
                    if let Err(e) = self.events.legacy_post_tx_receipt(&receipt)
                    {
                        warn!("legacy receipt event failed: {}", e);
                    }
                    if let Err(e) = self.events.post_tx_receipt(&receipt) {
                        warn!("receipt event failed: {}", e);
                    }
                }
                self.receipts.commit_current();
            }
            tx.commit();
        }
        Metrics::inc(&self.metrics.txs_processed);
        Ok(result)
    }

    pub fn end_block(
        &mut self, height: u64,
    ) -> Result<Vec<Validator>, FatalError> {
        let header = self.cur_header()?;
        if height != self.height() {
            return Err(FatalError::HeightMismatch {
                expected: self.height(),
                got: height,
            })
        }

        // phase 1: flush receipts; failure is logged, never aborts the block
        let tx = StoreTx::new(self.store.clone());
        let state = self.block_state(tx.clone(), header.clone());
        match self.receipts.commit_block(&state, header.height) {
            Ok(()) => tx.commit(),
            Err(e) => {
                tx.rollback();
                Metrics::inc(&self.metrics.receipt_flushes_failed);
                error!(
                    "receipt commit failed at height {}: {}",
                    header.height, e
                );
            }
        }

        // phase 2: validator end-block hook
        let updates = match &self.validator_manager {
            None => Vec::new(),
            Some(manager) => {
                let tx = StoreTx::new(self.store.clone());
                let state = self.block_state(tx.clone(), header);
                match manager.end_block(&state) {
                    Ok(updates) => {
                        tx.commit();
                        updates
                    }
                    Err(e) => {
                        tx.rollback();
                        return Err(FatalError::Hook {
                            hook: "validator end-block",
                            reason: e.to_string(),
                        })
                    }
                }
            }
        };
        Ok(updates)
    }

    /// Persist the block. On success the app hash of the new version is
    /// returned; on persistence failure the bytecode-VM root pointer is reset
    /// to the previous height's value and the error is fatal.
    pub fn commit(&mut self) -> Result<Hash, FatalError> {
        let header = self.cur_header()?;
        let height = header.height;
        self.cur_block_header = None;

        // anchor the current bytecode-VM root for this height before the
        // store commit, so a later crash can rewind to it
        match self.aux.vm_root() {
            Ok(Some(root)) => {
                if let Err(e) = self.aux.save_root_at(height, &root) {
                    warn!("saving vm root for height {}: {}", height, e);
                }
            }
            Ok(None) => (),
            Err(e) => warn!("reading vm root: {}", e),
        }

        match self.store.save_version() {
            Err(e) => {
                match self.aux.root_at(height.saturating_sub(1)) {
                    Ok(Some(prev)) => {
                        if let Err(e2) = self.aux.set_vm_root(&prev) {
                            error!("vm root rollback failed: {}", e2);
                        }
                    }
                    Ok(None) => {
                        warn!("no vm root recorded for height {}", height - 1)
                    }
                    Err(e2) => error!("vm root rollback failed: {}", e2),
                }
                Err(FatalError::Persistence {
                    height,
                    reason: e.to_string(),
                })
            }
            Ok((app_hash, _version)) => {
                self.last_block_header = Some(header.clone());
                if !self.dispatcher.enqueue(header) {
                    Metrics::inc(&self.metrics.block_events_dropped);
                }
                if self.config.retain_versions > 0 {
                    if let Err(e) =
                        self.store.prune_versions(self.config.retain_versions)
                    {
                        error!("version pruning failed: {}", e);
                    }
                }
                Metrics::inc(&self.metrics.blocks_committed);
                Ok(app_hash)
            }
        }
    }

    /// Execute a query against an isolated snapshot of the last committed
    /// block; safe to run concurrently with block production.
    pub fn query(&self, path: &str, data: &[u8]) -> Result<Bytes, QueryError> {
        let handler =
            self.query_handler.as_ref().ok_or(QueryError::NoHandler)?;
        let header = self.last_block_header.clone().unwrap_or_default();
        let snapshot = Snapshot::new(self.store.snapshot(), header);
        let result = handler
            .handle(&snapshot, path, data)
            .map_err(|e| QueryError::Handler(e.to_string()));
        snapshot.release();
        result
    }
}
