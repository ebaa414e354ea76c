//! # appchain: application-layer runtime for a permissioned blockchain node
//!
//! This crate is the piece that sits between an external consensus engine
//! and a versioned key-value store: it receives block-lifecycle callbacks,
//! deterministically applies transactions, and routes contract execution to
//! one of two pluggable virtual machines: a native contract VM that runs
//! name-addressed Rust contracts, and an adapter for an external bytecode
//! interpreter. Consensus, networking, the hash-tree storage engine and the
//! interpreter itself are collaborators behind traits; what lives here is
//! everything that must be bit-identical across independent nodes.
//!
//! # Module map
//! - [common]: address/hash/byte primitives and deterministic address
//!   derivation.
//! - [store]: the versioned-store interfaces, the atomic sub-transaction
//!   used by every block-processing phase, and an in-memory store.
//! - [state]: the per-block [State](state::State) view (prefixes, feature
//!   flags, validator cache) and the releasable read-only
//!   [Snapshot](state::Snapshot).
//! - [app]: the [Application](app::Application) lifecycle state machine:
//!   `InitChain`/`BeginBlock`/`CheckTx`/`DeliverTx`/`EndBlock`/`Commit`/
//!   `Query`.
//! - [vm]: the [VmType](vm::VmType) registry, the native
//!   [PluginVm](vm::plugin::PluginVm) and the bytecode-engine adapter.
//! - [tx]: signed transaction envelopes, origin recovery, and the
//!   deploy/call handlers.
//! - [receipts]: the receipt subsystem with its two durable backends and the
//!   per-height event bloom.
//! - [evmaux]: the embedded aux store for bytecode-VM root bookkeeping and
//!   the bounded receipt log.
//!
//! # Determinism and failure
//! Block processing is single-threaded and strictly ordered. Each phase of a
//! block opens and closes its own atomic sub-transaction, so a rollback in
//! one phase never disturbs a sibling that already committed. Recoverable
//! transaction errors come back as non-zero status codes; invariant
//! violations surface as [FatalError](app::FatalError), which the embedding
//! node must translate into process termination, since continuing past one
//! risks a silent fork.

#[macro_use] extern crate num_derive;

pub mod app;
pub mod common;
pub mod config;
pub mod events;
pub mod evmaux;
pub mod receipts;
pub mod registry;
pub mod state;
pub mod store;
pub mod tx;
pub mod vm;
