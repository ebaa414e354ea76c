//! Event plumbing: per-transaction contract events, chain notifications, and
//! the background block-event dispatcher.

use std::sync::mpsc;
use std::thread;

use log::{debug, info, warn};
use rlp_derive::{RlpDecodable, RlpEncodable};
use serde::Serialize;
use thiserror::Error;

use crate::common::{Addr, Bytes};
use crate::receipts::EvmTxReceipt;
use crate::state::BlockHeader;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("event sink rejected event: {0}")]
    Sink(String),
}

/// A single contract event. Part of the receipt wire shape, so the field
/// order here is consensus-visible.
#[derive(RlpEncodable, RlpDecodable, Serialize, Clone, Debug, PartialEq)]
pub struct EventData {
    pub contract: Addr,
    pub caller: Addr,
    pub topics: Vec<Bytes>,
    pub data: Bytes,
    pub block_height: u64,
}

/// Observer surface for everything the chain emits. Failures here must never
/// affect consensus state; callers log and move on.
pub trait EventHandler: Send + Sync {
    /// A contract event emitted during transaction execution.
    fn post(&self, event: &EventData) -> Result<(), EventError>;

    /// Current-format notification for a committed bytecode-VM transaction.
    fn post_tx_receipt(&self, receipt: &EvmTxReceipt) -> Result<(), EventError>;

    /// Pre-receipt notification format kept for old subscribers.
    fn legacy_post_tx_receipt(
        &self, receipt: &EvmTxReceipt,
    ) -> Result<(), EventError>;

    /// Block-level notification, delivered off the commit path.
    fn block_committed(&self, header: &BlockHeader) -> Result<(), EventError>;
}

/// Default sink: structured log lines only.
pub struct LogEventHandler;

impl EventHandler for LogEventHandler {
    fn post(&self, event: &EventData) -> Result<(), EventError> {
        debug!(
            "event contract={} topics={} height={}",
            event.contract,
            event.topics.len(),
            event.block_height
        );
        Ok(())
    }

    fn post_tx_receipt(&self, receipt: &EvmTxReceipt) -> Result<(), EventError> {
        debug!("tx receipt {} status={}", receipt.tx_hash, receipt.status);
        Ok(())
    }

    fn legacy_post_tx_receipt(
        &self, receipt: &EvmTxReceipt,
    ) -> Result<(), EventError> {
        debug!("tx receipt (legacy) {}", receipt.tx_hash);
        Ok(())
    }

    fn block_committed(&self, header: &BlockHeader) -> Result<(), EventError> {
        info!("block {} committed", header.height);
        Ok(())
    }
}

/// Bounded queue drained by a dedicated worker thread. Commit enqueues and
/// returns immediately; when the queue is full the event is dropped and
/// counted, never blocking block production.
pub struct EventDispatcher {
    sender: Option<mpsc::SyncSender<BlockHeader>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl EventDispatcher {
    pub fn new(
        handler: std::sync::Arc<dyn EventHandler>, capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
        let worker = thread::spawn(move || {
            while let Ok(header) = receiver.recv() {
                if let Err(e) = handler.block_committed(&header) {
                    warn!("block event delivery failed: {}", e);
                }
            }
        });
        Self {
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Returns false when the event was dropped because the queue was full.
    pub fn enqueue(&self, header: BlockHeader) -> bool {
        let sender = match &self.sender {
            Some(s) => s,
            None => return false,
        };
        match sender.try_send(header) {
            Ok(()) => true,
            Err(mpsc::TrySendError::Full(h)) => {
                warn!("event queue full, dropping block event {}", h.height);
                false
            }
            Err(mpsc::TrySendError::Disconnected(_)) => {
                warn!("event worker is gone");
                false
            }
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        // closing the channel lets the worker drain and exit
        drop(self.sender.take());
        if let Some(t) = self.worker.take() {
            let _ = t.join();
        }
    }
}
