//! Node-side configuration for the application runtime.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptBackendKind {
    /// Receipts in the versioned application store; retention follows store
    /// pruning.
    Store,
    /// Bounded FIFO in the embedded aux store.
    Bounded,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub receipt_backend: ReceiptBackendKind,
    /// Capacity of the bounded receipt backend; 0 disables eviction.
    pub max_receipts: u64,
    /// Saved store versions to keep when pruning; 0 keeps everything.
    pub retain_versions: u64,
    /// Depth of the background block-event queue.
    pub event_queue_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            receipt_backend: ReceiptBackendKind::Bounded,
            max_receipts: 2000,
            retain_versions: 10000,
            event_queue_size: 64,
        }
    }
}
