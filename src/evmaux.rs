//! Embedded auxiliary store for bytecode-VM bookkeeping that lives outside
//! the versioned application store: the current account-state root pointer,
//! per-height historical roots, and the bounded receipt log.
//!
//! Everything is kept in one sled tree so a whole commit lands in a single
//! atomic [sled::Batch]; a crash mid-write leaves either the old or the new
//! contents, never a mix.

use std::path::Path;

use thiserror::Error;

use crate::common::Hash;

/// Current bytecode-VM account root. Protocol key; do not change.
pub const VM_ROOT_KEY: &[u8] = b"vmroot";
/// Historical roots, one per committed height. Protocol prefix.
pub const ROOT_BY_HEIGHT_PREFIX: &[u8] = b"evmdbmapper";

pub const RECEIPT_PREFIX: &[u8] = b"receipt:";
pub const BLOOM_PREFIX: &[u8] = b"bloom:";
pub const TX_HASH_PREFIX: &[u8] = b"txhash:";
/// Oldest retained receipt in the bounded FIFO.
pub const LIST_HEAD_KEY: &[u8] = b"rhead";
/// Most recently inserted receipt.
pub const LIST_TAIL_KEY: &[u8] = b"rtail";
pub const LIST_SIZE_KEY: &[u8] = b"rsize";

#[derive(Error, Debug)]
pub enum AuxError {
    #[error("aux store failure: {0}")]
    Db(#[from] sled::Error),
    #[error("corrupt aux record under {0}")]
    Corrupt(String),
}

pub struct EvmAuxStore {
    db: sled::Db,
}

pub(crate) fn root_by_height_key(height: u64) -> Vec<u8> {
    let mut k = ROOT_BY_HEIGHT_PREFIX.to_vec();
    k.extend_from_slice(&height.to_le_bytes());
    k
}

pub(crate) fn receipt_key(tx_hash: &Hash) -> Vec<u8> {
    let mut k = RECEIPT_PREFIX.to_vec();
    k.extend_from_slice(tx_hash.as_bytes());
    k
}

pub(crate) fn height_key(prefix: &[u8], height: u64) -> Vec<u8> {
    let mut k = prefix.to_vec();
    k.extend_from_slice(&height.to_le_bytes());
    k
}

impl EvmAuxStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AuxError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// In-memory store for tests and throwaway nodes.
    pub fn temporary() -> Result<Self, AuxError> {
        Ok(Self {
            db: sled::Config::new().temporary(true).open()?,
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, AuxError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), AuxError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    /// Apply a batch atomically and force it to disk.
    pub fn apply(&self, batch: sled::Batch) -> Result<(), AuxError> {
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn vm_root(&self) -> Result<Option<Vec<u8>>, AuxError> {
        self.get(VM_ROOT_KEY)
    }

    pub fn set_vm_root(&self, root: &[u8]) -> Result<(), AuxError> {
        self.set(VM_ROOT_KEY, root)
    }

    pub fn root_at(&self, height: u64) -> Result<Option<Vec<u8>>, AuxError> {
        self.get(&root_by_height_key(height))
    }

    pub fn save_root_at(
        &self, height: u64, root: &[u8],
    ) -> Result<(), AuxError> {
        self.set(&root_by_height_key(height), root)
    }

    pub(crate) fn get_u64(&self, key: &[u8]) -> Result<u64, AuxError> {
        match self.db.get(key)? {
            None => Ok(0),
            Some(v) => {
                let raw: [u8; 8] = v.as_ref().try_into().map_err(|_| {
                    AuxError::Corrupt(String::from_utf8_lossy(key).into_owned())
                })?;
                Ok(u64::from_le_bytes(raw))
            }
        }
    }

    pub(crate) fn get_hash(&self, key: &[u8]) -> Result<Option<Hash>, AuxError> {
        match self.db.get(key)? {
            None => Ok(None),
            Some(v) if v.len() == 32 => Ok(Some(Hash::from_slice(&v))),
            Some(_) => Err(AuxError::Corrupt(
                String::from_utf8_lossy(key).into_owned(),
            )),
        }
    }
}
