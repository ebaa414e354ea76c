//! VM dispatch: a closed set of engine types, a capability interface each
//! engine implements, and a registry mapping type tags to constructors.

use std::collections::HashMap;
use std::sync::Arc;

use num_traits::FromPrimitive;
use thiserror::Error;

pub mod evm;
pub mod plugin;

use crate::common::{Addr, Amount, Bytes};
use crate::state::State;

/// Engine selector carried in deploy/call payloads. Closed: decoding an
/// unknown tag is a recoverable transaction error, never a dispatch guess.
#[derive(FromPrimitive, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum VmType {
    Plugin = 0,
    Evm = 1,
}

impl VmType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::from_u32(tag)
    }
}

#[derive(Error, Debug)]
pub enum VmError {
    #[error("unknown VM type tag {0}")]
    UnknownVmType(u32),
    #[error("unknown contract `{0}`")]
    UnknownContract(String),
    #[error("no contract deployed at {0}")]
    NotDeployed(Addr),
    #[error("contract already deployed at {0}")]
    AddressCollision(Addr),
    #[error("mutation attempted in a read-only context")]
    ReadOnly,
    #[error("malformed VM payload: {0}")]
    Codec(#[from] rlp::DecoderError),
    #[error("bytecode engine failure: {0}")]
    Engine(String),
    #[error("contract error: {0}")]
    Contract(String),
}

/// Capability surface shared by both engines. A VM instance is bound to one
/// [State] for one transaction.
pub trait Vm {
    /// Deploy new contract code; returns the execution output and the
    /// deterministically derived contract address.
    fn create(
        &self, caller: Addr, code: &[u8], value: Amount,
    ) -> Result<(Bytes, Addr), VmError>;

    fn call(
        &self, caller: Addr, addr: Addr, input: &[u8], value: Amount,
    ) -> Result<Bytes, VmError>;

    /// Execute without any state mutation or event emission.
    fn static_call(
        &self, caller: Addr, addr: Addr, input: &[u8],
    ) -> Result<Bytes, VmError>;

    fn get_code(&self, addr: &Addr) -> Result<Bytes, VmError>;
}

pub type VmFactory = Box<dyn Fn(State) -> Box<dyn Vm> + Send + Sync>;

/// Registry of VM constructors, keyed by [VmType].
#[derive(Default)]
pub struct VmManager {
    factories: HashMap<VmType, VmFactory>,
}

impl VmManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, ty: VmType, factory: VmFactory) {
        self.factories.insert(ty, factory);
    }

    pub fn init_vm(
        &self, ty: VmType, state: State,
    ) -> Result<Box<dyn Vm>, VmError> {
        let factory = self
            .factories
            .get(&ty)
            .ok_or(VmError::UnknownVmType(ty as u32))?;
        Ok(factory(state))
    }
}

/// Shared manager handle as the tx handlers consume it.
pub type SharedVmManager = Arc<VmManager>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_type_tags_are_closed() {
        assert_eq!(VmType::from_tag(0), Some(VmType::Plugin));
        assert_eq!(VmType::from_tag(1), Some(VmType::Evm));
        assert_eq!(VmType::from_tag(2), None);
    }

    #[test]
    fn unregistered_type_is_an_error() {
        use crate::state::BlockHeader;
        use crate::store::{MemStore, StoreTx};
        let manager = VmManager::new();
        let tx = StoreTx::new(MemStore::new());
        let state = State::new(tx, BlockHeader::default(), None);
        match manager.init_vm(VmType::Evm, state) {
            Err(VmError::UnknownVmType(1)) => (),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
