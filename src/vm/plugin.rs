//! The native contract VM. Contracts are name-addressed Rust implementations
//! registered in a loader; what gets persisted at the contract address is the
//! name descriptor, not instructions. Every invocation, including each hop of
//! a nested call chain, gets a fresh [PluginContext] so a callee always
//! observes its immediate caller.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use rlp_derive::{RlpDecodable, RlpEncodable};

use super::{Vm, VmError, VmFactory};
use crate::common::{create_address, Addr, Amount, Bytes};
use crate::events::{EventData, EventHandler};
use crate::state::{BlockHeader, State};
use crate::store::KVPair;

const CODE_PREFIX: &[u8] = b"code:";
const DATA_PREFIX: &[u8] = b"contract:";

fn code_key(addr: &Addr) -> Vec<u8> {
    let mut k = CODE_PREFIX.to_vec();
    k.extend_from_slice(addr.as_bytes());
    k
}

/// Prefix under which a contract's own key space lives.
pub fn contract_data_prefix(addr: &Addr) -> Vec<u8> {
    let mut k = DATA_PREFIX.to_vec();
    k.extend_from_slice(addr.as_bytes());
    k.push(b':');
    k
}

#[derive(Clone, Debug, PartialEq)]
pub struct ContractMeta {
    pub name: String,
    pub version: String,
}

impl ContractMeta {
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }
}

/// A native contract implementation. Stateless by construction; all state
/// goes through the per-invocation context.
pub trait Contract: Send + Sync {
    fn meta(&self) -> ContractMeta;

    fn init(&self, ctx: &mut PluginContext, args: &[u8])
        -> Result<(), VmError>;

    fn call(
        &self, ctx: &mut PluginContext, input: &[u8],
    ) -> Result<Bytes, VmError>;

    fn static_call(
        &self, ctx: &mut PluginContext, input: &[u8],
    ) -> Result<Bytes, VmError>;
}

/// Resolves contract implementations by `name:version`.
#[derive(Default)]
pub struct ContractLoader {
    contracts: HashMap<String, Arc<dyn Contract>>,
}

impl ContractLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, contract: Arc<dyn Contract>) {
        self.contracts
            .insert(contract.meta().full_name(), contract);
    }

    pub fn load(&self, full_name: &str) -> Result<Arc<dyn Contract>, VmError> {
        self.contracts
            .get(full_name)
            .cloned()
            .ok_or_else(|| VmError::UnknownContract(full_name.into()))
    }
}

/// Deploy payload for the native VM: the descriptor that will be persisted
/// as the contract's code, plus the initial call input.
#[derive(RlpEncodable, RlpDecodable, Clone, Debug, PartialEq)]
pub struct PluginCode {
    /// `name:version` of a loader-registered contract.
    pub name: String,
    pub init_input: Bytes,
}

pub struct PluginVm {
    state: State,
    loader: Arc<ContractLoader>,
    events: Option<Arc<dyn EventHandler>>,
}

impl PluginVm {
    pub fn new(
        state: State, loader: Arc<ContractLoader>,
        events: Option<Arc<dyn EventHandler>>,
    ) -> Self {
        Self {
            state,
            loader,
            events,
        }
    }

    pub fn factory(
        loader: Arc<ContractLoader>, events: Option<Arc<dyn EventHandler>>,
    ) -> VmFactory {
        Box::new(move |state| {
            Box::new(PluginVm::new(state, loader.clone(), events.clone()))
        })
    }

    fn resolve(&self, addr: &Addr) -> Result<Arc<dyn Contract>, VmError> {
        let descriptor = self
            .state
            .get(&code_key(addr))
            .ok_or_else(|| VmError::NotDeployed(addr.clone()))?;
        let name = String::from_utf8(descriptor)
            .map_err(|_| VmError::NotDeployed(addr.clone()))?;
        self.loader.load(&name)
    }

    fn context(
        &self, address: Addr, caller: Addr, value: Amount, read_only: bool,
    ) -> PluginContext {
        PluginContext {
            vm: self,
            contract_state: self.state.with_prefix(&contract_data_prefix(&address)),
            address,
            caller,
            value,
            read_only,
        }
    }
}

impl Vm for PluginVm {
    fn create(
        &self, caller: Addr, code: &[u8], value: Amount,
    ) -> Result<(Bytes, Addr), VmError> {
        let descriptor: PluginCode = rlp::decode(code)?;
        let contract = self.loader.load(&descriptor.name)?;
        let nonce = crate::tx::account_nonce(&self.state, &caller);
        let addr = create_address(&caller, nonce);
        if self.state.has(&code_key(&addr)) {
            return Err(VmError::AddressCollision(addr))
        }
        self.state.set(&code_key(&addr), descriptor.name.as_bytes());
        let mut ctx = self.context(addr.clone(), caller, value, false);
        contract.init(&mut ctx, &descriptor.init_input)?;
        Ok((Bytes::empty(), addr))
    }

    fn call(
        &self, caller: Addr, addr: Addr, input: &[u8], value: Amount,
    ) -> Result<Bytes, VmError> {
        let contract = self.resolve(&addr)?;
        let mut ctx = self.context(addr, caller, value, false);
        contract.call(&mut ctx, input)
    }

    fn static_call(
        &self, caller: Addr, addr: Addr, input: &[u8],
    ) -> Result<Bytes, VmError> {
        let contract = self.resolve(&addr)?;
        let mut ctx =
            self.context(addr, caller, Amount::zero().clone(), true);
        contract.static_call(&mut ctx, input)
    }

    fn get_code(&self, addr: &Addr) -> Result<Bytes, VmError> {
        Ok(self
            .state
            .get(&code_key(addr))
            .map(Bytes::from)
            .unwrap_or_default())
    }
}

/// Execution context for one contract invocation. `caller` is always the
/// immediate calling contract (or the external signer for the outermost
/// call); nested dispatch builds a new context at every hop.
pub struct PluginContext<'a> {
    vm: &'a PluginVm,
    contract_state: State,
    pub address: Addr,
    pub caller: Addr,
    pub value: Amount,
    read_only: bool,
}

impl<'a> PluginContext<'a> {
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.contract_state.get(key)
    }

    pub fn has(&self, key: &[u8]) -> bool {
        self.contract_state.has(key)
    }

    pub fn range(&self, prefix: &[u8]) -> Vec<KVPair> {
        self.contract_state.range(prefix)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), VmError> {
        if self.read_only {
            return Err(VmError::ReadOnly)
        }
        self.contract_state.set(key, value);
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<(), VmError> {
        if self.read_only {
            return Err(VmError::ReadOnly)
        }
        self.contract_state.delete(key);
        Ok(())
    }

    /// Emit a contract event. Observer failures are logged, never surfaced
    /// to the contract.
    pub fn emit(
        &mut self, topics: Vec<Bytes>, data: Bytes,
    ) -> Result<(), VmError> {
        if self.read_only {
            return Err(VmError::ReadOnly)
        }
        if let Some(events) = &self.vm.events {
            let ev = EventData {
                contract: self.address.clone(),
                caller: self.caller.clone(),
                topics,
                data,
                block_height: self.block_header().height,
            };
            if let Err(e) = events.post(&ev) {
                warn!("event post failed for {}: {}", self.address, e);
            }
        }
        Ok(())
    }

    /// Call another contract; the callee observes this contract as its
    /// caller. In a read-only context the nested call is forced static.
    pub fn call_contract(
        &mut self, addr: Addr, input: &[u8], value: Amount,
    ) -> Result<Bytes, VmError> {
        if self.read_only {
            return self.vm.static_call(self.address.clone(), addr, input)
        }
        self.vm.call(self.address.clone(), addr, input, value)
    }

    pub fn static_call_contract(
        &self, addr: Addr, input: &[u8],
    ) -> Result<Bytes, VmError> {
        self.vm.static_call(self.address.clone(), addr, input)
    }

    pub fn block_header(&self) -> &BlockHeader {
        self.contract_state.block_header()
    }

    pub fn feature_enabled(&self, name: &str, default: bool) -> bool {
        self.contract_state.feature_enabled(name, default)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Static-call entry point for the query boundary: {caller (defaults to the
/// root address), contract, opaque request} against a read-only state.
pub fn query_contract(
    state: &State, loader: Arc<ContractLoader>, caller: Option<Addr>,
    contract: Addr, input: &[u8],
) -> Result<Bytes, VmError> {
    let vm = PluginVm::new(state.clone(), loader, None);
    let caller = caller.unwrap_or_else(|| crate::common::root_addr().clone());
    vm.static_call(caller, contract, input)
}
