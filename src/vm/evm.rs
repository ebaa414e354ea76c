//! Adapter between the runtime and the external bytecode interpreter. The
//! interpreter itself lives behind [BytecodeEngine]; this wrapper's job is
//! the receipt bookkeeping: every deploy/call outcome is cached as a receipt
//! and the receipt hash becomes the transaction result bytes.

use std::sync::Arc;

use super::{Vm, VmError, VmFactory};
use crate::common::{Addr, Amount, Bytes};
use crate::events::EventData;
use crate::receipts::ReceiptHandler;
use crate::state::State;

pub struct EngineOutcome {
    pub output: Bytes,
    pub events: Vec<EventData>,
}

/// The external bytecode interpreter boundary. Implementations manage their
/// own account trie against the given state and the aux-store root pointer.
pub trait BytecodeEngine: Send + Sync {
    fn create(
        &self, state: &State, caller: &Addr, code: &[u8], value: &Amount,
    ) -> Result<(EngineOutcome, Addr), VmError>;

    fn call(
        &self, state: &State, caller: &Addr, addr: &Addr, input: &[u8],
        value: &Amount,
    ) -> Result<EngineOutcome, VmError>;

    fn static_call(
        &self, state: &State, caller: &Addr, addr: &Addr, input: &[u8],
    ) -> Result<EngineOutcome, VmError>;

    fn get_code(&self, state: &State, addr: &Addr) -> Result<Bytes, VmError>;
}

pub struct EvmVm {
    state: State,
    engine: Arc<dyn BytecodeEngine>,
    receipts: Arc<ReceiptHandler>,
}

impl EvmVm {
    pub fn new(
        state: State, engine: Arc<dyn BytecodeEngine>,
        receipts: Arc<ReceiptHandler>,
    ) -> Self {
        Self {
            state,
            engine,
            receipts,
        }
    }

    pub fn factory(
        engine: Arc<dyn BytecodeEngine>, receipts: Arc<ReceiptHandler>,
    ) -> VmFactory {
        Box::new(move |state| {
            Box::new(EvmVm::new(state, engine.clone(), receipts.clone()))
        })
    }
}

impl Vm for EvmVm {
    fn create(
        &self, caller: Addr, code: &[u8], value: Amount,
    ) -> Result<(Bytes, Addr), VmError> {
        match self.engine.create(&self.state, &caller, code, &value) {
            Ok((outcome, addr)) => {
                let tx_hash = self.receipts.cache_receipt(
                    &self.state,
                    caller,
                    addr.clone(),
                    outcome.events,
                    true,
                );
                Ok((tx_hash.as_bytes().into(), addr))
            }
            Err(e) => {
                // a failed execution still leaves a (failed) receipt behind
                self.receipts.cache_receipt(
                    &self.state,
                    caller,
                    Addr::zero().clone(),
                    Vec::new(),
                    false,
                );
                Err(e)
            }
        }
    }

    fn call(
        &self, caller: Addr, addr: Addr, input: &[u8], value: Amount,
    ) -> Result<Bytes, VmError> {
        match self.engine.call(&self.state, &caller, &addr, input, &value) {
            Ok(outcome) => {
                let tx_hash = self.receipts.cache_receipt(
                    &self.state,
                    caller,
                    addr,
                    outcome.events,
                    true,
                );
                Ok(tx_hash.as_bytes().into())
            }
            Err(e) => {
                self.receipts
                    .cache_receipt(&self.state, caller, addr, Vec::new(), false);
                Err(e)
            }
        }
    }

    fn static_call(
        &self, caller: Addr, addr: Addr, input: &[u8],
    ) -> Result<Bytes, VmError> {
        // no receipt for read-only execution
        Ok(self
            .engine
            .static_call(&self.state, &caller, &addr, input)?
            .output)
    }

    fn get_code(&self, addr: &Addr) -> Result<Bytes, VmError> {
        self.engine.get_code(&self.state, addr)
    }
}
