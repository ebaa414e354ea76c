#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use appchain::app::{Application, Metrics};
use appchain::common::{create_address, Addr, Amount, Bytes, Hash};
use appchain::config::AppConfig;
use appchain::events::{EventData, EventHandler, LogEventHandler};
use appchain::evmaux::EvmAuxStore;
use appchain::receipts::ReceiptHandler;
use appchain::state::{BlockHeader, State};
use appchain::store::{MemStore, SharedStore};
use appchain::tx::{
    sign_tx, CallTx, DeployTx, MessageTx, NonceTx, Transaction, TxKind,
    TxRouter,
};
use appchain::vm::evm::{BytecodeEngine, EngineOutcome, EvmVm};
use appchain::vm::plugin::{
    Contract, ContractLoader, ContractMeta, PluginCode, PluginContext,
    PluginVm,
};
use appchain::vm::{VmError, VmManager, VmType};
use appchain::common::NullableAddr;

pub fn secret(fill: u8) -> libsecp256k1::SecretKey {
    libsecp256k1::SecretKey::parse(&[fill; 32]).unwrap()
}

pub fn next_header(app: &Application, chain_id: &str) -> BlockHeader {
    let height = app.height();
    BlockHeader {
        chain_id: chain_id.into(),
        height,
        time: 1_700_000_000 + height as i64,
        last_block_hash: Hash::hash(&(height - 1).to_le_bytes()),
        current_hash: Hash::hash(&height.to_le_bytes()),
        num_txs: 0,
    }
}

// envelope assembly

fn wrap(
    kind: TxKind, sk: &libsecp256k1::SecretKey, sequence: u64, msg: MessageTx,
) -> Vec<u8> {
    let nonced = NonceTx {
        inner: rlp::encode(&msg).to_vec().into(),
        sequence,
    };
    let signed = sign_tx(rlp::encode(&nonced).to_vec().into(), sk);
    let tx = Transaction {
        kind: kind as u32,
        payload: rlp::encode(&signed).to_vec().into(),
    };
    rlp::encode(&tx).to_vec()
}

pub fn deploy_tx(
    sk: &libsecp256k1::SecretKey, from: Addr, sequence: u64, vm_type: VmType,
    code: Bytes, name: &str,
) -> Vec<u8> {
    let deploy = DeployTx {
        vm_type: vm_type as u32,
        code,
        name: name.into(),
        value: Amount::zero().clone(),
    };
    let msg = MessageTx {
        from,
        to: NullableAddr(None),
        payload: rlp::encode(&deploy).to_vec().into(),
    };
    wrap(TxKind::Deploy, sk, sequence, msg)
}

pub fn call_tx(
    sk: &libsecp256k1::SecretKey, from: Addr, sequence: u64, vm_type: VmType,
    to: Addr, input: Bytes,
) -> Vec<u8> {
    let call = CallTx {
        vm_type: vm_type as u32,
        input,
        value: Amount::zero().clone(),
    };
    let msg = MessageTx {
        from,
        to: NullableAddr(Some(to)),
        payload: rlp::encode(&call).to_vec().into(),
    };
    wrap(TxKind::Call, sk, sequence, msg)
}

pub fn plugin_code(name: &str, init_input: &[u8]) -> Bytes {
    rlp::encode(&PluginCode {
        name: name.into(),
        init_input: init_input.into(),
    })
    .to_vec()
    .into()
}

// sample native contracts

/// Records its immediate caller on every call and forwards to the contract
/// address stored at init, so call chains can be inspected afterwards.
pub struct CallerProbe;

impl Contract for CallerProbe {
    fn meta(&self) -> ContractMeta {
        ContractMeta {
            name: "probe".into(),
            version: "1.0.0".into(),
        }
    }

    fn init(
        &self, ctx: &mut PluginContext, args: &[u8],
    ) -> Result<(), VmError> {
        if !args.is_empty() {
            ctx.set(b"next", args)?;
        }
        Ok(())
    }

    fn call(
        &self, ctx: &mut PluginContext, input: &[u8],
    ) -> Result<Bytes, VmError> {
        let caller = ctx.caller.clone();
        ctx.set(b"seen_caller", caller.as_bytes())?;
        if let Some(next) = ctx.get(b"next") {
            ctx.call_contract(
                Addr::from_slice(&next),
                input,
                Amount::zero().clone(),
            )?;
        }
        Ok(Bytes::empty())
    }

    fn static_call(
        &self, ctx: &mut PluginContext, _input: &[u8],
    ) -> Result<Bytes, VmError> {
        Ok(ctx.get(b"seen_caller").unwrap_or_default().into())
    }
}

/// Minimal stateful contract: a counter with an event per bump.
pub struct Counter;

impl Contract for Counter {
    fn meta(&self) -> ContractMeta {
        ContractMeta {
            name: "counter".into(),
            version: "1.0.0".into(),
        }
    }

    fn init(
        &self, ctx: &mut PluginContext, _args: &[u8],
    ) -> Result<(), VmError> {
        ctx.set(b"count", &0u64.to_le_bytes())
    }

    fn call(
        &self, ctx: &mut PluginContext, _input: &[u8],
    ) -> Result<Bytes, VmError> {
        let count = counter_value(ctx) + 1;
        ctx.set(b"count", &count.to_le_bytes())?;
        ctx.emit(
            vec![(&b"bumped"[..]).into()],
            count.to_le_bytes().to_vec().into(),
        )?;
        Ok(count.to_le_bytes().to_vec().into())
    }

    fn static_call(
        &self, ctx: &mut PluginContext, _input: &[u8],
    ) -> Result<Bytes, VmError> {
        Ok(counter_value(ctx).to_le_bytes().to_vec().into())
    }
}

fn counter_value(ctx: &PluginContext) -> u64 {
    ctx.get(b"count")
        .and_then(|raw| raw.try_into().ok().map(u64::from_le_bytes))
        .unwrap_or(0)
}

pub fn probe_loader() -> Arc<ContractLoader> {
    let mut loader = ContractLoader::new();
    loader.register(Arc::new(CallerProbe));
    loader.register(Arc::new(Counter));
    Arc::new(loader)
}

// mock bytecode engine

fn evm_code_key(addr: &Addr) -> Vec<u8> {
    let mut k = b"evmcode:".to_vec();
    k.extend_from_slice(addr.as_bytes());
    k
}

/// Stand-in for the external interpreter: deploys persist the raw code,
/// calls record their input and emit one event.
#[derive(Default)]
pub struct MockEngine {
    pub fail_next_call: AtomicBool,
}

impl MockEngine {
    fn outcome(&self, contract: &Addr, caller: &Addr, data: &[u8]) -> EngineOutcome {
        EngineOutcome {
            output: data.into(),
            events: vec![EventData {
                contract: contract.clone(),
                caller: caller.clone(),
                topics: vec![(&b"Transfer"[..]).into()],
                data: data.into(),
                block_height: 0,
            }],
        }
    }
}

impl BytecodeEngine for MockEngine {
    fn create(
        &self, state: &State, caller: &Addr, code: &[u8], _value: &Amount,
    ) -> Result<(EngineOutcome, Addr), VmError> {
        let nonce = appchain::tx::account_nonce(state, caller);
        let addr = create_address(caller, nonce);
        state.set(&evm_code_key(&addr), code);
        Ok((self.outcome(&addr, caller, code), addr))
    }

    fn call(
        &self, state: &State, caller: &Addr, addr: &Addr, input: &[u8],
        _value: &Amount,
    ) -> Result<EngineOutcome, VmError> {
        if self.fail_next_call.swap(false, Ordering::SeqCst) {
            return Err(VmError::Engine("induced failure".into()))
        }
        if !state.has(&evm_code_key(addr)) {
            return Err(VmError::NotDeployed(addr.clone()))
        }
        state.set(b"evm:last_input", input);
        Ok(self.outcome(addr, caller, input))
    }

    fn static_call(
        &self, state: &State, _caller: &Addr, addr: &Addr, _input: &[u8],
    ) -> Result<EngineOutcome, VmError> {
        Ok(EngineOutcome {
            output: state.get(&evm_code_key(addr)).unwrap_or_default().into(),
            events: Vec::new(),
        })
    }

    fn get_code(
        &self, state: &State, addr: &Addr,
    ) -> Result<Bytes, VmError> {
        Ok(state.get(&evm_code_key(addr)).unwrap_or_default().into())
    }
}

// app assembly

pub struct TestChain {
    pub app: Application,
    pub store: Arc<MemStore>,
    pub aux: Arc<EvmAuxStore>,
    pub engine: Arc<MockEngine>,
}

pub fn new_chain(config: AppConfig) -> TestChain {
    new_chain_with(config, |app| app)
}

pub fn new_chain_with(
    config: AppConfig, customize: impl FnOnce(Application) -> Application,
) -> TestChain {
    let store = MemStore::new();
    new_chain_on(store, config, customize)
}

pub fn new_chain_on(
    store: Arc<MemStore>, config: AppConfig,
    customize: impl FnOnce(Application) -> Application,
) -> TestChain {
    let shared: SharedStore = store.clone();
    let aux = Arc::new(EvmAuxStore::temporary().unwrap());
    let engine = Arc::new(MockEngine::default());
    let receipts =
        Arc::new(ReceiptHandler::from_config(&config, aux.clone()));
    let events: Arc<dyn EventHandler> = Arc::new(LogEventHandler);
    let mut manager = VmManager::new();
    manager.register(
        VmType::Plugin,
        PluginVm::factory(probe_loader(), Some(events.clone())),
    );
    manager
        .register(VmType::Evm, EvmVm::factory(engine.clone(), receipts.clone()));
    let router = Arc::new(TxRouter::new(Arc::new(manager)));
    let app = customize(Application::new(
        shared,
        aux.clone(),
        config,
        router,
        receipts,
        events,
        Arc::new(Metrics::default()),
    ));
    TestChain {
        app,
        store,
        aux,
        engine,
    }
}

/// Drive one full block through the lifecycle, delivering `txs` in order.
pub fn run_block(
    chain: &mut TestChain, txs: &[Vec<u8>],
) -> Vec<appchain::app::TxResponse> {
    let header = next_header(&chain.app, "test-chain");
    let height = header.height;
    chain.app.begin_block(header).unwrap();
    let responses = txs
        .iter()
        .map(|tx| chain.app.deliver_tx(tx).unwrap())
        .collect();
    chain.app.end_block(height).unwrap();
    chain.app.commit().unwrap();
    responses
}
