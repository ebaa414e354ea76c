use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use appchain::app::FatalError;
use appchain::common::Hash;
use appchain::config::AppConfig;
use appchain::state::BlockHeader;
use appchain::store::{
    KVPair, KVReader, KVWriter, MemStore, StoreError, StoreSnapshot,
    VersionedStore,
};
use appchain::tx::signer_address;
use appchain::vm::VmType;

mod common;
use common::*;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn height_tracks_committed_versions() {
    init_logs();
    let mut chain = new_chain(AppConfig::default());
    assert_eq!(chain.app.height(), 1);
    for expected in 1..=5u64 {
        assert_eq!(chain.app.height(), expected);
        run_block(&mut chain, &[]);
        // after a successful commit of height h, app height is h + 1
        assert_eq!(chain.app.height(), expected + 1);
        assert_eq!(chain.app.info().last_block_height, expected);
    }
}

#[test]
fn begin_block_height_mismatch_is_fatal() {
    init_logs();
    let mut chain = new_chain(AppConfig::default());
    run_block(&mut chain, &[]);
    let mut header = next_header(&chain.app, "test-chain");
    header.height += 3;
    match chain.app.begin_block(header) {
        Err(FatalError::HeightMismatch { expected: 2, got: 5 }) => (),
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn late_init_chain_is_fatal() {
    init_logs();
    let mut chain = new_chain(AppConfig::default());
    run_block(&mut chain, &[]);
    let request = appchain::app::InitChainRequest {
        chain_id: "test-chain".into(),
        time: 0,
        validators: Vec::new(),
    };
    match chain.app.init_chain(request) {
        Err(FatalError::LateInitChain(2)) => (),
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn check_tx_never_touches_the_store() {
    init_logs();
    let mut chain = new_chain(AppConfig::default());
    let sk = secret(0x21);
    let from = signer_address(&sk);

    let header = next_header(&chain.app, "test-chain");
    let height = header.height;
    chain.app.begin_block(header).unwrap();

    let before = chain.store.range(b"");
    // a valid deploy and a garbage payload; neither may leak writes
    let valid = deploy_tx(
        &sk,
        from,
        1,
        VmType::Plugin,
        plugin_code("counter:1.0.0", b""),
        "counter",
    );
    let resp = chain.app.check_tx(&valid).unwrap();
    assert_eq!(resp.code, appchain::app::CODE_OK);
    let resp = chain.app.check_tx(b"not a transaction").unwrap();
    assert_eq!(resp.code, appchain::app::CODE_ERR);
    assert_eq!(chain.store.range(b""), before);

    chain.app.end_block(height).unwrap();
    chain.app.commit().unwrap();
    assert_eq!(chain.store.range(b""), before);
}

#[test]
fn mismatched_origin_rejected_for_deploy_and_call() {
    init_logs();
    let mut chain = new_chain(AppConfig::default());
    let signer = secret(0x31);
    let claimed = signer_address(&secret(0x32));

    // an honest deploy so the call has a live target
    let honest_sk = secret(0x33);
    let honest = signer_address(&honest_sk);
    let responses = run_block(
        &mut chain,
        &[deploy_tx(
            &honest_sk,
            honest,
            1,
            VmType::Plugin,
            plugin_code("counter:1.0.0", b""),
            "counter",
        )],
    );
    assert_eq!(responses[0].code, appchain::app::CODE_OK);
    let target = appchain::common::Addr::from_slice(&responses[0].tags[0].value);

    let header = next_header(&chain.app, "test-chain");
    let height = header.height;
    chain.app.begin_block(header).unwrap();
    let before = chain.store.range(b"");

    let deploy = deploy_tx(
        &signer,
        claimed.clone(),
        1,
        VmType::Plugin,
        plugin_code("counter:1.0.0", b""),
        "",
    );
    let resp = chain.app.deliver_tx(&deploy).unwrap();
    assert_eq!(resp.code, appchain::app::CODE_ERR);
    assert!(
        resp.log.starts_with("Origin doesn't match caller"),
        "log was: {}",
        resp.log
    );

    let call = call_tx(
        &signer,
        claimed,
        1,
        VmType::Plugin,
        target,
        appchain::common::Bytes::empty(),
    );
    let resp = chain.app.deliver_tx(&call).unwrap();
    assert_eq!(resp.code, appchain::app::CODE_ERR);
    assert!(resp.log.starts_with("Origin doesn't match caller"));

    assert_eq!(chain.store.range(b""), before);
    chain.app.end_block(height).unwrap();
    chain.app.commit().unwrap();
}

#[test]
fn sequence_must_increment() {
    init_logs();
    let mut chain = new_chain(AppConfig::default());
    let sk = secret(0x41);
    let from = signer_address(&sk);
    let deploy = |seq| {
        deploy_tx(
            &sk,
            from.clone(),
            seq,
            VmType::Plugin,
            plugin_code("counter:1.0.0", b""),
            "",
        )
    };
    let responses = run_block(&mut chain, &[deploy(1), deploy(1), deploy(2)]);
    assert_eq!(responses[0].code, appchain::app::CODE_OK);
    assert_eq!(responses[1].code, appchain::app::CODE_ERR);
    assert!(responses[1].log.contains("sequence number does not match"));
    assert_eq!(responses[2].code, appchain::app::CODE_OK);
}

#[test]
fn evm_deliver_commits_receipt_and_failed_tx_discards_it() {
    init_logs();
    let mut chain = new_chain(AppConfig::default());
    let sk = secret(0x51);
    let from = signer_address(&sk);

    let responses = run_block(
        &mut chain,
        &[deploy_tx(
            &sk,
            from.clone(),
            1,
            VmType::Evm,
            (&b"\x60\x01"[..]).into(),
            "",
        )],
    );
    assert_eq!(responses[0].code, appchain::app::CODE_OK);
    // result bytes are the receipt hash
    let tx_hash = Hash::from_slice(&responses[0].data);
    let walked = receipts_in_backend(&chain);
    assert_eq!(walked, vec![tx_hash.clone()]);
    let contract =
        appchain::common::Addr::from_slice(&responses[0].tags[0].value);

    // a failing call must not leave a second receipt behind
    chain.engine.fail_next_call.store(true, Ordering::SeqCst);
    let responses = run_block(
        &mut chain,
        &[call_tx(
            &sk,
            from,
            2,
            VmType::Evm,
            contract,
            appchain::common::Bytes::empty(),
        )],
    );
    assert_eq!(responses[0].code, appchain::app::CODE_ERR);
    assert_eq!(receipts_in_backend(&chain), vec![tx_hash]);
}

fn receipts_in_backend(chain: &TestChain) -> Vec<Hash> {
    use appchain::receipts::AuxReceiptBackend;
    AuxReceiptBackend::new(chain.aux.clone(), 0)
        .walk()
        .unwrap()
        .into_iter()
        .map(|r| r.tx_hash)
        .collect()
}

#[test]
fn query_runs_against_last_committed_snapshot() {
    init_logs();
    use appchain::app::{HookResult, QueryHandler};
    use appchain::common::Bytes;
    use appchain::state::Snapshot;

    struct EchoHeight;
    impl QueryHandler for EchoHeight {
        fn handle(
            &self, snapshot: &Snapshot, _path: &str, _data: &[u8],
        ) -> HookResult<Bytes> {
            Ok(snapshot
                .block_header()
                .height
                .to_le_bytes()
                .to_vec()
                .into())
        }
    }

    let mut chain = new_chain_with(AppConfig::default(), |app| {
        app.with_query_handler(Arc::new(EchoHeight))
    });
    run_block(&mut chain, &[]);
    run_block(&mut chain, &[]);
    let out = chain.app.query("height", b"").unwrap();
    assert_eq!(u64::from_le_bytes(out[..].try_into().unwrap()), 2);
}

#[test]
fn genesis_and_block_hooks_run_in_their_own_phases() {
    init_logs();
    use appchain::app::{
        ChainConfigManager, ContractUpkeepHandler, HookResult,
        InitChainRequest, ValidatorManager,
    };
    use appchain::state::{State, Validator};
    use appchain::store::StoreTx;

    struct Vals;
    impl ValidatorManager for Vals {
        fn begin_block(
            &self, state: &State, header: &BlockHeader,
        ) -> HookResult<()> {
            state.set(b"vm:begin", &header.height.to_le_bytes());
            Ok(())
        }
        fn end_block(&self, _state: &State) -> HookResult<Vec<Validator>> {
            Ok(vec![Validator {
                pub_key: (&b"v1"[..]).into(),
                power: 7,
            }])
        }
    }

    struct Features;
    impl ChainConfigManager for Features {
        fn enable_features(&self, state: &State) -> HookResult<()> {
            state.set_feature("receipts:v2", true);
            Ok(())
        }
    }

    struct Upkeep;
    impl ContractUpkeepHandler for Upkeep {
        fn upkeep(&self, state: &State) -> HookResult<()> {
            state.set(b"upkeep:ran", b"1");
            Ok(())
        }
    }

    let mut chain = new_chain_with(AppConfig::default(), |app| {
        app.with_validator_manager(Arc::new(Vals))
            .with_chain_config(Arc::new(Features))
            .with_upkeep(Arc::new(Upkeep))
            .with_init(Box::new(|state, request| {
                state.set(b"genesis:chain", request.chain_id.as_bytes());
                Ok(())
            }))
    });

    chain
        .app
        .init_chain(InitChainRequest {
            chain_id: "test-chain".into(),
            time: 0,
            validators: Vec::new(),
        })
        .unwrap();
    assert_eq!(
        chain.store.get(b"genesis:chain").as_deref(),
        Some(&b"test-chain"[..])
    );

    let header = next_header(&chain.app, "test-chain");
    chain.app.begin_block(header).unwrap();
    // both BeginBlock phases committed their sub-transactions
    assert_eq!(chain.store.get(b"upkeep:ran").as_deref(), Some(&b"1"[..]));
    assert!(chain.store.get(b"vm:begin").is_some());

    let updates = chain.app.end_block(1).unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].power, 7);
    chain.app.commit().unwrap();

    // the auto-enabled feature flag is durable
    let state = State::new(
        StoreTx::new(chain.store.clone()),
        BlockHeader::default(),
        None,
    );
    assert!(state.feature_enabled("receipts:v2", false));
}

#[test]
fn origin_guard_gates_check_tx_only() {
    init_logs();
    use appchain::app::{HookResult, OriginGuard};
    use appchain::state::State;
    use parking_lot::Mutex;

    struct DenyAll {
        resets: Arc<Mutex<Vec<u64>>>,
    }
    impl OriginGuard for DenyAll {
        fn reset(&self, height: u64) {
            self.resets.lock().push(height);
        }
        fn validate(
            &self, _state: &State, _tx_bytes: &[u8],
        ) -> HookResult<()> {
            Err("origin quota exhausted".into())
        }
    }

    let resets = Arc::new(Mutex::new(Vec::new()));
    let guard_resets = resets.clone();
    let mut chain = new_chain_with(AppConfig::default(), move |app| {
        app.with_origin_guard(Arc::new(DenyAll {
            resets: guard_resets,
        }))
    });
    let sk = secret(0x81);
    let from = signer_address(&sk);
    let tx = deploy_tx(
        &sk,
        from,
        1,
        VmType::Plugin,
        plugin_code("counter:1.0.0", b""),
        "",
    );

    let header = next_header(&chain.app, "test-chain");
    chain.app.begin_block(header).unwrap();
    assert_eq!(*resets.lock(), vec![1]);

    let resp = chain.app.check_tx(&tx).unwrap();
    assert_eq!(resp.code, appchain::app::CODE_ERR);
    assert!(resp.log.contains("origin quota exhausted"));
    // DeliverTx skips the admission hook
    let resp = chain.app.deliver_tx(&tx).unwrap();
    assert_eq!(resp.code, appchain::app::CODE_OK);

    chain.app.end_block(1).unwrap();
    chain.app.commit().unwrap();
}

// versioned store wrapper with induced persistence failure

struct FailingStore {
    inner: Arc<MemStore>,
    fail_next_save: AtomicBool,
}

impl KVReader for FailingStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.get(key)
    }
    fn has(&self, key: &[u8]) -> bool {
        self.inner.has(key)
    }
    fn range(&self, prefix: &[u8]) -> Vec<KVPair> {
        self.inner.range(prefix)
    }
}

impl KVWriter for FailingStore {
    fn set(&self, key: &[u8], value: &[u8]) {
        self.inner.set(key, value)
    }
    fn delete(&self, key: &[u8]) {
        self.inner.delete(key)
    }
}

impl VersionedStore for FailingStore {
    fn version(&self) -> u64 {
        self.inner.version()
    }
    fn app_hash(&self) -> Hash {
        self.inner.app_hash()
    }
    fn save_version(&self) -> Result<(Hash, u64), StoreError> {
        if self.fail_next_save.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("induced disk failure".into()))
        }
        self.inner.save_version()
    }
    fn prune_versions(&self, keep_recent: u64) -> Result<(), StoreError> {
        self.inner.prune_versions(keep_recent)
    }
    fn snapshot(&self) -> Arc<dyn StoreSnapshot> {
        self.inner.snapshot()
    }
}

#[test]
fn commit_failure_rewinds_vm_root_and_is_fatal() {
    init_logs();
    use appchain::app::{Application, Metrics};
    use appchain::events::LogEventHandler;
    use appchain::evmaux::EvmAuxStore;
    use appchain::receipts::ReceiptHandler;
    use appchain::tx::TxRouter;
    use appchain::vm::VmManager;

    let failing = Arc::new(FailingStore {
        inner: MemStore::new(),
        fail_next_save: AtomicBool::new(false),
    });
    let aux = Arc::new(EvmAuxStore::temporary().unwrap());
    let config = AppConfig::default();
    let receipts = Arc::new(ReceiptHandler::from_config(&config, aux.clone()));
    let router = Arc::new(TxRouter::new(Arc::new(VmManager::new())));
    let mut app = Application::new(
        failing.clone(),
        aux.clone(),
        config,
        router,
        receipts,
        Arc::new(LogEventHandler),
        Arc::new(Metrics::default()),
    );

    // height 1 commits cleanly with root r1
    aux.set_vm_root(b"r1").unwrap();
    let mut header = BlockHeader::default();
    header.chain_id = "test-chain".into();
    header.height = 1;
    app.begin_block(header.clone()).unwrap();
    app.end_block(1).unwrap();
    app.commit().unwrap();

    // the bytecode VM moves its root during block 2, then the store fails
    aux.set_vm_root(b"r2").unwrap();
    header.height = 2;
    app.begin_block(header).unwrap();
    app.end_block(2).unwrap();
    failing.fail_next_save.store(true, Ordering::SeqCst);
    match app.commit() {
        Err(FatalError::Persistence { height: 2, .. }) => (),
        other => panic!("unexpected: {:?}", other),
    }
    // compensating rollback: the root pointer equals the height-1 value
    assert_eq!(aux.vm_root().unwrap().as_deref(), Some(&b"r1"[..]));
}
