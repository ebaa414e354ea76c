//! Transaction envelopes and the deploy/call handlers.
//!
//! Wire shape, outermost first: [Transaction] {kind tag, payload} wraps
//! [SignedTx] {inner, signature} wraps [NonceTx] {inner, sequence} wraps
//! [MessageTx] {from, to, vm payload}, where the VM payload is a [DeployTx]
//! or a [CallTx]. All layers are RLP. The origin recovered from the signature
//! must match the claimed sender before anything is dispatched.

use num_traits::FromPrimitive;
use rlp_derive::{RlpDecodable, RlpEncodable};
use sha3::Digest;
use thiserror::Error;

use crate::common::{Addr, Amount, Bytes, Hash, NullableAddr};
use crate::registry::{ContractRegistry, RegistryError, StateRegistry};
use crate::state::{State, TxContext};
use crate::vm::{SharedVmManager, Vm, VmError, VmType};

/// VM-type markers stamped on handler results; downstream receipt and event
/// logic branches on these.
pub const DEPLOY_PLUGIN: &str = "deploy.plugin";
pub const CALL_PLUGIN: &str = "call.plugin";
pub const DEPLOY_EVM: &str = "deploy.evm";
pub const CALL_EVM: &str = "call.evm";

const NONCE_PREFIX: &[u8] = b"nonce:";

#[derive(FromPrimitive, Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxKind {
    Deploy = 1,
    Call = 2,
}

#[derive(Error, Debug)]
pub enum TxError {
    #[error("malformed transaction: {0}")]
    Decode(#[from] rlp::DecoderError),
    #[error("invalid signature")]
    InvalidSignature,
    // Admission check; the exact message prefix is part of the surface.
    #[error("Origin doesn't match caller: {origin} != {claimed}")]
    OriginMismatch { origin: Addr, claimed: Addr },
    #[error("sequence number does not match: expected {expected}, got {got}")]
    BadSequence { expected: u64, got: u64 },
    #[error("unknown transaction kind {0}")]
    UnknownTxKind(u32),
    #[error("call transaction without a target address")]
    MissingTarget,
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug)]
pub struct Transaction {
    pub kind: u32,
    pub payload: Bytes,
}

/// Signed wrapper: 65-byte r‖s‖recovery-id signature over keccak256(inner).
#[derive(RlpEncodable, RlpDecodable, Clone, Debug)]
pub struct SignedTx {
    pub inner: Bytes,
    pub signature: Bytes,
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug)]
pub struct NonceTx {
    pub inner: Bytes,
    pub sequence: u64,
}

#[derive(RlpEncodable, RlpDecodable, Debug)]
pub struct MessageTx {
    pub from: Addr,
    pub to: NullableAddr,
    pub payload: Bytes,
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug)]
pub struct DeployTx {
    pub vm_type: u32,
    pub code: Bytes,
    pub name: String,
    pub value: Amount,
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug)]
pub struct CallTx {
    pub vm_type: u32,
    pub input: Bytes,
    pub value: Amount,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tag {
    pub key: String,
    pub value: Bytes,
}

/// Produced once per transaction: opaque result bytes, the VM-type marker,
/// and indexable tags.
#[derive(Clone, Debug, Default)]
pub struct TxHandlerResult {
    pub data: Bytes,
    pub info: String,
    pub tags: Vec<Tag>,
}

/// The transaction processing surface the Application drives.
pub trait TxHandler: Send + Sync {
    fn process_tx(
        &self, state: &State, tx_bytes: &[u8], is_check: bool,
    ) -> Result<TxHandlerResult, TxError>;
}

fn nonce_key(addr: &Addr) -> Vec<u8> {
    let mut k = NONCE_PREFIX.to_vec();
    k.extend_from_slice(addr.as_bytes());
    k
}

/// Last accepted sequence number for the account; 0 when it never sent.
pub fn account_nonce(state: &State, addr: &Addr) -> u64 {
    state
        .get(&nonce_key(addr))
        .and_then(|raw| raw.try_into().ok().map(u64::from_le_bytes))
        .unwrap_or(0)
}

fn set_account_nonce(state: &State, addr: &Addr, sequence: u64) {
    state.set(&nonce_key(addr), &sequence.to_le_bytes());
}

/// Recover the transaction origin from the signed envelope: the address of
/// the key that produced the signature over keccak256(inner).
pub fn recover_origin(signed: &SignedTx) -> Result<Addr, TxError> {
    let sig = &signed.signature;
    if sig.len() != 65 {
        return Err(TxError::InvalidSignature)
    }
    let signature = libsecp256k1::Signature::parse_standard_slice(&sig[..64])
        .map_err(|_| TxError::InvalidSignature)?;
    let recovery_id = libsecp256k1::RecoveryId::parse(sig[64])
        .map_err(|_| TxError::InvalidSignature)?;
    let digest = Hash::hash(&signed.inner);
    let message = libsecp256k1::Message::parse_slice(digest.as_bytes())
        .map_err(|_| TxError::InvalidSignature)?;
    let pubkey = libsecp256k1::recover(&message, &signature, &recovery_id)
        .map_err(|_| TxError::InvalidSignature)?
        .serialize();
    Ok(Addr::from_slice(
        &sha3::Keccak256::digest(&pubkey[1..]).as_slice()[12..],
    ))
}

/// Sign `inner` with `secret`, producing the wire signature layout
/// [recover_origin] expects.
pub fn sign_tx(inner: Bytes, secret: &libsecp256k1::SecretKey) -> SignedTx {
    let digest = Hash::hash(&inner);
    let message = libsecp256k1::Message::parse_slice(digest.as_bytes())
        .expect("digest is 32 bytes");
    let (signature, recovery_id) = libsecp256k1::sign(&message, secret);
    let mut sig = signature.serialize().to_vec();
    sig.push(recovery_id.serialize());
    SignedTx {
        inner,
        signature: sig.into(),
    }
}

/// Address of the account controlled by `secret`.
pub fn signer_address(secret: &libsecp256k1::SecretKey) -> Addr {
    let pubkey = libsecp256k1::PublicKey::from_secret_key(secret).serialize();
    Addr::from_slice(&sha3::Keccak256::digest(&pubkey[1..]).as_slice()[12..])
}

/// Decodes the envelope chain, authenticates the origin, enforces the
/// account sequence, then routes to the deploy or call handler.
pub struct TxRouter {
    manager: SharedVmManager,
}

impl TxRouter {
    pub fn new(manager: SharedVmManager) -> Self {
        Self { manager }
    }

    fn deploy(
        &self, state: &State, msg: MessageTx,
    ) -> Result<TxHandlerResult, TxError> {
        let deploy: DeployTx = rlp::decode(&msg.payload)?;
        check_origin(state, &msg.from)?;
        let vm_type = VmType::from_tag(deploy.vm_type)
            .ok_or(VmError::UnknownVmType(deploy.vm_type))?;
        let vm = self.manager.init_vm(vm_type, state.clone())?;
        let (data, addr) =
            vm.create(msg.from.clone(), &deploy.code, deploy.value)?;
        if !deploy.name.is_empty() {
            StateRegistry::new(state.clone()).register(
                &deploy.name,
                &addr,
                &msg.from,
            )?;
        }
        Ok(TxHandlerResult {
            data,
            info: match vm_type {
                VmType::Plugin => DEPLOY_PLUGIN.into(),
                VmType::Evm => DEPLOY_EVM.into(),
            },
            tags: vec![Tag {
                key: "contract".into(),
                value: addr.as_bytes().into(),
            }],
        })
    }

    fn call(
        &self, state: &State, msg: MessageTx,
    ) -> Result<TxHandlerResult, TxError> {
        let call: CallTx = rlp::decode(&msg.payload)?;
        check_origin(state, &msg.from)?;
        let to = msg.to.0.ok_or(TxError::MissingTarget)?;
        let vm_type = VmType::from_tag(call.vm_type)
            .ok_or(VmError::UnknownVmType(call.vm_type))?;
        let vm = self.manager.init_vm(vm_type, state.clone())?;
        let data =
            vm.call(msg.from, to.clone(), &call.input, call.value)?;
        Ok(TxHandlerResult {
            data,
            info: match vm_type {
                VmType::Plugin => CALL_PLUGIN.into(),
                VmType::Evm => CALL_EVM.into(),
            },
            tags: vec![Tag {
                key: "contract".into(),
                value: to.as_bytes().into(),
            }],
        })
    }
}

fn check_origin(state: &State, claimed: &Addr) -> Result<(), TxError> {
    match &state.context().origin {
        Some(origin) if origin == claimed => Ok(()),
        Some(origin) => Err(TxError::OriginMismatch {
            origin: origin.clone(),
            claimed: claimed.clone(),
        }),
        // the router always attaches the origin before dispatch
        None => Err(TxError::InvalidSignature),
    }
}

impl TxHandler for TxRouter {
    fn process_tx(
        &self, state: &State, tx_bytes: &[u8], _is_check: bool,
    ) -> Result<TxHandlerResult, TxError> {
        let tx: Transaction = rlp::decode(tx_bytes)?;
        let kind =
            TxKind::from_u32(tx.kind).ok_or(TxError::UnknownTxKind(tx.kind))?;
        let signed: SignedTx = rlp::decode(&tx.payload)?;
        let origin = recover_origin(&signed)?;
        let state = state.with_context(TxContext {
            origin: Some(origin.clone()),
        });
        let nonced: NonceTx = rlp::decode(&signed.inner)?;
        let expected = account_nonce(&state, &origin) + 1;
        if nonced.sequence != expected {
            return Err(TxError::BadSequence {
                expected,
                got: nonced.sequence,
            })
        }
        // rolls back with the tx sub-transaction on failure
        set_account_nonce(&state, &origin, nonced.sequence);
        let msg: MessageTx = rlp::decode(&nonced.inner)?;
        match kind {
            TxKind::Deploy => self.deploy(&state, msg),
            TxKind::Call => self.call(&state, msg),
        }
    }
}
