//! Naming registry interface consumed by the deploy handler, with the
//! state-backed default implementation.

use rlp_derive::{RlpDecodable, RlpEncodable};
use thiserror::Error;

use crate::common::Addr;
use crate::state::State;

const REGISTRY_PREFIX: &[u8] = b"registry:";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("contract name `{0}` is already registered")]
    AlreadyRegistered(String),
    #[error("unknown contract name `{0}`")]
    UnknownName(String),
    #[error("corrupt registry record for `{0}`")]
    Corrupt(String),
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug, PartialEq)]
pub struct Registration {
    pub addr: Addr,
    pub owner: Addr,
}

pub trait ContractRegistry {
    fn register(
        &self, name: &str, addr: &Addr, owner: &Addr,
    ) -> Result<(), RegistryError>;

    fn resolve(&self, name: &str) -> Result<Registration, RegistryError>;
}

/// Registry records kept in the block state, so registrations commit and roll
/// back with the transaction that made them.
pub struct StateRegistry {
    state: State,
}

impl StateRegistry {
    pub fn new(state: State) -> Self {
        Self {
            state: state.with_prefix(REGISTRY_PREFIX),
        }
    }
}

impl ContractRegistry for StateRegistry {
    fn register(
        &self, name: &str, addr: &Addr, owner: &Addr,
    ) -> Result<(), RegistryError> {
        let key = name.as_bytes();
        if self.state.has(key) {
            return Err(RegistryError::AlreadyRegistered(name.into()))
        }
        let record = Registration {
            addr: addr.clone(),
            owner: owner.clone(),
        };
        self.state.set(key, &rlp::encode(&record));
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<Registration, RegistryError> {
        let raw = self
            .state
            .get(name.as_bytes())
            .ok_or_else(|| RegistryError::UnknownName(name.into()))?;
        rlp::decode(&raw).map_err(|_| RegistryError::Corrupt(name.into()))
    }
}
