use std::fmt;

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{
    error::ContractError,
    state::{AgentId, AgentInstances, AgentParams, Service, ServiceId, TokenDetails},
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub from: Address,
    pub value: U256,
}

impl TxOptions {
    pub fn sender(from: Address) -> Self {
        Self {
            from,
            value: U256::ZERO,
        }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeployMode {
    /// Create a fresh multisig for the service.
    NewMultisig,
    /// Reuse the multisig already recorded for the service.
    ReuseMultisig,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: B256,
    pub block_number: Option<u64>,
}

/// Submitted transaction: the hash is known immediately, the receipt once mined.
pub struct PendingTx {
    pub hash: B256,
    confirmation: BoxFuture<'static, Result<Receipt, ContractError>>,
}

impl PendingTx {
    pub fn new(hash: B256, confirmation: BoxFuture<'static, Result<Receipt, ContractError>>) -> Self {
        Self { hash, confirmation }
    }

    pub fn ready(receipt: Receipt) -> Self {
        Self {
            hash: receipt.transaction_hash,
            confirmation: Box::pin(futures::future::ready(Ok(receipt))),
        }
    }

    pub async fn confirmed(self) -> Result<Receipt, ContractError> {
        self.confirmation.await
    }
}

impl fmt::Debug for PendingTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTx").field("hash", &self.hash).finish()
    }
}

#[async_trait]
pub trait RegistryReader: Send + Sync {
    /// Implementations reading the raw `uint8` state decode it with
    /// [`ServiceState::decode`](crate::service_state::ServiceState::decode).
    async fn get_service(&self, id: ServiceId) -> Result<Service, ContractError>;

    async fn get_agent_params(&self, id: ServiceId) -> Result<Vec<AgentParams>, ContractError>;

    async fn get_instances_for_agent_id(
        &self,
        id: ServiceId,
        agent_id: AgentId,
    ) -> Result<AgentInstances, ContractError>;

    async fn get_agent_instances(&self, id: ServiceId) -> Result<Vec<Address>, ContractError>;

    /// Operator bound to `instance`, zero address when unbound.
    async fn map_agent_instance_operators(&self, instance: Address)
        -> Result<Address, ContractError>;

    async fn owner_of(&self, id: ServiceId) -> Result<Address, ContractError>;

    async fn get_token_details(&self, id: ServiceId) -> Result<TokenDetails, ContractError>;
}

#[async_trait]
pub trait RegistryWriter: Send + Sync {
    async fn activate_registration(
        &self,
        id: ServiceId,
        opts: TxOptions,
    ) -> Result<PendingTx, ContractError>;

    async fn register_agents(
        &self,
        id: ServiceId,
        instances: &[Address],
        agent_ids: &[AgentId],
        opts: TxOptions,
    ) -> Result<PendingTx, ContractError>;

    async fn deploy(
        &self,
        id: ServiceId,
        mode: DeployMode,
        payload: Bytes,
        opts: TxOptions,
    ) -> Result<PendingTx, ContractError>;

    async fn terminate(&self, id: ServiceId, opts: TxOptions) -> Result<PendingTx, ContractError>;

    async fn unbond(&self, id: ServiceId, opts: TxOptions) -> Result<PendingTx, ContractError>;
}

#[async_trait]
pub trait TokenContract: Send + Sync {
    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, ContractError>;

    async fn approve(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
        opts: TxOptions,
    ) -> Result<PendingTx, ContractError>;
}

/// Bonds of token secured services, denominated in the service token.
#[async_trait]
pub trait TokenUtilityReader: Send + Sync {
    async fn get_agent_bond(&self, id: ServiceId, agent_id: AgentId) -> Result<U256, ContractError>;
}

#[async_trait]
pub trait ChainProvider: Send + Sync {
    async fn get_code(&self, account: Address) -> Result<Bytes, ContractError>;
}

#[async_trait]
pub trait SafeTransactionService: Send + Sync {
    /// `None` until the safe transaction has executed successfully.
    async fn transaction_details(
        &self,
        chain_id: u64,
        safe_tx_hash: B256,
    ) -> Result<Option<Receipt>, ContractError>;
}
