use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::{
    constants::{MAX_AGENT_IDS_PER_SERVICE, MAX_AGENT_INSTANCES_PER_SERVICE, NATIVE_TOKEN, ZERO_ADDRESS},
    contracts::{
        ChainProvider, DeployMode, PendingTx, Receipt, RegistryReader, RegistryWriter,
        SafeTransactionService, TokenContract, TokenUtilityReader, TxOptions,
    },
    error::ContractError,
    service_state::ServiceState,
    state::{
        AgentId, AgentInstances, AgentParams, SecurityToken, Service, ServiceId, TokenDetails,
    },
    validator::validate_threshold,
};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
enum Revert {
    #[error("Service not found")]
    ServiceNotFound,
    #[error("Service owner cannot be zero")]
    ZeroOwner,
    #[error("Config hash cannot be zero")]
    ZeroConfigHash,
    #[error("Slots or bond cannot be zero.")]
    ZeroValue,
    #[error("Agent ID list is empty or lengths do not match")]
    WrongArrayLength,
    #[error("Agent IDs must be strictly increasing and without duplicates")]
    WrongAgentId,
    #[error("Threshold is out of bounds")]
    WrongThreshold,
    #[error("Maximum number of agent instances per service reached")]
    MaxAgentInstancesPerServiceReached,
    #[error("Caller is not the service owner")]
    OwnerOnly,
    #[error("Wrong service state")]
    WrongServiceState,
    #[error("Service must be inactive")]
    ServiceMustBeInactive,
    #[error("Incorrect registration deposit value")]
    IncorrectRegistrationDepositValue,
    #[error("Incorrect agent bonding value")]
    IncorrectAgentBondingValue,
    #[error("Insufficient token allowance")]
    InsufficientAllowance,
    #[error("Agent is not part of the service")]
    AgentNotInService,
    #[error("Agent instance slots are filled")]
    AgentInstancesSlotsFilled,
    #[error("Agent instance is already registered")]
    AgentInstanceRegistered,
    #[error("Operator is registered as an agent instance")]
    WrongOperator,
    #[error("Service has no multisig to reuse")]
    WrongMultisig,
    #[error("Operator has no instances")]
    OperatorHasNoInstances,
}

impl From<Revert> for ContractError {
    fn from(revert: Revert) -> Self {
        ContractError::Reverted(format!("{revert:?}"))
    }
}

/// Parameters for minting a service into the registry.
#[derive(Clone, Debug)]
pub struct NewService {
    pub owner: Address,
    pub config_hash: B256,
    pub agent_ids: Vec<AgentId>,
    pub agent_params: Vec<AgentParams>,
    pub threshold: u32,
    /// `NATIVE_TOKEN` or an ERC20 address.
    pub token: Address,
    /// Token denominated bond per agent id, only used when `token` is an ERC20.
    pub token_bonds: Vec<U256>,
}

struct ServiceRecord {
    service: Service,
    instances: BTreeMap<AgentId, Vec<Address>>,
    operator_instances: HashMap<Address, Vec<Address>>,
}

impl ServiceRecord {
    fn num_agent_instances(&self) -> u64 {
        self.instances.values().map(|v| v.len() as u64).sum()
    }

    fn clear_instances(&mut self) {
        self.instances.values_mut().for_each(Vec::clear);
        self.operator_instances.clear();
    }
}

#[derive(Default)]
struct Ledger {
    total_supply: ServiceId,
    services: BTreeMap<ServiceId, ServiceRecord>,
    instance_operators: HashMap<Address, Address>,
    operator_bonds: HashMap<(ServiceId, Address), U256>,
    token_bonds: HashMap<(ServiceId, AgentId), U256>,
    allowances: HashMap<(Address, Address, Address), U256>,
    contract_accounts: HashSet<Address>,
    safe_txs: HashMap<B256, (Receipt, Option<u32>)>,
    safe_polls_until_success: Option<u32>,
    nonce: u64,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, ContractError>,
}

impl Ledger {
    fn record(&mut self, method: &'static str) -> Result<(), ContractError> {
        *self.calls.entry(method).or_default() += 1;
        match self.failures.remove(method) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn service_mut(&mut self, id: ServiceId) -> Result<&mut ServiceRecord, Revert> {
        self.services.get_mut(&id).ok_or(Revert::ServiceNotFound)
    }

    fn service(&self, id: ServiceId) -> Result<&ServiceRecord, Revert> {
        self.services.get(&id).ok_or(Revert::ServiceNotFound)
    }

    fn next_receipt(&mut self) -> Receipt {
        self.nonce += 1;
        Receipt {
            transaction_hash: B256::left_padding_from(&self.nonce.to_be_bytes()),
            block_number: Some(self.nonce),
        }
    }

    fn allowance(&self, token: Address, owner: Address, spender: Address) -> U256 {
        self.allowances
            .get(&(token, owner, spender))
            .copied()
            .unwrap_or_default()
    }
}

/// Registry, token, provider and safe service held in memory, applying the
/// registry's own state rules on every write.
pub struct InMemoryRegistry {
    ledger: Mutex<Ledger>,
    token_utility: Address,
    released: watch::Sender<bool>,
}

impl InMemoryRegistry {
    pub fn new(token_utility: Address) -> Self {
        let (released, _) = watch::channel(true);
        Self {
            ledger: Mutex::new(Ledger {
                safe_polls_until_success: Some(1),
                ..Ledger::default()
            }),
            token_utility,
            released,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_service(&self, new: NewService) -> Result<ServiceId, ContractError> {
        if new.owner == ZERO_ADDRESS {
            return Err(Revert::ZeroOwner.into());
        }
        if new.config_hash == B256::ZERO {
            return Err(Revert::ZeroConfigHash.into());
        }
        initial_checks(&new.agent_ids, &new.agent_params)?;

        let max_instances: u64 = new.agent_params.iter().map(|p| p.slots).sum();
        if max_instances > MAX_AGENT_INSTANCES_PER_SERVICE as u64 {
            return Err(Revert::MaxAgentInstancesPerServiceReached.into());
        }
        validate_threshold(new.threshold, max_instances as u32)
            .map_err(|_| ContractError::from(Revert::WrongThreshold))?;

        let security_deposit = new
            .agent_params
            .iter()
            .map(|p| p.bond)
            .max()
            .unwrap_or_default();

        let mut ledger = self.lock();
        let id = ledger.total_supply + 1;
        for (agent_id, bond) in new.agent_ids.iter().zip(&new.token_bonds) {
            ledger.token_bonds.insert((id, *agent_id), *bond);
        }
        ledger.services.insert(
            id,
            ServiceRecord {
                service: Service {
                    id,
                    state: ServiceState::PreRegistration,
                    owner: new.owner,
                    security_deposit,
                    agent_ids: new.agent_ids.clone(),
                    agent_params: new.agent_params,
                    multisig: ZERO_ADDRESS,
                    threshold: new.threshold,
                    token: new.token,
                    config_hash: new.config_hash,
                },
                instances: new.agent_ids.iter().map(|a| (*a, Vec::new())).collect(),
                operator_instances: HashMap::new(),
            },
        );
        ledger.total_supply = id;
        debug!(service_id = id, "service created");
        Ok(id)
    }

    /// Accounts with code take the multisig confirmation path.
    pub fn mark_contract_account(&self, account: Address) {
        self.lock().contract_accounts.insert(account);
    }

    /// Number of polls a safe transaction needs before it reports success; `None` never succeeds.
    pub fn set_safe_polls_until_success(&self, polls: Option<u32>) {
        self.lock().safe_polls_until_success = polls;
    }

    pub fn set_allowance(&self, token: Address, owner: Address, spender: Address, amount: U256) {
        self.lock().allowances.insert((token, owner, spender), amount);
    }

    pub fn allowance_of(&self, token: Address, owner: Address, spender: Address) -> U256 {
        self.lock().allowance(token, owner, spender)
    }

    /// Binds `instance` to `operator` outside of any service, e.g. from another service.
    pub fn bind_instance(&self, instance: Address, operator: Address) {
        self.lock().instance_operators.insert(instance, operator);
    }

    /// Makes the next call of `method` fail with `err`.
    pub fn fail_next(&self, method: &'static str, err: ContractError) {
        self.lock().failures.insert(method, err);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or_default()
    }

    pub fn operator_bond(&self, id: ServiceId, operator: Address) -> U256 {
        self.lock()
            .operator_bonds
            .get(&(id, operator))
            .copied()
            .unwrap_or_default()
    }

    /// Confirmations of transactions submitted while held stay pending until release.
    pub fn hold_confirmations(&self) {
        self.released.send_replace(false);
    }

    pub fn release_confirmations(&self) {
        self.released.send_replace(true);
    }

    fn submit(&self, ledger: &mut Ledger, from: Address) -> PendingTx {
        let receipt = ledger.next_receipt();
        if ledger.contract_accounts.contains(&from) {
            let polls = ledger.safe_polls_until_success;
            ledger.safe_txs.insert(receipt.transaction_hash, (receipt, polls));
            // safe transactions only settle through the transaction service
            return PendingTx::new(
                receipt.transaction_hash,
                Box::pin(futures::future::pending::<Result<Receipt, ContractError>>()),
            );
        }

        let mut released = self.released.subscribe();
        PendingTx::new(
            receipt.transaction_hash,
            Box::pin(async move {
                while !*released.borrow_and_update() {
                    if released.changed().await.is_err() {
                        break;
                    }
                }
                Ok::<_, ContractError>(receipt)
            }),
        )
    }
}

fn initial_checks(agent_ids: &[AgentId], agent_params: &[AgentParams]) -> Result<(), Revert> {
    // Check arrays are non-empty and of equal length
    if agent_ids.is_empty() || agent_ids.len() != agent_params.len() {
        return Err(Revert::WrongArrayLength);
    }
    if agent_ids.len() > MAX_AGENT_IDS_PER_SERVICE {
        return Err(Revert::WrongArrayLength);
    }

    // Check agent IDs are strictly increasing (sorted without duplicates)
    if agent_ids.windows(2).any(|w| w[1] <= w[0]) {
        return Err(Revert::WrongAgentId);
    }

    if agent_params
        .iter()
        .any(|p| p.slots == 0 || p.bond == U256::ZERO)
    {
        return Err(Revert::ZeroValue);
    }
    Ok(())
}

#[async_trait]
impl RegistryReader for InMemoryRegistry {
    async fn get_service(&self, id: ServiceId) -> Result<Service, ContractError> {
        let mut ledger = self.lock();
        ledger.record("get_service")?;
        let record = ledger.service(id)?;
        Ok(record.service.clone())
    }

    async fn get_agent_params(&self, id: ServiceId) -> Result<Vec<AgentParams>, ContractError> {
        let mut ledger = self.lock();
        ledger.record("get_agent_params")?;
        Ok(ledger.service(id)?.service.agent_params.clone())
    }

    async fn get_instances_for_agent_id(
        &self,
        id: ServiceId,
        agent_id: AgentId,
    ) -> Result<AgentInstances, ContractError> {
        let mut ledger = self.lock();
        ledger.record("get_instances_for_agent_id")?;
        let agent_instances = ledger
            .service(id)?
            .instances
            .get(&agent_id)
            .cloned()
            .unwrap_or_default();
        Ok(AgentInstances {
            num_agent_instances: agent_instances.len() as u64,
            agent_instances,
        })
    }

    async fn get_agent_instances(&self, id: ServiceId) -> Result<Vec<Address>, ContractError> {
        let mut ledger = self.lock();
        ledger.record("get_agent_instances")?;
        Ok(ledger
            .service(id)?
            .instances
            .values()
            .flatten()
            .copied()
            .collect())
    }

    async fn map_agent_instance_operators(
        &self,
        instance: Address,
    ) -> Result<Address, ContractError> {
        let mut ledger = self.lock();
        ledger.record("map_agent_instance_operators")?;
        Ok(ledger
            .instance_operators
            .get(&instance)
            .copied()
            .unwrap_or(ZERO_ADDRESS))
    }

    async fn owner_of(&self, id: ServiceId) -> Result<Address, ContractError> {
        let mut ledger = self.lock();
        ledger.record("owner_of")?;
        Ok(ledger.service(id)?.service.owner)
    }

    async fn get_token_details(&self, id: ServiceId) -> Result<TokenDetails, ContractError> {
        let mut ledger = self.lock();
        ledger.record("get_token_details")?;
        let service = &ledger.service(id)?.service;
        Ok(TokenDetails {
            token: service.token,
            security_deposit: service.security_deposit,
        })
    }
}

#[async_trait]
impl RegistryWriter for InMemoryRegistry {
    async fn activate_registration(
        &self,
        id: ServiceId,
        opts: TxOptions,
    ) -> Result<PendingTx, ContractError> {
        let mut ledger = self.lock();
        ledger.record("activate_registration")?;
        let token_utility = self.token_utility;

        let service = &ledger.service(id)?.service;
        if service.owner != opts.from {
            return Err(Revert::OwnerOnly.into());
        }
        if service.state != ServiceState::PreRegistration {
            return Err(Revert::ServiceMustBeInactive.into());
        }
        let deposit = service.security_deposit;
        match SecurityToken::from_address(service.token) {
            SecurityToken::Native => {
                if opts.value != deposit {
                    return Err(Revert::IncorrectRegistrationDepositValue.into());
                }
            }
            SecurityToken::Erc20(token) => {
                if opts.value != U256::from(1) {
                    return Err(Revert::IncorrectRegistrationDepositValue.into());
                }
                if ledger.allowance(token, opts.from, token_utility) < deposit {
                    return Err(Revert::InsufficientAllowance.into());
                }
            }
        }

        ledger.service_mut(id)?.service.state = ServiceState::ActiveRegistration;
        Ok(self.submit(&mut ledger, opts.from))
    }

    async fn register_agents(
        &self,
        id: ServiceId,
        instances: &[Address],
        agent_ids: &[AgentId],
        opts: TxOptions,
    ) -> Result<PendingTx, ContractError> {
        let mut ledger = self.lock();
        ledger.record("register_agents")?;
        let operator = opts.from;

        if instances.is_empty() || instances.len() != agent_ids.len() {
            return Err(Revert::WrongArrayLength.into());
        }
        if ledger.instance_operators.contains_key(&operator) {
            return Err(Revert::WrongOperator.into());
        }

        let record = ledger.service(id)?;
        if record.service.state != ServiceState::ActiveRegistration {
            return Err(Revert::WrongServiceState.into());
        }

        let mut total_bond = U256::ZERO;
        let mut token_bond = U256::ZERO;
        let mut filled: HashMap<AgentId, u64> = HashMap::new();
        let mut seen = HashSet::new();
        for (instance, agent_id) in instances.iter().zip(agent_ids) {
            let index = record
                .service
                .agent_ids
                .iter()
                .position(|a| a == agent_id)
                .ok_or(Revert::AgentNotInService)?;
            let params = record.service.agent_params[index];

            if !seen.insert(*instance) || ledger.instance_operators.contains_key(instance) {
                return Err(Revert::AgentInstanceRegistered.into());
            }

            let occupied = record
                .instances
                .get(agent_id)
                .map(|v| v.len() as u64)
                .unwrap_or_default();
            let slot = filled.entry(*agent_id).or_insert(occupied);
            if *slot >= params.slots {
                return Err(Revert::AgentInstancesSlotsFilled.into());
            }
            *slot += 1;

            total_bond += params.bond;
            token_bond += ledger
                .token_bonds
                .get(&(id, *agent_id))
                .copied()
                .unwrap_or_default();
        }

        if opts.value != total_bond {
            return Err(Revert::IncorrectAgentBondingValue.into());
        }
        if let SecurityToken::Erc20(token) = SecurityToken::from_address(record.service.token) {
            if ledger.allowance(token, operator, self.token_utility) < token_bond {
                return Err(Revert::InsufficientAllowance.into());
            }
        }

        for (instance, agent_id) in instances.iter().zip(agent_ids) {
            ledger.instance_operators.insert(*instance, operator);
            let record = ledger.service_mut(id)?;
            record.instances.entry(*agent_id).or_default().push(*instance);
            record
                .operator_instances
                .entry(operator)
                .or_default()
                .push(*instance);
        }
        *ledger.operator_bonds.entry((id, operator)).or_default() += total_bond;

        // Finalize service state if full
        let record = ledger.service_mut(id)?;
        if record.num_agent_instances() == record.service.max_num_agent_instances() {
            record.service.state = ServiceState::FinishedRegistration;
        }
        Ok(self.submit(&mut ledger, opts.from))
    }

    async fn deploy(
        &self,
        id: ServiceId,
        mode: DeployMode,
        payload: Bytes,
        opts: TxOptions,
    ) -> Result<PendingTx, ContractError> {
        let mut ledger = self.lock();
        ledger.record("deploy")?;
        let nonce = ledger.nonce;

        let record = ledger.service_mut(id)?;
        if record.service.owner != opts.from {
            return Err(Revert::OwnerOnly.into());
        }
        if record.service.state != ServiceState::FinishedRegistration {
            return Err(Revert::WrongServiceState.into());
        }
        match mode {
            DeployMode::ReuseMultisig if !record.service.has_multisig() => {
                return Err(Revert::WrongMultisig.into());
            }
            DeployMode::ReuseMultisig => {}
            DeployMode::NewMultisig => {
                let mut seed = (nonce + 1).to_be_bytes().to_vec();
                seed.insert(0, 0x5a);
                record.service.multisig = Address::from_word(B256::left_padding_from(&seed));
            }
        }
        debug!(service_id = id, payload_len = payload.len(), "service deployed");
        record.service.state = ServiceState::Deployed;
        Ok(self.submit(&mut ledger, opts.from))
    }

    async fn terminate(&self, id: ServiceId, opts: TxOptions) -> Result<PendingTx, ContractError> {
        let mut ledger = self.lock();
        ledger.record("terminate")?;

        let record = ledger.service_mut(id)?;
        if record.service.owner != opts.from {
            return Err(Revert::OwnerOnly.into());
        }
        // Check if already terminated
        if matches!(
            record.service.state,
            ServiceState::NonExistent | ServiceState::PreRegistration | ServiceState::TerminatedBonded
        ) {
            return Err(Revert::WrongServiceState.into());
        }

        record.service.state = if record.num_agent_instances() > 0 {
            ServiceState::TerminatedBonded
        } else {
            ServiceState::PreRegistration
        };
        Ok(self.submit(&mut ledger, opts.from))
    }

    async fn unbond(&self, id: ServiceId, opts: TxOptions) -> Result<PendingTx, ContractError> {
        let mut ledger = self.lock();
        ledger.record("unbond")?;
        let operator = opts.from;

        let record = ledger.service_mut(id)?;
        if record.service.state != ServiceState::TerminatedBonded {
            return Err(Revert::WrongServiceState.into());
        }
        let released = record
            .operator_instances
            .remove(&operator)
            .filter(|v| !v.is_empty())
            .ok_or(Revert::OperatorHasNoInstances)?;

        for list in record.instances.values_mut() {
            list.retain(|i| !released.contains(i));
        }
        if record.num_agent_instances() == 0 {
            record.clear_instances();
            record.service.state = ServiceState::PreRegistration;
        }
        for instance in &released {
            ledger.instance_operators.remove(instance);
        }
        ledger.operator_bonds.remove(&(id, operator));
        Ok(self.submit(&mut ledger, opts.from))
    }
}

#[async_trait]
impl TokenContract for InMemoryRegistry {
    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, ContractError> {
        let mut ledger = self.lock();
        ledger.record("allowance")?;
        Ok(ledger.allowance(token, owner, spender))
    }

    async fn approve(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
        opts: TxOptions,
    ) -> Result<PendingTx, ContractError> {
        let mut ledger = self.lock();
        ledger.record("approve")?;
        if token == NATIVE_TOKEN {
            return Err(ContractError::Reverted("NotAnErc20".into()));
        }
        ledger.allowances.insert((token, opts.from, spender), amount);
        Ok(self.submit(&mut ledger, opts.from))
    }
}

#[async_trait]
impl TokenUtilityReader for InMemoryRegistry {
    async fn get_agent_bond(&self, id: ServiceId, agent_id: AgentId) -> Result<U256, ContractError> {
        let mut ledger = self.lock();
        ledger.record("get_agent_bond")?;
        Ok(ledger
            .token_bonds
            .get(&(id, agent_id))
            .copied()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ChainProvider for InMemoryRegistry {
    async fn get_code(&self, account: Address) -> Result<Bytes, ContractError> {
        let mut ledger = self.lock();
        ledger.record("get_code")?;
        if ledger.contract_accounts.contains(&account) {
            Ok(Bytes::from_static(&[0x60, 0x80, 0x60, 0x40]))
        } else {
            Ok(Bytes::new())
        }
    }
}

#[async_trait]
impl SafeTransactionService for InMemoryRegistry {
    async fn transaction_details(
        &self,
        _chain_id: u64,
        safe_tx_hash: B256,
    ) -> Result<Option<Receipt>, ContractError> {
        let mut ledger = self.lock();
        ledger.record("transaction_details")?;
        let Some((receipt, remaining)) = ledger.safe_txs.get_mut(&safe_tx_hash) else {
            return Ok(None);
        };
        match remaining {
            Some(0) | Some(1) => Ok(Some(*receipt)),
            Some(n) => {
                *n -= 1;
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
