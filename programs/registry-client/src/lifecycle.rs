use std::sync::Arc;

use alloy_primitives::{Address, Bytes, U256};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    approval::{ensure_allowance, Approval},
    bonds::{self, BondSummary},
    config::LifecycleConfig,
    constants::NON_NATIVE_ACTIVATION_VALUE,
    contracts::{
        DeployMode, PendingTx, Receipt, RegistryReader, RegistryWriter, TokenContract,
        TokenUtilityReader, TxOptions,
    },
    error::{ApprovalError, ContractError, LifecycleError, TransactionError, ValidationError},
    events::Notification,
    executor::{ExecutionContext, TransactionExecutor},
    guard::PendingActions,
    service_state::ServiceState,
    state::{
        AgentAddressInput, AgentInstanceSlot, AgentParams, InstanceOperator, SecurityToken, Service,
        ServiceId,
    },
    validator::{self, InstanceCheckError},
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    ActivateRegistration,
    UpdateConfig,
    RegisterAgents,
    Deploy,
    Terminate,
    Unbond,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub action: Action,
    pub from: ServiceState,
    pub requires_owner: bool,
}

const fn transition(action: Action, from: ServiceState, requires_owner: bool) -> Transition {
    Transition {
        action,
        from,
        requires_owner,
    }
}

pub const TRANSITIONS: [Transition; 8] = [
    transition(Action::ActivateRegistration, ServiceState::PreRegistration, true),
    transition(Action::UpdateConfig, ServiceState::PreRegistration, true),
    transition(Action::RegisterAgents, ServiceState::ActiveRegistration, false),
    transition(Action::Terminate, ServiceState::ActiveRegistration, true),
    transition(Action::Deploy, ServiceState::FinishedRegistration, true),
    transition(Action::Terminate, ServiceState::FinishedRegistration, true),
    transition(Action::Terminate, ServiceState::Deployed, true),
    transition(Action::Unbond, ServiceState::TerminatedBonded, false),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Authorization {
    pub current_state: ServiceState,
    /// `None` when no wallet is connected.
    pub caller: Option<Address>,
    pub owner: Address,
}

pub fn can_perform(action: Action, auth: &Authorization) -> bool {
    let Some(caller) = auth.caller else {
        return false;
    };
    TRANSITIONS.iter().any(|t| {
        t.action == action
            && t.from == auth.current_state
            && (!t.requires_owner || caller == auth.owner)
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// `state` is re-read from the registry after confirmation.
    Completed {
        receipt: Receipt,
        state: ServiceState,
        notification: Notification,
    },
    /// The same action is still in flight, nothing was sent.
    AlreadyPending,
    UpdateRequested { service_id: ServiceId },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceSnapshot {
    pub service: Service,
    pub current_step: i8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BondQuote {
    pub bonds: BondSummary,
    pub native_total: U256,
    /// Only for token secured services, never added to `native_total`.
    pub token_total: Option<U256>,
}

pub fn parse_payload(raw: &str) -> Result<Bytes, ValidationError> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    hex::decode(digits)
        .map(Bytes::from)
        .map_err(|_| ValidationError::MalformedPayload(raw.to_owned()))
}

fn summarize(rows: &[AgentInstanceSlot], counts: &[u64]) -> BondSummary {
    let agent_ids: Vec<_> = rows.iter().map(|r| r.agent_id).collect();
    let params: Vec<_> = rows
        .iter()
        .map(|r| AgentParams {
            slots: r.total_slots,
            bond: r.bond_per_instance,
        })
        .collect();
    let occupied: Vec<_> = rows.iter().map(|r| r.occupied_slots).collect();
    bonds::calculate(&agent_ids, &params, &occupied, counts)
}

pub struct Collaborators {
    pub reader: Arc<dyn RegistryReader>,
    pub writer: Arc<dyn RegistryWriter>,
    pub tokens: Arc<dyn TokenContract>,
    pub token_utility: Arc<dyn TokenUtilityReader>,
    pub executor: Arc<dyn TransactionExecutor>,
}

pub struct ServiceLifecycle {
    reader: Arc<dyn RegistryReader>,
    writer: Arc<dyn RegistryWriter>,
    tokens: Arc<dyn TokenContract>,
    token_utility: Arc<dyn TokenUtilityReader>,
    executor: Arc<dyn TransactionExecutor>,
    config: LifecycleConfig,
    pending: PendingActions,
}

impl ServiceLifecycle {
    pub fn new(collaborators: Collaborators, config: LifecycleConfig) -> Self {
        Self {
            reader: collaborators.reader,
            writer: collaborators.writer,
            tokens: collaborators.tokens,
            token_utility: collaborators.token_utility,
            executor: collaborators.executor,
            config,
            pending: PendingActions::new(),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn pending(&self) -> &PendingActions {
        &self.pending
    }

    pub async fn snapshot(&self, id: ServiceId) -> Result<ServiceSnapshot, LifecycleError> {
        let service = self.read_service(id).await?;
        Ok(ServiceSnapshot {
            current_step: service.state.current_step(),
            service,
        })
    }

    pub async fn is_owner(&self, id: ServiceId, account: Address) -> Result<bool, LifecycleError> {
        let owner = self
            .reader
            .owner_of(id)
            .await
            .map_err(|source| LifecycleError::Read {
                service_id: id,
                source,
            })?;
        Ok(owner == account)
    }

    /// Predicate for enabling an action button; false while the action is in flight.
    pub fn is_enabled(&self, action: Action, service: &Service, caller: Option<Address>) -> bool {
        if action == Action::UpdateConfig && !self.config.allow_update_in_pre_registration {
            return false;
        }
        let auth = Authorization {
            current_state: service.state,
            caller,
            owner: service.owner,
        };
        can_perform(action, &auth) && !self.pending.is_pending(service.id, action)
    }

    /* ----- step 1 ----- */

    #[instrument(skip(self, ctx), fields(account = %ctx.account))]
    pub async fn activate_registration(
        &self,
        ctx: &ExecutionContext,
        id: ServiceId,
    ) -> Result<Outcome, LifecycleError> {
        let Some(_guard) = self.pending.try_acquire(id, Action::ActivateRegistration) else {
            return Ok(Outcome::AlreadyPending);
        };
        let service = self.prepare(ctx, id, Action::ActivateRegistration).await?;

        let value = match self.security_token(id).await? {
            SecurityToken::Native => service.security_deposit,
            SecurityToken::Erc20(token) => {
                self.approve(ctx, token).await?;
                U256::from(NON_NATIVE_ACTIVATION_VALUE)
            }
        };

        let tx = self
            .writer
            .activate_registration(id, TxOptions::sender(ctx.account).with_value(value))
            .await
            .map_err(TransactionError::from)?;
        let receipt = self.execute(ctx, tx).await?;
        self.finish(ctx, id, receipt, Notification::Activated { service_id: id })
            .await
    }

    pub async fn request_update(
        &self,
        ctx: &ExecutionContext,
        id: ServiceId,
    ) -> Result<Outcome, LifecycleError> {
        let service = self.read_service(id).await?;
        if !self.is_enabled(Action::UpdateConfig, &service, Some(ctx.account)) {
            return Err(LifecycleError::NotPermitted {
                action: Action::UpdateConfig,
                state: service.state,
            });
        }
        Ok(Outcome::UpdateRequested { service_id: id })
    }

    /* ----- step 2 ----- */

    #[instrument(skip(self, ctx, inputs), fields(account = %ctx.account))]
    pub async fn register_agents(
        &self,
        ctx: &ExecutionContext,
        id: ServiceId,
        inputs: &[AgentAddressInput],
    ) -> Result<Outcome, LifecycleError> {
        let Some(_guard) = self.pending.try_acquire(id, Action::RegisterAgents) else {
            return Ok(Outcome::AlreadyPending);
        };
        let service = self.prepare(ctx, id, Action::RegisterAgents).await?;

        let expanded = validator::to_addresses(validator::expand_inputs(inputs))?;
        let rows = self
            .load_slot_table(&service)
            .await
            .map_err(|source| LifecycleError::Read {
                service_id: id,
                source,
            })?;
        validator::check_slot_capacity(&rows, &expanded)?;

        validator::check_instances_unregistered(
            self.reader.as_ref(),
            ctx.account,
            &expanded.addresses,
        )
        .await
        .map_err(|err| match err {
            InstanceCheckError::Invalid(invalid) => LifecycleError::Validation(invalid),
            InstanceCheckError::Read(source) => LifecycleError::Read {
                service_id: id,
                source,
            },
        })?;

        if let SecurityToken::Erc20(token) = self.security_token(id).await? {
            self.approve(ctx, token).await?;
        }

        let counts = bonds::address_counts(inputs, &service.agent_ids);
        let summary = summarize(&rows, &counts);

        debug!(
            instances = expanded.len(),
            total_bond = %summary.grand_total_bond,
            "registering agent instances"
        );
        let tx = self
            .writer
            .register_agents(
                id,
                &expanded.addresses,
                &expanded.agent_ids,
                TxOptions::sender(ctx.account).with_value(summary.grand_total_bond),
            )
            .await
            .map_err(TransactionError::from)?;
        let receipt = self.execute(ctx, tx).await?;
        self.finish(
            ctx,
            id,
            receipt,
            Notification::Registered {
                service_id: id,
                instances: expanded.len(),
            },
        )
        .await
    }

    /* ----- step 3 ----- */

    #[instrument(skip(self, ctx, payload), fields(account = %ctx.account))]
    pub async fn deploy(
        &self,
        ctx: &ExecutionContext,
        id: ServiceId,
        mode: DeployMode,
        payload: Bytes,
    ) -> Result<Outcome, LifecycleError> {
        let Some(_guard) = self.pending.try_acquire(id, Action::Deploy) else {
            return Ok(Outcome::AlreadyPending);
        };
        let service = self.prepare(ctx, id, Action::Deploy).await?;

        if mode == DeployMode::ReuseMultisig && !service.has_multisig() {
            return Err(ValidationError::MultisigUnavailable.into());
        }

        let tx = self
            .writer
            .deploy(id, mode, payload, TxOptions::sender(ctx.account))
            .await
            .map_err(TransactionError::from)?;
        let receipt = self.execute(ctx, tx).await?;
        self.finish(ctx, id, receipt, Notification::Deployed { service_id: id })
            .await
    }

    /* ----- steps 2 to 4 ----- */

    #[instrument(skip(self, ctx), fields(account = %ctx.account))]
    pub async fn terminate(
        &self,
        ctx: &ExecutionContext,
        id: ServiceId,
    ) -> Result<Outcome, LifecycleError> {
        let Some(_guard) = self.pending.try_acquire(id, Action::Terminate) else {
            return Ok(Outcome::AlreadyPending);
        };
        self.prepare(ctx, id, Action::Terminate).await?;

        let tx = self
            .writer
            .terminate(id, TxOptions::sender(ctx.account))
            .await
            .map_err(TransactionError::from)?;
        let receipt = self.execute(ctx, tx).await?;
        self.finish(ctx, id, receipt, Notification::Terminated { service_id: id })
            .await
    }

    /* ----- step 5 ----- */

    #[instrument(skip(self, ctx), fields(account = %ctx.account))]
    pub async fn unbond(&self, ctx: &ExecutionContext, id: ServiceId) -> Result<Outcome, LifecycleError> {
        let Some(_guard) = self.pending.try_acquire(id, Action::Unbond) else {
            return Ok(Outcome::AlreadyPending);
        };
        self.prepare(ctx, id, Action::Unbond).await?;

        let tx = self
            .writer
            .unbond(id, TxOptions::sender(ctx.account))
            .await
            .map_err(TransactionError::from)?;
        let receipt = self.execute(ctx, tx).await?;
        self.finish(ctx, id, receipt, Notification::Unbonded { service_id: id })
            .await
    }

    /* ----- read paths ----- */

    pub async fn load_slot_table(
        &self,
        service: &Service,
    ) -> Result<Vec<AgentInstanceSlot>, ContractError> {
        let params = self.reader.get_agent_params(service.id).await?;
        let instances = try_join_all(
            service
                .agent_ids
                .iter()
                .map(|agent_id| self.reader.get_instances_for_agent_id(service.id, *agent_id)),
        )
        .await?;
        let (rows, _) = bonds::slot_rows(&service.agent_ids, &params, &instances);
        Ok(rows)
    }

    /// Slot table for display, empty when any read fails.
    pub async fn slot_table(&self, id: ServiceId) -> Vec<AgentInstanceSlot> {
        let rows = match self.read_service(id).await {
            Ok(service) => self.load_slot_table(&service).await.map_err(|source| {
                LifecycleError::Read {
                    service_id: id,
                    source,
                }
            }),
            Err(err) => Err(err),
        };
        rows.unwrap_or_else(|err| {
            warn!(service_id = id, %err, "failed to load slot table");
            Vec::new()
        })
    }

    /// Bonds owed for the addresses typed in so far, zero on read failure.
    pub async fn bond_quote(&self, id: ServiceId, inputs: &[AgentAddressInput]) -> BondQuote {
        match self.try_bond_quote(id, inputs).await {
            Ok(quote) => quote,
            Err(err) => {
                warn!(service_id = id, %err, "error while fetching bonds");
                BondQuote::default()
            }
        }
    }

    async fn try_bond_quote(
        &self,
        id: ServiceId,
        inputs: &[AgentAddressInput],
    ) -> Result<BondQuote, LifecycleError> {
        let service = self.read_service(id).await?;
        let read_err = |source| LifecycleError::Read {
            service_id: id,
            source,
        };
        let rows = self.load_slot_table(&service).await.map_err(read_err)?;
        let counts = bonds::address_counts(inputs, &service.agent_ids);
        let summary = summarize(&rows, &counts);

        let token_total = match self.security_token(id).await? {
            SecurityToken::Native => None,
            SecurityToken::Erc20(_) => {
                let token_bonds = try_join_all(
                    service
                        .agent_ids
                        .iter()
                        .map(|agent_id| self.token_utility.get_agent_bond(id, *agent_id)),
                )
                .await
                .map_err(read_err)?;
                Some(bonds::token_bond_total(&token_bonds, &counts).0)
            }
        };

        Ok(BondQuote {
            native_total: summary.grand_total_bond,
            bonds: summary,
            token_total,
        })
    }

    /// Instance and operator pairs of a deployed service, empty on read failure.
    pub async fn instance_operators(&self, id: ServiceId) -> Vec<InstanceOperator> {
        let rows = async {
            let instances = self.reader.get_agent_instances(id).await?;
            let operators = try_join_all(
                instances
                    .iter()
                    .map(|instance| self.reader.map_agent_instance_operators(*instance)),
            )
            .await?;
            Ok::<_, ContractError>(
                instances
                    .into_iter()
                    .zip(operators)
                    .map(|(agent_instance, operator)| InstanceOperator {
                        agent_instance,
                        operator,
                    })
                    .collect(),
            )
        };
        rows.await.unwrap_or_else(|err| {
            warn!(service_id = id, %err, "failed to load agent instances");
            Vec::new()
        })
    }

    /* ----- helpers ----- */

    async fn read_service(&self, id: ServiceId) -> Result<Service, LifecycleError> {
        self.reader
            .get_service(id)
            .await
            .map_err(|source| LifecycleError::Read {
                service_id: id,
                source,
            })
    }

    async fn prepare(
        &self,
        ctx: &ExecutionContext,
        id: ServiceId,
        action: Action,
    ) -> Result<Service, LifecycleError> {
        let service = self.read_service(id).await?;
        let auth = Authorization {
            current_state: service.state,
            caller: Some(ctx.account),
            owner: service.owner,
        };
        if !can_perform(action, &auth) {
            return Err(LifecycleError::NotPermitted {
                action,
                state: service.state,
            });
        }
        Ok(service)
    }

    async fn security_token(&self, id: ServiceId) -> Result<SecurityToken, ApprovalError> {
        if !self.config.token_aware {
            return Ok(SecurityToken::Native);
        }
        let details = self
            .reader
            .get_token_details(id)
            .await
            .map_err(ApprovalError::TokenLookup)?;
        Ok(SecurityToken::from_address(details.token))
    }

    async fn approve(
        &self,
        ctx: &ExecutionContext,
        token: Address,
    ) -> Result<Approval, ApprovalError> {
        // never fall back to another chain's spender
        let spender = self.config.approval_spender(ctx.chain_id)?;
        ensure_allowance(
            self.tokens.as_ref(),
            self.executor.as_ref(),
            ctx,
            token,
            spender,
        )
        .await
    }

    async fn execute(&self, ctx: &ExecutionContext, tx: PendingTx) -> Result<Receipt, LifecycleError> {
        info!(tx = %tx.hash, "transaction submitted");
        self.executor.send(ctx, tx).await
    }

    async fn finish(
        &self,
        ctx: &ExecutionContext,
        id: ServiceId,
        receipt: Receipt,
        notification: Notification,
    ) -> Result<Outcome, LifecycleError> {
        let state = self.read_service(id).await?.state;
        info!(service_id = id, %state, "{}", notification);
        ctx.notify(notification.clone());
        Ok(Outcome::Completed {
            receipt,
            state,
            notification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(state: ServiceState, caller: Option<Address>, owner: Address) -> Authorization {
        Authorization {
            current_state: state,
            caller,
            owner,
        }
    }

    #[test]
    fn wrong_state_is_never_permitted() {
        let owner = Address::repeat_byte(1);
        for transition in TRANSITIONS {
            for state in ServiceState::ALL {
                let permitted = can_perform(transition.action, &auth(state, Some(owner), owner));
                // terminate is listed once per state it is legal in
                let other_row = TRANSITIONS
                    .iter()
                    .any(|t| t.action == transition.action && t.from == state);
                if state == transition.from || other_row {
                    assert!(permitted, "{:?} in {:?}", transition.action, state);
                } else {
                    assert!(!permitted, "{:?} in {:?}", transition.action, state);
                }
            }
        }
    }

    #[test]
    fn terminate_states() {
        let owner = Address::repeat_byte(1);
        let allowed: Vec<_> = ServiceState::ALL
            .into_iter()
            .filter(|s| can_perform(Action::Terminate, &auth(*s, Some(owner), owner)))
            .collect();
        assert_eq!(
            allowed,
            vec![
                ServiceState::ActiveRegistration,
                ServiceState::FinishedRegistration,
                ServiceState::Deployed
            ]
        );
    }

    #[test]
    fn owner_and_wallet_gating() {
        let owner = Address::repeat_byte(1);
        let stranger = Address::repeat_byte(2);
        let active = ServiceState::ActiveRegistration;

        assert!(!can_perform(Action::Terminate, &auth(active, Some(stranger), owner)));
        assert!(can_perform(Action::RegisterAgents, &auth(active, Some(stranger), owner)));
        assert!(!can_perform(Action::RegisterAgents, &auth(active, None, owner)));
        assert!(can_perform(
            Action::Unbond,
            &auth(ServiceState::TerminatedBonded, Some(stranger), owner)
        ));
        assert!(!can_perform(
            Action::ActivateRegistration,
            &auth(ServiceState::PreRegistration, Some(stranger), owner)
        ));
    }

    #[test]
    fn payload_parsing() {
        assert_eq!(parse_payload("0x").unwrap(), Bytes::new());
        assert_eq!(parse_payload("0xdeadbeef").unwrap().len(), 4);
        assert_eq!(parse_payload("00ff").unwrap().to_vec(), vec![0, 0xff]);
        assert!(matches!(
            parse_payload("0xzz"),
            Err(ValidationError::MalformedPayload(_))
        ));
    }
}
