use std::time::Duration;

use alloy_primitives::{Address, B256};
use thiserror::Error;

use crate::{
    lifecycle::Action,
    service_state::ServiceState,
    state::{AgentId, ServiceId},
};

/// Failure reported by a registry, token or provider collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("rpc request failed: {0}")]
    Rpc(String),
    #[error("execution reverted: {0}")]
    Reverted(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("operator {operator} is registered as an agent instance already")]
    OperatorAlreadyInstance { operator: Address },
    #[error("agent instance {instance} is already registered to operator {operator}")]
    InstanceAlreadyRegistered { instance: Address, operator: Address },
    #[error("malformed address list entry {0:?}")]
    MalformedAddressList(String),
    #[error("malformed integer list entry {0:?}")]
    MalformedIntegerList(String),
    #[error("malformed deploy payload {0:?}")]
    MalformedPayload(String),
    #[error("no available slots for agent id {agent_id}")]
    NoAvailableSlots { agent_id: AgentId },
    #[error("agent id {agent_id} has {available} available slots, {requested} instances supplied")]
    SlotsExceeded {
        agent_id: AgentId,
        available: u64,
        requested: u64,
    },
    #[error("agent id {0} is not part of the service")]
    UnknownAgentId(AgentId),
    #[error("agent instance {0} is supplied more than once")]
    DuplicateInstance(Address),
    #[error("no agent instances supplied")]
    EmptyRegistration,
    #[error("service has no multisig to reuse")]
    MultisigUnavailable,
    #[error("threshold {threshold} must be within {min}..={max}")]
    WrongThreshold { threshold: u32, min: u32, max: u32 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("failed to send transaction: {0}")]
    Send(ContractError),
    #[error("transaction reverted: {reason}")]
    Reverted { reason: String },
    #[error("failed to fetch account code: {0}")]
    CodeLookup(ContractError),
    #[error("failed to fetch safe transaction details: {0}")]
    SafeService(ContractError),
    #[error("transaction confirmation cancelled")]
    Cancelled,
}

impl From<ContractError> for TransactionError {
    fn from(err: ContractError) -> Self {
        match err {
            ContractError::Reverted(reason) => TransactionError::Reverted { reason },
            other => TransactionError::Send(other),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("failed to read token details: {0}")]
    TokenLookup(ContractError),
    #[error("failed to read allowance: {0}")]
    Allowance(ContractError),
    #[error("approval transaction failed: {0}")]
    Approve(Box<LifecycleError>),
    #[error("no token utility configured for chain {0}")]
    UnknownChain(u64),
}

/// Non-fatal data problems found on read paths.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateInconsistencyWarning {
    #[error("agent id {agent_id} has {occupied} occupied of {total} slots")]
    OccupiedExceedsTotal {
        agent_id: AgentId,
        total: u64,
        occupied: u64,
    },
    #[error("registry reported unknown service state {0}")]
    UnknownState(u8),
    #[error("{agent_ids} agent ids but {params} agent params")]
    LengthMismatch { agent_ids: usize, params: usize },
    #[error("bond total overflowed")]
    BondOverflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error("confirmation of {hash} not observed after {elapsed:?}")]
    PollingTimeout { hash: B256, elapsed: Duration },
    #[error("{action:?} is not permitted in state {state}")]
    NotPermitted { action: Action, state: ServiceState },
    #[error("failed to read service {service_id}: {source}")]
    Read {
        service_id: ServiceId,
        source: ContractError,
    },
}

impl LifecycleError {
    /// Message suitable for a user notification.
    pub fn user_message(&self) -> String {
        match self {
            LifecycleError::Validation(ValidationError::OperatorAlreadyInstance { .. }) => {
                "The operator is registered as an agent instance already.".to_string()
            }
            LifecycleError::Validation(ValidationError::InstanceAlreadyRegistered { .. }) => {
                "The agent instance address is already registered.".to_string()
            }
            LifecycleError::Validation(
                ValidationError::MalformedAddressList(_) | ValidationError::DuplicateInstance(_),
            ) => "Please enter valid addresses.".to_string(),
            LifecycleError::Approval(_) => "Token approval failed, please try again.".to_string(),
            LifecycleError::PollingTimeout { .. } => {
                "Transaction is still pending, check again later.".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LifecycleError::Approval(_) | LifecycleError::PollingTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revert_reason_is_kept() {
        let err: TransactionError = ContractError::Reverted("WrongServiceState".into()).into();
        assert_eq!(
            err,
            TransactionError::Reverted {
                reason: "WrongServiceState".into()
            }
        );
        assert!(err.to_string().contains("WrongServiceState"));
    }

    #[test]
    fn validation_kinds_have_distinct_messages() {
        let operator: LifecycleError = ValidationError::OperatorAlreadyInstance {
            operator: Address::ZERO,
        }
        .into();
        let instance: LifecycleError = ValidationError::InstanceAlreadyRegistered {
            instance: Address::ZERO,
            operator: Address::repeat_byte(0xde),
        }
        .into();
        assert_ne!(operator.user_message(), instance.user_message());
        assert!(!operator.is_retryable());
    }
}
