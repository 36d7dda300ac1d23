use std::{collections::HashSet, str::FromStr};

use alloy_primitives::Address;
use futures::future::try_join_all;
use tracing::debug;

use crate::{
    constants::ZERO_ADDRESS,
    contracts::RegistryReader,
    error::{ContractError, ValidationError},
    state::{AgentAddressInput, AgentId, AgentInstanceSlot},
};

/// Instance addresses flattened with their agent id repeated per address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExpandedInstances<A> {
    pub addresses: Vec<A>,
    pub agent_ids: Vec<AgentId>,
}

impl<A> ExpandedInstances<A> {
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

pub fn parse_address_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

pub fn parse_integer_list(raw: &str) -> Result<Vec<u32>, ValidationError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|_| ValidationError::MalformedIntegerList(s.to_owned()))
        })
        .collect()
}

/// `per_agent[k]` is paired with `agent_ids[k]`; extra entries on either
/// side are ignored.
pub fn expand_addresses_to_agent_ids<S: AsRef<str>>(
    per_agent: &[S],
    agent_ids: &[AgentId],
) -> ExpandedInstances<String> {
    let mut expanded = ExpandedInstances::default();
    for (raw, &agent_id) in per_agent.iter().zip(agent_ids) {
        for address in parse_address_list(raw.as_ref()) {
            expanded.addresses.push(address);
            expanded.agent_ids.push(agent_id);
        }
    }
    expanded
}

/// Same expansion for user input rows; rows with no addresses are skipped.
pub fn expand_inputs(inputs: &[AgentAddressInput]) -> ExpandedInstances<String> {
    let (per_agent, agent_ids): (Vec<&str>, Vec<AgentId>) = inputs
        .iter()
        .filter(|input| !input.addresses.trim().is_empty())
        .map(|input| (input.addresses.as_str(), input.agent_id))
        .unzip();
    expand_addresses_to_agent_ids(&per_agent, &agent_ids)
}

pub fn to_addresses(
    expanded: ExpandedInstances<String>,
) -> Result<ExpandedInstances<Address>, ValidationError> {
    let addresses = expanded
        .addresses
        .iter()
        .map(|raw| {
            Address::from_str(raw).map_err(|_| ValidationError::MalformedAddressList(raw.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ExpandedInstances {
        addresses,
        agent_ids: expanded.agent_ids,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum InstanceCheckError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Read(#[from] ContractError),
}

/// Rejects the whole batch when the operator is itself an instance or any
/// candidate is already bound to an operator.
pub async fn check_instances_unregistered(
    reader: &dyn RegistryReader,
    operator: Address,
    candidates: &[Address],
) -> Result<bool, InstanceCheckError> {
    let bound = reader.map_agent_instance_operators(operator).await?;
    if bound != ZERO_ADDRESS {
        return Err(ValidationError::OperatorAlreadyInstance { operator }.into());
    }

    let operators =
        try_join_all(candidates.iter().map(|c| reader.map_agent_instance_operators(*c))).await?;

    if let Some((instance, operator)) = candidates
        .iter()
        .zip(operators)
        .find(|(_, operator)| *operator != ZERO_ADDRESS)
    {
        debug!(%instance, %operator, "agent instance already registered");
        return Err(ValidationError::InstanceAlreadyRegistered {
            instance: *instance,
            operator,
        }
        .into());
    }

    Ok(true)
}

pub fn check_slot_capacity(
    rows: &[AgentInstanceSlot],
    expanded: &ExpandedInstances<Address>,
) -> Result<(), ValidationError> {
    if expanded.is_empty() {
        return Err(ValidationError::EmptyRegistration);
    }

    let mut seen = HashSet::with_capacity(expanded.len());
    if let Some(dup) = expanded.addresses.iter().find(|a| !seen.insert(**a)) {
        return Err(ValidationError::DuplicateInstance(*dup));
    }

    let mut targeted: Vec<AgentId> = expanded.agent_ids.clone();
    targeted.dedup();
    for agent_id in targeted {
        let row = rows
            .iter()
            .find(|r| r.agent_id == agent_id)
            .ok_or(ValidationError::UnknownAgentId(agent_id))?;
        let requested = expanded.agent_ids.iter().filter(|a| **a == agent_id).count() as u64;
        if row.available_slots == 0 {
            return Err(ValidationError::NoAvailableSlots { agent_id });
        }
        if requested > row.available_slots {
            return Err(ValidationError::SlotsExceeded {
                agent_id,
                available: row.available_slots,
                requested,
            });
        }
    }
    Ok(())
}

/// Threshold must cover two thirds of all instance slots and not exceed them.
pub fn validate_threshold(threshold: u32, max_num_agent_instances: u32) -> Result<(), ValidationError> {
    let min = (max_num_agent_instances.saturating_mul(2).saturating_add(1)).div_ceil(3);
    if threshold < min || threshold > max_num_agent_instances {
        return Err(ValidationError::WrongThreshold {
            threshold,
            min,
            max: max_num_agent_instances,
        });
    }
    Ok(())
}
