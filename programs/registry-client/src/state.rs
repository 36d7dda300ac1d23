use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use crate::{
    constants::{NATIVE_TOKEN, ZERO_ADDRESS},
    service_state::ServiceState,
};

pub type ServiceId = u128;
pub type AgentId = u32;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AgentParams {
    pub slots: u64,
    pub bond: U256,
}

/// Service record as stored by the registry.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Service {
    pub id: ServiceId,
    pub state: ServiceState,
    pub owner: Address,
    pub security_deposit: U256,
    pub agent_ids: Vec<AgentId>,
    pub agent_params: Vec<AgentParams>,
    pub multisig: Address,
    pub threshold: u32,
    pub token: Address,
    pub config_hash: B256,
}

impl Service {
    pub fn security_token(&self) -> SecurityToken {
        SecurityToken::from_address(self.token)
    }

    pub fn has_multisig(&self) -> bool {
        self.multisig != ZERO_ADDRESS
    }

    pub fn max_num_agent_instances(&self) -> u64 {
        self.agent_params.iter().map(|p| p.slots).sum()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityToken {
    Native,
    Erc20(Address),
}

impl SecurityToken {
    // Zero means the token utility holds no record, which is the native path too
    pub fn from_address(token: Address) -> Self {
        if token == NATIVE_TOKEN || token == ZERO_ADDRESS {
            SecurityToken::Native
        } else {
            SecurityToken::Erc20(token)
        }
    }

    pub fn is_native(self) -> bool {
        matches!(self, SecurityToken::Native)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentInstances {
    pub num_agent_instances: u64,
    pub agent_instances: Vec<Address>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenDetails {
    pub token: Address,
    pub security_deposit: U256,
}

/// Derived per agent id row, recomputed on every read.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentInstanceSlot {
    pub agent_id: AgentId,
    pub total_slots: u64,
    pub occupied_slots: u64,
    pub available_slots: u64,
    pub bond_per_instance: U256,
    pub agent_addresses: Vec<Address>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceOperator {
    pub agent_instance: Address,
    pub operator: Address,
}

/// Free text entered by an operator for one agent id, e.g. `"0xA, 0xB"`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentAddressInput {
    pub agent_id: AgentId,
    pub addresses: String,
}

impl AgentAddressInput {
    pub fn new(agent_id: AgentId, addresses: impl Into<String>) -> Self {
        Self {
            agent_id,
            addresses: addresses.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_and_zero_tokens_are_native() {
        assert!(SecurityToken::from_address(NATIVE_TOKEN).is_native());
        assert!(SecurityToken::from_address(ZERO_ADDRESS).is_native());
        let olas = Address::repeat_byte(0x0a);
        assert_eq!(SecurityToken::from_address(olas), SecurityToken::Erc20(olas));
    }
}
