use alloy_primitives::U256;
use serde::Serialize;
use tracing::warn;

use crate::{
    error::StateInconsistencyWarning,
    state::{AgentAddressInput, AgentId, AgentInstanceSlot, AgentInstances, AgentParams},
    validator::parse_address_list,
};

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BondRow {
    pub agent_id: AgentId,
    pub total_slots: u64,
    pub occupied_slots: u64,
    pub available_slots: u64,
    pub bond_per_slot: U256,
    pub supplied_addresses: u64,
    pub total_bond: U256,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BondSummary {
    pub rows: Vec<BondRow>,
    /// Native denominated. Token bonds are summed separately by `token_bond_total`.
    pub grand_total_bond: U256,
    #[serde(skip)]
    pub warnings: Vec<StateInconsistencyWarning>,
}

impl BondSummary {
    pub fn row(&self, agent_id: AgentId) -> Option<&BondRow> {
        self.rows.iter().find(|r| r.agent_id == agent_id)
    }
}

/// Missing `occupied` or `supplied` entries count as zero; agent ids and params
/// are zipped to the shorter of the two.
pub fn calculate(
    agent_ids: &[AgentId],
    params: &[AgentParams],
    occupied: &[u64],
    supplied: &[u64],
) -> BondSummary {
    let mut warnings = Vec::new();
    if agent_ids.len() != params.len() {
        warnings.push(StateInconsistencyWarning::LengthMismatch {
            agent_ids: agent_ids.len(),
            params: params.len(),
        });
    }

    let mut grand_total_bond = U256::ZERO;
    let mut overflowed = false;
    let mut rows = Vec::with_capacity(agent_ids.len().min(params.len()));

    for (i, (&agent_id, param)) in agent_ids.iter().zip(params).enumerate() {
        let occupied_slots = occupied.get(i).copied().unwrap_or_default();
        let supplied_addresses = supplied.get(i).copied().unwrap_or_default();
        let available_slots = available(agent_id, param.slots, occupied_slots, &mut warnings);

        let (total_bond, mul_overflow) = param
            .bond
            .overflowing_mul(U256::from(supplied_addresses));
        let (sum, add_overflow) = grand_total_bond.overflowing_add(total_bond);
        overflowed |= mul_overflow || add_overflow;
        grand_total_bond = if add_overflow { U256::MAX } else { sum };

        rows.push(BondRow {
            agent_id,
            total_slots: param.slots,
            occupied_slots,
            available_slots,
            bond_per_slot: param.bond,
            supplied_addresses,
            total_bond: if mul_overflow { U256::MAX } else { total_bond },
        });
    }

    if overflowed {
        warnings.push(StateInconsistencyWarning::BondOverflow);
        grand_total_bond = U256::MAX;
    }
    report(&warnings);

    BondSummary {
        rows,
        grand_total_bond,
        warnings,
    }
}

/// Number of addresses typed in for each of `agent_ids`, index aligned.
pub fn address_counts(inputs: &[AgentAddressInput], agent_ids: &[AgentId]) -> Vec<u64> {
    agent_ids
        .iter()
        .map(|agent_id| {
            inputs
                .iter()
                .filter(|input| input.agent_id == *agent_id)
                .map(|input| parse_address_list(&input.addresses).len() as u64)
                .sum()
        })
        .collect()
}

pub fn slot_rows(
    agent_ids: &[AgentId],
    params: &[AgentParams],
    instances: &[AgentInstances],
) -> (Vec<AgentInstanceSlot>, Vec<StateInconsistencyWarning>) {
    let mut warnings = Vec::new();
    if agent_ids.len() != params.len() {
        warnings.push(StateInconsistencyWarning::LengthMismatch {
            agent_ids: agent_ids.len(),
            params: params.len(),
        });
    }

    let rows = agent_ids
        .iter()
        .zip(params)
        .enumerate()
        .map(|(i, (&agent_id, param))| {
            let (occupied_slots, agent_addresses) = instances
                .get(i)
                .map(|info| (info.num_agent_instances, info.agent_instances.clone()))
                .unwrap_or_default();
            AgentInstanceSlot {
                agent_id,
                total_slots: param.slots,
                occupied_slots,
                available_slots: available(agent_id, param.slots, occupied_slots, &mut warnings),
                bond_per_instance: param.bond,
                agent_addresses,
            }
        })
        .collect();

    report(&warnings);
    (rows, warnings)
}

/// Token denominated total: `sum(token_bonds[i] * counts[i])`.
pub fn token_bond_total(token_bonds: &[U256], counts: &[u64]) -> (U256, Option<StateInconsistencyWarning>) {
    let mut total = U256::ZERO;
    for (bond, count) in token_bonds.iter().zip(counts) {
        let summed = bond
            .checked_mul(U256::from(*count))
            .and_then(|b| total.checked_add(b));
        match summed {
            Some(next) => total = next,
            None => {
                warn!("token bond total overflowed");
                return (U256::MAX, Some(StateInconsistencyWarning::BondOverflow));
            }
        }
    }
    (total, None)
}

fn available(
    agent_id: AgentId,
    total: u64,
    occupied: u64,
    warnings: &mut Vec<StateInconsistencyWarning>,
) -> u64 {
    if occupied > total {
        warnings.push(StateInconsistencyWarning::OccupiedExceedsTotal {
            agent_id,
            total,
            occupied,
        });
    }
    total.saturating_sub(occupied)
}

fn report(warnings: &[StateInconsistencyWarning]) {
    for warning in warnings {
        warn!(%warning, "inconsistent service data");
    }
}
