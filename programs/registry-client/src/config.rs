use std::{collections::BTreeMap, time::Duration};

use alloy_primitives::Address;
use serde::Deserialize;

use crate::{
    constants::{DEFAULT_CHAIN_ID, DEFAULT_MAX_POLL_DURATION, DEFAULT_POLL_INTERVAL},
    error::ApprovalError,
};

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChainAddresses {
    pub service_registry_token_utility: Address,
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct LifecycleConfig {
    /// Safe transaction service polling interval, in milliseconds.
    pub poll_interval_ms: u64,
    /// Upper bound on confirmation polling, in seconds.
    pub max_poll_duration_secs: u64,
    pub allow_update_in_pre_registration: bool,
    /// When false the ERC20 approval step is skipped entirely (native only deployments).
    pub token_aware: bool,
    pub default_chain_id: u64,
    pub chains: BTreeMap<u64, ChainAddresses>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            max_poll_duration_secs: DEFAULT_MAX_POLL_DURATION.as_secs(),
            allow_update_in_pre_registration: true,
            token_aware: true,
            default_chain_id: DEFAULT_CHAIN_ID,
            chains: BTreeMap::new(),
        }
    }
}

impl LifecycleConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn with_chain(mut self, chain_id: u64, token_utility: Address) -> Self {
        self.chains.insert(
            chain_id,
            ChainAddresses {
                service_registry_token_utility: token_utility,
            },
        );
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_poll_duration(&self) -> Duration {
        Duration::from_secs(self.max_poll_duration_secs)
    }

    /// Unsupported or missing chain ids fall back to the default chain.
    pub fn resolve_chain_id(&self, chain_id: Option<u64>) -> u64 {
        match chain_id {
            Some(id) if self.chains.contains_key(&id) => id,
            _ => self.default_chain_id,
        }
    }

    pub fn approval_spender(&self, chain_id: u64) -> Result<Address, ApprovalError> {
        self.chains
            .get(&chain_id)
            .map(|c| c.service_registry_token_utility)
            .ok_or(ApprovalError::UnknownChain(chain_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_json_with_defaults() {
        let config = LifecycleConfig::from_json(
            r#"{
                "pollIntervalMs": 500,
                "chains": {
                    "100": { "serviceRegistryTokenUtility": "0xa45E64d13A30a51b91ae0eb182e88a40e9b18eD8" }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.max_poll_duration(), DEFAULT_MAX_POLL_DURATION);
        assert!(config.token_aware);
        assert_eq!(config.resolve_chain_id(Some(100)), 100);
        assert!(config.approval_spender(100).is_ok());
    }

    #[test]
    fn unknown_chain_falls_back_to_default() {
        let config = LifecycleConfig::default();
        assert_eq!(config.resolve_chain_id(Some(31337)), DEFAULT_CHAIN_ID);
        assert_eq!(config.resolve_chain_id(None), DEFAULT_CHAIN_ID);
        assert_eq!(
            config.approval_spender(5),
            Err(ApprovalError::UnknownChain(5))
        );
    }
}
