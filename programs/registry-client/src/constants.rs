use std::time::Duration;

use alloy_primitives::{address, Address};

pub const MAX_AGENT_IDS_PER_SERVICE: usize = 128;
pub const MAX_AGENT_INSTANCES_PER_SERVICE: usize = 192;

/// Marker used by the token utility for services secured by the native asset.
pub const NATIVE_TOKEN: Address = address!("EeeeeEeeeEeEeeEeEeEeeEEEeeeeEeeeeeeeEEeE");
pub const ZERO_ADDRESS: Address = Address::ZERO;

// Safe transaction service is polled at this rate until the safe tx executes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_POLL_DURATION: Duration = Duration::from_secs(600);

// Token secured services pay the real deposit through the approval
pub const NON_NATIVE_ACTIVATION_VALUE: u64 = 1;

pub const DEFAULT_CHAIN_ID: u64 = 1;
