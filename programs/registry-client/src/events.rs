use std::fmt;

use alloy_primitives::B256;
use serde::Serialize;

use crate::state::ServiceId;

/// Success notice surfaced to the caller once an action settles.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    Activated { service_id: ServiceId },
    Registered { service_id: ServiceId, instances: usize },
    Deployed { service_id: ServiceId },
    Terminated { service_id: ServiceId },
    Unbonded { service_id: ServiceId },
    TokenApproved { tx_hash: B256 },
    SafeSubmissionRequested { tx_hash: B256 },
}

impl Notification {
    pub fn message(&self) -> &'static str {
        match self {
            Notification::Activated { .. } => "Activated Successfully",
            Notification::Registered { .. } => "Registered Successfully",
            Notification::Deployed { .. } => "Deployed Successfully",
            Notification::Terminated { .. } => "Terminated Successfully",
            Notification::Unbonded { .. } => "Unbonded Successfully",
            Notification::TokenApproved { .. } => "Token approved",
            Notification::SafeSubmissionRequested { .. } => {
                "Please submit the transaction in your safe app."
            }
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}
