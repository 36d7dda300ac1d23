use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StateInconsistencyWarning;

#[repr(u8)]
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceState {
    #[default]
    NonExistent,
    PreRegistration,
    ActiveRegistration,
    FinishedRegistration,
    Deployed,
    TerminatedBonded,
}

impl ServiceState {
    pub const ALL: [ServiceState; 6] = [
        ServiceState::NonExistent,
        ServiceState::PreRegistration,
        ServiceState::ActiveRegistration,
        ServiceState::FinishedRegistration,
        ServiceState::Deployed,
        ServiceState::TerminatedBonded,
    ];

    /// Label shown next to the raw registry state.
    pub fn label(self) -> &'static str {
        match self {
            ServiceState::NonExistent => "Non Existent",
            ServiceState::PreRegistration => "Pre Registration",
            ServiceState::ActiveRegistration => "Active Registration",
            ServiceState::FinishedRegistration => "Finished Registration",
            ServiceState::Deployed => "Deployed",
            ServiceState::TerminatedBonded => "Terminated Bonded",
        }
    }

    /// Title of the step indicator entry, `None` for `NonExistent` which has no step.
    pub fn step_title(self) -> Option<&'static str> {
        match self {
            ServiceState::NonExistent => None,
            ServiceState::PreRegistration => Some("Pre-Registration"),
            ServiceState::ActiveRegistration => Some("Active Registration"),
            ServiceState::FinishedRegistration => Some("Finished Registration"),
            ServiceState::Deployed => Some("Deployed"),
            ServiceState::TerminatedBonded => Some("Terminated Bonded"),
        }
    }

    /// Zero-based step index: `state - 1`, so `NonExistent` sits at `-1`.
    pub fn current_step(self) -> i8 {
        self as i8 - 1
    }

    /// Decodes a raw registry state, logging values outside the enum.
    pub fn decode(raw: u8) -> Option<ServiceState> {
        match ServiceState::try_from(raw) {
            Ok(state) => Some(state),
            Err(warning) => {
                warn!(%warning, "ignoring service state");
                None
            }
        }
    }

    pub fn from_step(step: i8) -> Option<ServiceState> {
        let raw = step.checked_add(1)?;
        u8::try_from(raw).ok().and_then(|raw| ServiceState::try_from(raw).ok())
    }
}

impl TryFrom<u8> for ServiceState {
    type Error = StateInconsistencyWarning;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ServiceState::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(StateInconsistencyWarning::UnknownState(value))
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_round_trips_to_label() {
        let labels = [
            "Non Existent",
            "Pre Registration",
            "Active Registration",
            "Finished Registration",
            "Deployed",
            "Terminated Bonded",
        ];
        for (raw, label) in labels.iter().enumerate() {
            let state = ServiceState::try_from(raw as u8).unwrap();
            let step = state.current_step();
            assert_eq!(step, raw as i8 - 1);
            assert_eq!(ServiceState::from_step(step).unwrap().label(), *label);
        }
    }

    #[test]
    fn unknown_raw_state_is_reported() {
        assert_eq!(
            ServiceState::try_from(6),
            Err(StateInconsistencyWarning::UnknownState(6))
        );
        assert_eq!(ServiceState::decode(9), None);
        assert_eq!(ServiceState::decode(4), Some(ServiceState::Deployed));
        assert_eq!(ServiceState::from_step(5), None);
        assert_eq!(ServiceState::from_step(-2), None);
    }

    #[test]
    fn non_existent_has_no_step_title() {
        assert_eq!(ServiceState::NonExistent.step_title(), None);
        assert_eq!(
            ServiceState::PreRegistration.step_title(),
            Some("Pre-Registration")
        );
    }
}
