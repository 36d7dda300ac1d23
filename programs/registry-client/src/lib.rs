//! Lifecycle client for services in the autonolas service registry.
//!
//! A service moves through five on-chain states. [`ServiceLifecycle`] guards
//! each transition, validates agent instance input, computes bonds, approves
//! ERC20 security tokens and waits for confirmation on plain accounts and
//! multisig wallets alike.

pub mod approval;
pub mod bonds;
pub mod config;
pub mod constants;
pub mod contracts;
pub mod error;
pub mod events;
pub mod executor;
pub mod guard;
pub mod in_memory;
pub mod lifecycle;
pub mod logging;
pub mod service_state;
pub mod state;
pub mod validator;

pub use config::LifecycleConfig;
pub use contracts::{DeployMode, PendingTx, Receipt, TxOptions};
pub use error::{
    ApprovalError, ContractError, LifecycleError, StateInconsistencyWarning, TransactionError,
    ValidationError,
};
pub use events::Notification;
pub use executor::{cancellation, CancelHandle, CancelSignal, ExecutionContext, WalletExecutor};
pub use lifecycle::{can_perform, Action, Authorization, Collaborators, Outcome, ServiceLifecycle};
pub use service_state::ServiceState;
pub use state::{AgentAddressInput, AgentId, AgentInstanceSlot, Service, ServiceId};
