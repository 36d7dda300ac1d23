use alloy_primitives::{Address, U256};
use tracing::{debug, info};

use crate::{
    contracts::{TokenContract, TxOptions},
    error::{ApprovalError, LifecycleError},
    events::Notification,
    executor::{ExecutionContext, TransactionExecutor},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Approval {
    pub approved: bool,
    pub tx_performed: bool,
}

/// Approves `spender` for the maximum amount unless it already is.
pub async fn ensure_allowance(
    tokens: &dyn TokenContract,
    executor: &dyn TransactionExecutor,
    ctx: &ExecutionContext,
    token: Address,
    spender: Address,
) -> Result<Approval, ApprovalError> {
    let allowance = tokens
        .allowance(token, ctx.account, spender)
        .await
        .map_err(ApprovalError::Allowance)?;

    if allowance == U256::MAX {
        debug!(%token, %spender, "allowance already at maximum");
        return Ok(Approval {
            approved: true,
            tx_performed: false,
        });
    }

    let pending = tokens
        .approve(token, spender, U256::MAX, TxOptions::sender(ctx.account))
        .await
        .map_err(|err| ApprovalError::Approve(Box::new(LifecycleError::Transaction(err.into()))))?;
    let receipt = executor
        .send(ctx, pending)
        .await
        .map_err(|err| ApprovalError::Approve(Box::new(err)))?;

    info!(%token, %spender, tx = %receipt.transaction_hash, "token approved");
    ctx.notify(Notification::TokenApproved {
        tx_hash: receipt.transaction_hash,
    });

    Ok(Approval {
        approved: true,
        tx_performed: true,
    })
}
