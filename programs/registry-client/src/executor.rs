use std::{future::Future, sync::Arc, time::Duration};

use alloy_primitives::Address;
use async_trait::async_trait;
use tokio::{
    sync::{mpsc::UnboundedSender, watch},
    time::Instant,
};
use tracing::{debug, info, instrument};

use crate::{
    config::LifecycleConfig,
    contracts::{ChainProvider, PendingTx, Receipt, SafeTransactionService},
    error::{LifecycleError, TransactionError},
    events::Notification,
};

/// Cancels every `CancelSignal` cloned from the same pair.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

#[derive(Clone, Debug)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        CancelSignal(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancelled, never if the handle is dropped first.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

/// Who is sending, on which chain, plus the caller's notification sink.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub account: Address,
    pub chain_id: u64,
    pub cancel: CancelSignal,
    notifications: Option<UnboundedSender<Notification>>,
}

impl ExecutionContext {
    pub fn new(account: Address, chain_id: u64) -> Self {
        Self {
            account,
            chain_id,
            cancel: CancelSignal::never(),
            notifications: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_notifications(mut self, sink: UnboundedSender<Notification>) -> Self {
        self.notifications = Some(sink);
        self
    }

    pub fn notify(&self, notification: Notification) {
        if let Some(sink) = &self.notifications {
            // A closed receiver only means nobody is listening anymore
            let _ = sink.send(notification);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollError<E> {
    TimedOut(Duration),
    Cancelled,
    Probe(E),
}

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Runs `probe` every `interval` until it yields a value, `max_duration`
/// elapses or `cancel` fires. The first probe runs after one interval, and a
/// probe still running at the deadline is dropped.
pub async fn poll_until<T, E, F, Fut>(
    interval: Duration,
    max_duration: Duration,
    cancel: &CancelSignal,
    mut probe: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    // an unrepresentable deadline means polling is effectively unbounded
    let deadline = started
        .checked_add(max_duration)
        .unwrap_or_else(|| started + FAR_FUTURE);
    let mut cancel = cancel.clone();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(PollError::TimedOut(started.elapsed()));
            }
            _ = tokio::time::sleep(interval) => {}
        }

        // a hung probe is bounded by the same deadline
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            outcome = probe() => outcome,
            _ = tokio::time::sleep_until(deadline) => {
                return Err(PollError::TimedOut(started.elapsed()));
            }
        };
        if let Some(value) = outcome.map_err(PollError::Probe)? {
            return Ok(value);
        }

        let elapsed = started.elapsed();
        if elapsed >= max_duration {
            return Err(PollError::TimedOut(elapsed));
        }
        debug!(?elapsed, "still waiting for confirmation");
    }
}

#[async_trait]
pub trait TransactionExecutor: Send + Sync {
    async fn send(&self, ctx: &ExecutionContext, tx: PendingTx) -> Result<Receipt, LifecycleError>;
}

/// Sends from externally owned accounts directly and waits on the safe
/// transaction service for contract (multisig) accounts.
pub struct WalletExecutor {
    provider: Arc<dyn ChainProvider>,
    safe_service: Arc<dyn SafeTransactionService>,
    poll_interval: Duration,
    max_poll_duration: Duration,
}

impl WalletExecutor {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        safe_service: Arc<dyn SafeTransactionService>,
        config: &LifecycleConfig,
    ) -> Self {
        Self {
            provider,
            safe_service,
            poll_interval: config.poll_interval(),
            max_poll_duration: config.max_poll_duration(),
        }
    }

    pub async fn is_safe_account(&self, account: Address) -> Result<bool, TransactionError> {
        let code = self
            .provider
            .get_code(account)
            .await
            .map_err(TransactionError::CodeLookup)?;
        Ok(!code.is_empty())
    }
}

#[async_trait]
impl TransactionExecutor for WalletExecutor {
    #[instrument(skip_all, fields(account = %ctx.account, tx = %tx.hash))]
    async fn send(&self, ctx: &ExecutionContext, tx: PendingTx) -> Result<Receipt, LifecycleError> {
        if !self.is_safe_account(ctx.account).await? {
            let mut cancel = ctx.cancel.clone();
            let receipt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransactionError::Cancelled.into()),
                receipt = tx.confirmed() => receipt.map_err(TransactionError::from)?,
            };
            info!("transaction confirmed");
            return Ok(receipt);
        }

        ctx.notify(Notification::SafeSubmissionRequested { tx_hash: tx.hash });
        let hash = tx.hash;
        let chain_id = ctx.chain_id;
        let safe_service = Arc::clone(&self.safe_service);

        let receipt = poll_until(self.poll_interval, self.max_poll_duration, &ctx.cancel, || {
            let safe_service = Arc::clone(&safe_service);
            async move { safe_service.transaction_details(chain_id, hash).await }
        })
        .await
        .map_err(|err| match err {
            PollError::TimedOut(elapsed) => LifecycleError::PollingTimeout { hash, elapsed },
            PollError::Cancelled => TransactionError::Cancelled.into(),
            PollError::Probe(source) => TransactionError::SafeService(source).into(),
        })?;

        info!("safe transaction executed");
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn polls_until_value() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, PollError<()>> = poll_until(
            Duration::from_secs(3),
            Duration::from_secs(60),
            &CancelSignal::never(),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(if n == 2 { Some(42) } else { None }) }
            },
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_max_duration() {
        let started = Instant::now();
        let result: Result<(), PollError<()>> = poll_until(
            Duration::from_secs(3),
            Duration::from_secs(10),
            &CancelSignal::never(),
            || async { Ok(None) },
        )
        .await;
        assert!(matches!(result, Err(PollError::TimedOut(elapsed)) if elapsed >= Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_probe_times_out_at_deadline() {
        let started = Instant::now();
        let result: Result<(), PollError<()>> = poll_until(
            Duration::from_secs(3),
            Duration::from_secs(10),
            &CancelSignal::never(),
            || futures::future::pending::<Result<Option<()>, ()>>(),
        )
        .await;
        assert_eq!(result, Err(PollError::TimedOut(Duration::from_secs(10))));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_polling() {
        let (handle, signal) = cancellation();
        let task = tokio::spawn(async move {
            poll_until::<(), (), _, _>(
                Duration::from_secs(3),
                Duration::from_secs(3600),
                &signal,
                || async { Ok(None) },
            )
            .await
        });
        tokio::time::sleep(Duration::from_secs(7)).await;
        handle.cancel();
        assert_eq!(task.await.unwrap(), Err(PollError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_error_aborts() {
        let result: Result<(), PollError<&str>> = poll_until(
            Duration::from_secs(3),
            Duration::from_secs(60),
            &CancelSignal::never(),
            || async { Err("safe api down") },
        )
        .await;
        assert_eq!(result, Err(PollError::Probe("safe api down")));
    }

    #[test]
    fn notify_without_sink_is_noop() {
        let ctx = ExecutionContext::new(Address::ZERO, 1);
        ctx.notify(Notification::Terminated { service_id: 1 });
        assert!(!ctx.cancel.is_cancelled());
    }
}
