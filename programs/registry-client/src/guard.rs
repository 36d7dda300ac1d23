use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::debug;

use crate::{lifecycle::Action, state::ServiceId};

type Key = (ServiceId, Action);

/// In-flight actions. A held key disables the action until its guard drops.
#[derive(Clone, Debug, Default)]
pub struct PendingActions {
    inner: Arc<Mutex<HashSet<Key>>>,
}

impl PendingActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when the same action is already pending for the service.
    pub fn try_acquire(&self, service_id: ServiceId, action: Action) -> Option<PendingGuard> {
        if !self.lock().insert((service_id, action)) {
            debug!(service_id, ?action, "action already pending");
            return None;
        }
        Some(PendingGuard {
            owner: self.clone(),
            key: (service_id, action),
        })
    }

    pub fn is_pending(&self, service_id: ServiceId, action: Action) -> bool {
        self.lock().contains(&(service_id, action))
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Key>> {
        // The set stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
pub struct PendingGuard {
    owner: PendingActions,
    key: Key,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.owner.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let pending = PendingActions::new();
        let guard = pending.try_acquire(1, Action::Terminate).unwrap();
        assert!(pending.try_acquire(1, Action::Terminate).is_none());
        assert!(pending.is_pending(1, Action::Terminate));

        // other keys are independent
        assert!(pending.try_acquire(2, Action::Terminate).is_some());
        assert!(pending.try_acquire(1, Action::Unbond).is_some());

        drop(guard);
        assert!(!pending.is_pending(1, Action::Terminate));
        assert!(pending.try_acquire(1, Action::Terminate).is_some());
    }

    #[test]
    fn released_on_panic() {
        let pending = PendingActions::new();
        let cloned = pending.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = cloned.try_acquire(7, Action::Deploy).unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(!pending.is_pending(7, Action::Deploy));
    }
}
