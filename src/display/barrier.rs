use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Failed,
}

/// One-shot gate between display startup and the rest of bootstrap. The
/// first release wins; waiters block until it happens.
#[derive(Debug, Default)]
pub struct ReadinessBarrier {
    state: Mutex<Option<Readiness>>,
    released: Condvar,
}

impl ReadinessBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Readiness>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false if the barrier had already been released.
    pub fn release(&self, readiness: Readiness) -> bool {
        let mut state = self.lock();
        if state.is_some() {
            return false;
        }
        *state = Some(readiness);
        self.released.notify_all();
        true
    }

    pub fn wait(&self) -> Readiness {
        let mut state = self.lock();
        loop {
            if let Some(readiness) = *state {
                return readiness;
            }
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    #[cfg(test)]
    pub fn peek(&self) -> Option<Readiness> {
        *self.lock()
    }
}
