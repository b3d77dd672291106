//! Poison-tolerant lock helpers.
//!
//! A panicking client callback must not wedge the transport, so every lock in
//! the crate recovers the inner guard instead of propagating poison.

use std::sync::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn read<T: ?Sized>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write<T: ?Sized>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One-shot rendezvous carrying a completion code, re-armed with
/// [`Completion::reinit`] before every command.
///
/// `complete_all` is sticky: every later wait returns immediately until the
/// next `reinit`. Fatal error handling uses it to release waiters.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    state: Mutex<CompletionState>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct CompletionState {
    done: bool,
    sticky: bool,
    code: Option<u8>,
}

impl Completion {
    pub(crate) fn reinit(&self) {
        let mut st = lock(&self.state);
        *st = CompletionState::default();
    }

    pub(crate) fn complete(&self, code: u8) {
        let mut st = lock(&self.state);
        st.done = true;
        st.code = Some(code);
        self.cv.notify_one();
    }

    pub(crate) fn complete_all(&self, code: u8) {
        let mut st = lock(&self.state);
        st.done = true;
        st.sticky = true;
        st.code = Some(code);
        self.cv.notify_all();
    }

    /// Returns the completion code, or `None` on timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<u8> {
        let deadline = Instant::now() + timeout;
        let mut st = lock(&self.state);
        loop {
            if st.done {
                let code = st.code;
                if !st.sticky {
                    st.done = false;
                }
                return code;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            st = self
                .cv
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }
}
