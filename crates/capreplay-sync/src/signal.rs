use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

type FireAction = Box<dyn FnOnce() + Send>;

enum State {
    Pending(Option<FireAction>),
    /// The transition has been claimed and the fire action is running.
    Firing,
    Fired,
}

struct Inner {
    name: &'static str,
    state: Mutex<State>,
    cond: Condvar,
}

/// A single-writer, multi-reader boolean event.
///
/// A signal starts unfired and transitions to fired exactly once. The optional fire action
/// runs on the thread that wins the transition, before any waiter is released. Firing an
/// already-fired signal is a no-op.
///
/// Clones share the same underlying event.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<Inner>,
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.inner.name)
            .field("fired", &self.fired())
            .finish()
    }
}

impl Signal {
    pub fn new(name: &'static str) -> Self {
        Self::from_state(name, State::Pending(None))
    }

    /// Create a signal that runs `action` once, at the unfired -> fired transition.
    pub fn with_action(name: &'static str, action: impl FnOnce() + Send + 'static) -> Self {
        Self::from_state(name, State::Pending(Some(Box::new(action))))
    }

    fn from_state(name: &'static str, state: State) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(state),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Returns `true` once the signal has been fired, including while its fire action is
    /// still running.
    pub fn fired(&self) -> bool {
        !matches!(*self.lock(), State::Pending(_))
    }

    /// Fire the signal.
    ///
    /// Returns `true` if this call performed the transition, `false` if the signal had already
    /// been fired.
    pub fn fire(&self) -> bool {
        let action = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, State::Firing) {
                State::Pending(action) => action,
                other => {
                    *state = other;
                    return false;
                }
            }
        };

        tracing::trace!(signal = self.inner.name, "signal fired");
        if let Some(action) = action {
            action();
        }

        *self.lock() = State::Fired;
        self.inner.cond.notify_all();
        true
    }

    /// Block the calling thread until the signal has fired and its action has completed.
    pub fn wait(&self) {
        let mut state = self.lock();
        while !matches!(*state, State::Fired) {
            state = self
                .inner
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`Signal::wait`], but gives up after `timeout`.
    ///
    /// Returns `true` if the signal fired within the timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !matches!(*state, State::Fired) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn fire_is_idempotent_and_runs_action_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let signal = Signal::with_action("ready", move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!signal.fired());
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.fired());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waiter_blocked_before_fire_is_released() {
        let signal = Signal::new("done");
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait())
        };

        // Give the waiter a chance to block first; correctness does not depend on it.
        thread::sleep(Duration::from_millis(20));
        signal.fire();
        waiter.join().unwrap();
        assert!(signal.fired());
    }

    #[test]
    fn wait_after_fire_returns_immediately() {
        let signal = Signal::new("stop");
        signal.fire();
        signal.wait();
        assert!(signal.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn wait_timeout_expires_on_unfired_signal() {
        let signal = Signal::new("ready");
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn action_may_inspect_its_own_signal() {
        let slot: Arc<Mutex<Option<Signal>>> = Arc::new(Mutex::new(None));
        let seen = Arc::new(AtomicU32::new(0));
        let signal = {
            let slot = Arc::clone(&slot);
            let seen = Arc::clone(&seen);
            Signal::with_action("ready", move || {
                let me = slot.lock().unwrap().clone().unwrap();
                // Re-entrant fire from inside the action is a no-op.
                assert!(!me.fire());
                if me.fired() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        *slot.lock().unwrap() = Some(signal.clone());

        assert!(signal.fire());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waiters_observe_action_side_effects() {
        let value = Arc::new(AtomicU32::new(0));
        let signal = {
            let value = Arc::clone(&value);
            Signal::with_action("ready", move || {
                thread::sleep(Duration::from_millis(10));
                value.store(7, Ordering::SeqCst);
            })
        };

        let waiter = {
            let signal = signal.clone();
            let value = Arc::clone(&value);
            thread::spawn(move || {
                signal.wait();
                value.load(Ordering::SeqCst)
            })
        };
        signal.fire();
        assert_eq!(waiter.join().unwrap(), 7);
    }
}
