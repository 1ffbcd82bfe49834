//! Out-of-band tracing session started and stopped by fence notifications.
//!
//! A session moves through `Idle -> AwaitingReady -> Tracing -> AwaitingDone -> Idle`:
//! - the start fence spawns the backend and blocks the notification thread until the backend
//!   reports *ready*, so the replay device only resumes once tracing is capturing;
//! - the stop fence fires *stop*, which asks the backend to wind down;
//! - the backend completes *done* once everything is written.
//!
//! All three signals are one-shot, so a session runs at most once.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use capreplay_sync::{FenceReady, Signal};

use crate::config::TraceOptions;

/// Invoked by the backend once the trace has fully terminated and its resources are released.
pub type DoneCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("tracing backend failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The tracing service on the replay device.
pub trait TracingBackend: Send + Sync {
    /// Run one tracing session to completion.
    ///
    /// Implementations fire `ready` once data is being captured, keep tracing until `stop`
    /// fires, and call `done` after all trace data has been written. The call blocks for the
    /// lifetime of the session.
    fn start(
        &self,
        options: &TraceOptions,
        ready: &Signal,
        stop: &Signal,
        done: DoneCallback,
    ) -> Result<(), BackendError>;

    /// Ask a running session to wind down.
    fn stop(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceState {
    Idle,
    AwaitingReady,
    Tracing,
    AwaitingDone,
}

pub struct TracingSession {
    backend: Arc<dyn TracingBackend>,
    options: TraceOptions,
    ready: Signal,
    stop: Signal,
    done: Signal,
    state: Mutex<TraceState>,
    backend_thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for TracingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingSession")
            .field("options", &self.options)
            .field("state", &self.state())
            .field("ready", &self.ready)
            .field("stop", &self.stop)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl TracingSession {
    pub fn new(backend: Arc<dyn TracingBackend>, options: TraceOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let on_ready = weak.clone();
            let on_stop = weak.clone();
            let on_done = weak.clone();
            Self {
                backend,
                options,
                ready: Signal::with_action("ready", move || {
                    if let Some(session) = on_ready.upgrade() {
                        session.on_ready();
                    }
                }),
                stop: Signal::with_action("stop", move || {
                    if let Some(session) = on_stop.upgrade() {
                        session.on_stop_requested();
                    }
                }),
                done: Signal::with_action("done", move || {
                    if let Some(session) = on_done.upgrade() {
                        session.on_done();
                    }
                }),
                state: Mutex::new(TraceState::Idle),
                backend_thread: Mutex::new(None),
            }
        })
    }

    pub fn state(&self) -> TraceState {
        *self.lock_state()
    }

    pub fn options(&self) -> &TraceOptions {
        &self.options
    }

    pub fn ready_signal(&self) -> &Signal {
        &self.ready
    }

    pub fn stop_signal(&self) -> &Signal {
        &self.stop
    }

    pub fn done_signal(&self) -> &Signal {
        &self.done
    }

    /// Completion for the start fence. Runs on the notification thread and blocks it until the
    /// backend is ready.
    pub fn on_start_fence(self: &Arc<Self>, ready: FenceReady) {
        {
            let mut state = self.lock_state();
            if self.done.fired() || self.stop.fired() {
                tracing::warn!(fence = %ready.fence, "stop already requested; not starting tracing");
                return;
            }
            if *state != TraceState::Idle {
                tracing::warn!(fence = %ready.fence, state = ?*state, "tracing already started");
                return;
            }
            *state = TraceState::AwaitingReady;
        }

        tracing::info!(fence = %ready.fence, "starting tracing backend");
        let session = Arc::clone(self);
        let spawned = {
            // Held across the spawn so the handle is stored before `wait_done` can reap it,
            // even if the backend finishes immediately.
            let mut backend_thread = self.lock_thread();
            thread::Builder::new()
                .name("capreplay-trace-backend".into())
                .spawn(move || session.run_backend())
                .map(|handle| *backend_thread = Some(handle))
        };
        if let Err(err) = spawned {
            tracing::error!(%err, "failed to spawn tracing backend thread");
            self.ready.fire();
            self.done.fire();
        }

        self.ready.wait();
        tracing::debug!(fence = %ready.fence, "tracing ready; releasing replay");
    }

    /// Completion for the stop fence.
    pub fn on_stop_fence(&self, ready: FenceReady) {
        if self.done.fired() {
            tracing::debug!(fence = %ready.fence, "tracing already finished");
            return;
        }
        if !self.stop.fired() {
            self.stop.fire();
        }
    }

    /// Request the end of tracing outside the fence path. Idempotent.
    pub fn request_stop(&self) -> bool {
        self.stop.fire()
    }

    /// Block until tracing has fully terminated, then reap the backend thread.
    pub fn wait_done(&self) {
        self.done.wait();
        self.join_backend();
    }

    /// Like [`TracingSession::wait_done`], but gives up after `timeout`.
    pub fn wait_done_timeout(&self, timeout: Duration) -> bool {
        if !self.done.wait_timeout(timeout) {
            return false;
        }
        self.join_backend();
        true
    }

    fn run_backend(self: Arc<Self>) {
        let done = self.done.clone();
        let result = self.backend.start(
            &self.options,
            &self.ready,
            &self.stop,
            Box::new(move || {
                done.fire();
            }),
        );
        if let Err(err) = result {
            tracing::error!(%err, "tracing backend failed");
        }
        if !self.ready.fired() {
            tracing::warn!("tracing backend returned without signalling ready");
            self.ready.fire();
        }
        if !self.done.fired() {
            self.done.fire();
        }
    }

    fn join_backend(&self) {
        let handle = self.lock_thread().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("tracing backend thread panicked");
            }
        }
    }

    fn on_ready(&self) {
        let mut state = self.lock_state();
        if *state == TraceState::AwaitingReady {
            *state = TraceState::Tracing;
        }
        tracing::info!("tracing is capturing");
    }

    fn on_stop_requested(&self) {
        let started = {
            let mut state = self.lock_state();
            match *state {
                TraceState::Idle => false,
                TraceState::AwaitingReady | TraceState::Tracing => {
                    *state = TraceState::AwaitingDone;
                    true
                }
                TraceState::AwaitingDone => return,
            }
        };

        if started {
            tracing::info!("stopping tracing backend");
            self.backend.stop();
        } else {
            tracing::info!("stop requested before tracing started");
            self.done.fire();
        }
    }

    fn on_done(&self) {
        *self.lock_state() = TraceState::Idle;
        tracing::info!("tracing done");
    }

    fn lock_state(&self) -> MutexGuard<'_, TraceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_thread(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.backend_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capreplay_sync::FenceId;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend that becomes ready immediately and finishes when stopped.
    #[derive(Default)]
    struct ImmediateBackend {
        starts: AtomicU32,
        stops: AtomicU32,
    }

    impl TracingBackend for ImmediateBackend {
        fn start(
            &self,
            _options: &TraceOptions,
            ready: &Signal,
            stop: &Signal,
            done: DoneCallback,
        ) -> Result<(), BackendError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            ready.fire();
            stop.wait();
            done();
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Backend that fails before it ever becomes ready.
    struct BrokenBackend;

    impl TracingBackend for BrokenBackend {
        fn start(
            &self,
            _options: &TraceOptions,
            _ready: &Signal,
            _stop: &Signal,
            _done: DoneCallback,
        ) -> Result<(), BackendError> {
            Err(BackendError::Failed("no tracing service".into()))
        }

        fn stop(&self) {}
    }

    const START: FenceReady = FenceReady { fence: FenceId(0) };
    const STOP: FenceReady = FenceReady { fence: FenceId::STOP };

    #[test]
    fn full_session_walks_every_state() {
        let backend = Arc::new(ImmediateBackend::default());
        let session = TracingSession::new(backend.clone(), TraceOptions::default());
        assert_eq!(session.state(), TraceState::Idle);

        session.on_start_fence(START);
        assert!(session.ready_signal().fired());
        assert_eq!(session.state(), TraceState::Tracing);

        session.on_stop_fence(STOP);
        session.wait_done();
        assert_eq!(session.state(), TraceState::Idle);
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_start_fence_does_not_restart_backend() {
        let backend = Arc::new(ImmediateBackend::default());
        let session = TracingSession::new(backend.clone(), TraceOptions::default());

        session.on_start_fence(START);
        session.on_start_fence(START);
        session.request_stop();
        session.wait_done();
        session.on_start_fence(START);

        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_before_start_completes_without_backend() {
        let backend = Arc::new(ImmediateBackend::default());
        let session = TracingSession::new(backend.clone(), TraceOptions::default());

        session.on_stop_fence(STOP);
        assert!(session.wait_done_timeout(Duration::from_secs(5)));

        // The start fence still arrives later; it must neither start nor block.
        session.on_start_fence(START);
        assert_eq!(backend.starts.load(Ordering::SeqCst), 0);
        assert_eq!(backend.stops.load(Ordering::SeqCst), 0);
        assert!(!session.ready_signal().fired());
    }

    #[test]
    fn repeated_stop_requests_stop_backend_once() {
        let backend = Arc::new(ImmediateBackend::default());
        let session = TracingSession::new(backend.clone(), TraceOptions::default());

        session.on_start_fence(START);
        assert!(session.request_stop());
        assert!(!session.request_stop());
        session.on_stop_fence(STOP);
        session.wait_done();

        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backend_thread_is_reaped_when_backend_finishes_early() {
        for _ in 0..16 {
            let session = TracingSession::new(Arc::new(BrokenBackend), TraceOptions::default());
            session.on_start_fence(START);
            session.wait_done();
            assert!(session.lock_thread().is_none());
        }
    }

    #[test]
    fn failing_backend_still_releases_replay() {
        let session = TracingSession::new(Arc::new(BrokenBackend), TraceOptions::default());

        session.on_start_fence(START);
        assert!(session.ready_signal().fired());
        assert!(session.wait_done_timeout(Duration::from_secs(5)));

        // Done already fired, so the stop fence is a no-op.
        session.on_stop_fence(STOP);
        assert!(!session.stop_signal().fired());
        assert_eq!(session.state(), TraceState::Idle);
    }
}
