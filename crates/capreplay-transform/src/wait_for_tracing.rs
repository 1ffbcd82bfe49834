//! Fence-synchronized tracing around the replayed stream.
//!
//! Decorates [`WaitForFence`]: every inserted fence wait is preceded by a device-idle barrier, so
//! no GPU work straddles the moment tracing starts or stops. The start fence completion drives
//! [`TracingSession::on_start_fence`] and the stop fence drives
//! [`TracingSession::on_stop_fence`].

use std::fmt;
use std::sync::Arc;

use capreplay_sync::FenceRegistry;

use crate::cmd::{Cmd, CmdId};
use crate::device_idle::emit_device_wait_idle;
use crate::error::Result;
use crate::trace_session::TracingSession;
use crate::transform::Transform;
use crate::wait_for_fence::{fence_for_cmd, WaitForFence, WaitPredicate};
use crate::writer::Writer;

pub struct WaitForTracing {
    fences: WaitForFence,
    session: Arc<TracingSession>,
}

impl fmt::Debug for WaitForTracing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitForTracing")
            .field("fences", &self.fences)
            .field("session", &self.session)
            .finish()
    }
}

impl WaitForTracing {
    pub fn new(registry: Arc<FenceRegistry>, session: Arc<TracingSession>) -> Self {
        let on_start = Arc::clone(&session);
        let on_stop = Arc::clone(&session);
        let fences = WaitForFence::new(
            registry,
            move |ready| on_start.on_start_fence(ready),
            move |ready| on_stop.on_stop_fence(ready),
        );
        Self { fences, session }
    }

    pub fn with_predicate(mut self, predicate: WaitPredicate) -> Self {
        self.fences = self.fences.with_predicate(predicate);
        self
    }

    pub fn session(&self) -> &Arc<TracingSession> {
        &self.session
    }

    pub fn stop_inserted(&self) -> bool {
        self.fences.stop_inserted()
    }

    /// Drain every device and insert the stop fence. Safe to call more than once; only the
    /// first call emits anything, whether it comes from here or from `flush`.
    pub fn terminate(&mut self, out: &mut dyn Writer) -> Result<()> {
        if self.fences.stop_inserted() {
            return Ok(());
        }
        emit_device_wait_idle(out)?;
        self.fences.insert_stop(out)
    }
}

impl Transform for WaitForTracing {
    fn name(&self) -> &'static str {
        "WaitForTracing"
    }

    fn transform(&mut self, id: CmdId, cmd: Cmd, out: &mut dyn Writer) -> Result<()> {
        if self.fences.matches(id, &cmd) {
            // Reject unusable ids before anything reaches the output.
            fence_for_cmd(id)?;
            let _span = tracing::debug_span!("trace_start_barrier", %id).entered();
            emit_device_wait_idle(out)?;
        }
        self.fences.transform(id, cmd, out)
    }

    fn flush(&mut self, out: &mut dyn Writer) -> Result<()> {
        self.terminate(out)
    }
}
