//! Generic fence-wait insertion.
//!
//! [`WaitForFence`] inserts a `WaitFence` command before the first command matching its start
//! predicate and a stop fence at the end of the stream. Each wait is preceded by registering a
//! completion in the shared [`FenceRegistry`], so by the time the replay device can reach the
//! wait, the orchestrator is ready to hear about it.

use std::fmt;
use std::sync::Arc;

use capreplay_sync::{FenceId, FenceReady, FenceRegistry};

use crate::cmd::{Cmd, CmdId, CommandBuilder};
use crate::error::{Result, TransformError};
use crate::transform::Transform;
use crate::writer::Writer;

/// Completion invoked on the notification thread when an inserted fence is reached.
pub type FenceCallback = Arc<dyn Fn(FenceReady) + Send + Sync>;

/// Decides which commands get a start fence inserted before them.
pub type WaitPredicate = fn(CmdId, &Cmd) -> bool;

/// Default start predicate: only the first command of the stream.
pub fn is_first_command(id: CmdId, _cmd: &Cmd) -> bool {
    id == CmdId(0)
}

/// Derive the fence id for a wait keyed by command `id`.
pub fn fence_for_cmd(id: CmdId) -> Result<FenceId> {
    let raw = u32::try_from(id.0).map_err(|_| TransformError::FenceIdOverflow(id))?;
    let fence = FenceId(raw);
    if fence.is_stop() {
        return Err(TransformError::FenceIdReserved(id));
    }
    Ok(fence)
}

pub struct WaitForFence {
    registry: Arc<FenceRegistry>,
    on_start: FenceCallback,
    on_stop: FenceCallback,
    predicate: WaitPredicate,
    stop_inserted: bool,
}

impl fmt::Debug for WaitForFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitForFence")
            .field("registry", &self.registry)
            .field("stop_inserted", &self.stop_inserted)
            .finish_non_exhaustive()
    }
}

impl WaitForFence {
    pub fn new(
        registry: Arc<FenceRegistry>,
        on_start: impl Fn(FenceReady) + Send + Sync + 'static,
        on_stop: impl Fn(FenceReady) + Send + Sync + 'static,
    ) -> Self {
        Self {
            registry,
            on_start: Arc::new(on_start),
            on_stop: Arc::new(on_stop),
            predicate: is_first_command,
            stop_inserted: false,
        }
    }

    pub fn with_predicate(mut self, predicate: WaitPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn registry(&self) -> &Arc<FenceRegistry> {
        &self.registry
    }

    pub fn matches(&self, id: CmdId, cmd: &Cmd) -> bool {
        (self.predicate)(id, cmd)
    }

    pub fn stop_inserted(&self) -> bool {
        self.stop_inserted
    }

    /// Register the start completion for `id`'s fence and emit the wait for it.
    pub fn insert_start(&mut self, id: CmdId, out: &mut dyn Writer) -> Result<()> {
        let fence = fence_for_cmd(id)?;
        let on_start = Arc::clone(&self.on_start);
        self.insert_wait(id, fence, on_start, out)
    }

    /// Register the stop completion and emit the wait for the stop fence. Only the first call
    /// inserts anything.
    pub fn insert_stop(&mut self, out: &mut dyn Writer) -> Result<()> {
        if self.stop_inserted {
            return Ok(());
        }
        let on_stop = Arc::clone(&self.on_stop);
        self.insert_wait(CmdId::NONE, FenceId::STOP, on_stop, out)?;
        self.stop_inserted = true;
        Ok(())
    }

    fn insert_wait(
        &self,
        id: CmdId,
        fence: FenceId,
        callback: FenceCallback,
        out: &mut dyn Writer,
    ) -> Result<()> {
        self.registry.register(fence, move |ready| callback(ready))?;
        if let Err(err) = out.mutate_and_write(id, CommandBuilder::new(0).wait_fence(fence)) {
            // The device will never see this wait.
            self.registry.cancel(fence);
            return Err(err);
        }
        tracing::debug!(%fence, %id, "inserted fence wait");
        Ok(())
    }
}

impl Transform for WaitForFence {
    fn name(&self) -> &'static str {
        "WaitForFence"
    }

    fn transform(&mut self, id: CmdId, cmd: Cmd, out: &mut dyn Writer) -> Result<()> {
        if self.matches(id, &cmd) {
            self.insert_start(id, out)?;
        }
        out.mutate_and_write(id, cmd)
    }

    fn flush(&mut self, out: &mut dyn Writer) -> Result<()> {
        self.insert_stop(out)
    }
}
