use crate::cmd::{Cmd, CmdId, Observation};
use crate::error::TransformError;
use crate::memory::{Encode, MemoryError, MemoryRange, Pointer};
use crate::state::{ReplayState, ResourceId};
use crate::writer::Writer;

/// Handle to a scratch block holding patched argument data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocResult {
    pub range: MemoryRange,
    pub id: ResourceId,
}

impl AllocResult {
    pub fn ptr(&self) -> Pointer {
        Pointer(self.range.base)
    }

    /// Read observation that makes the block's contents visible to a command.
    pub fn data(&self) -> Observation {
        Observation {
            range: self.range,
            id: self.id,
        }
    }
}

/// Scratch allocations made while rewriting a single command.
///
/// The scope borrows the writer for the duration of the rewrite. Every block allocated through
/// it is released when the scope is dropped, on success and on every early return, so callers
/// never pair allocations with frees themselves.
pub struct ScratchScope<'w> {
    out: &'w mut dyn Writer,
    allocated: Vec<AllocResult>,
}

impl std::fmt::Debug for ScratchScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchScope")
            .field("allocated", &self.allocated)
            .finish_non_exhaustive()
    }
}

impl<'w> ScratchScope<'w> {
    pub fn new(out: &'w mut dyn Writer) -> Self {
        Self {
            out,
            allocated: Vec::new(),
        }
    }

    pub fn state(&self) -> &ReplayState {
        self.out.state()
    }

    pub fn state_mut(&mut self) -> &mut ReplayState {
        self.out.state_mut()
    }

    /// Encode `value` into a new scratch block and track it for release.
    pub fn alloc<T: Encode + ?Sized>(&mut self, value: &T) -> Result<AllocResult, MemoryError> {
        let mut bytes = Vec::new();
        value.encode(&mut bytes);
        let res = self.out.state_mut().alloc_data(bytes)?;
        self.allocated.push(res);
        Ok(res)
    }

    /// Write `cmd` to the underlying writer while the scratch blocks are still live.
    pub fn emit(&mut self, id: CmdId, cmd: Cmd) -> Result<(), TransformError> {
        self.out.mutate_and_write(id, cmd)
    }

    pub fn allocations(&self) -> &[AllocResult] {
        &self.allocated
    }

    /// Free every tracked block. Calling this again (or on an empty scope) does nothing.
    pub fn release_all(&mut self) {
        for alloc in self.allocated.drain(..) {
            if let Err(err) = self.out.state_mut().free(alloc) {
                tracing::warn!(ptr = %alloc.ptr(), %err, "failed to release scratch block");
            }
        }
    }
}

impl Drop for ScratchScope<'_> {
    fn drop(&mut self) {
        self.release_all();
    }
}
