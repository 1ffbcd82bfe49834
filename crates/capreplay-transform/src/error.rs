use capreplay_sync::FenceError;
use thiserror::Error;

use crate::cmd::CmdId;
use crate::memory::MemoryError;
use crate::state::StateError;

pub type Result<T> = std::result::Result<T, TransformError>;

/// Failure while building the replay stream.
///
/// Any of these aborts replay construction; transforms never emit a partially rewritten
/// command.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Fence(#[from] FenceError),

    #[error("command {0} cannot be used as a fence id (ordinal exceeds u32)")]
    FenceIdOverflow(CmdId),

    #[error("command {0} maps onto the reserved stop fence")]
    FenceIdReserved(CmdId),

    #[error("invalid command arguments: {0}")]
    InvalidArguments(&'static str),
}
