//! Command-stream rewriting for replay.
//!
//! A captured command stream is fed, command by command, through a [`TransformChain`]. Each
//! [`Transform`] may pass a command through, rewrite it (allocating scratch memory through a
//! [`ScratchScope`]), inject new commands, or drop it. Whatever reaches the final [`Writer`] is
//! applied to the [`ReplayState`] and becomes the replayed stream.
//!
//! Two families of transforms live here:
//! - [`ProfilingLayers`] forces a profiling layer on for every created instance.
//! - [`WaitForFence`] and [`WaitForTracing`] insert fence waits that let the orchestrator start
//!   and stop an out-of-band [`TracingSession`] at precise points of the replay.

#![deny(unsafe_code)]

mod alloc;
mod cmd;
mod config;
mod device_idle;
mod error;
mod memory;
mod profiling_layers;
mod state;
mod trace_session;
mod transform;
mod wait_for_fence;
mod wait_for_tracing;
mod writer;

pub use alloc::{AllocResult, ScratchScope};
pub use cmd::{
    Cmd, CmdId, CmdKind, CommandBuilder, CreateInstance, DeviceHandle, InstanceCreateInfo,
    Observation, Observations, VkResult,
};
pub use config::{ConfigError, ReplayConfig, TraceOptions};
pub use device_idle::emit_device_wait_idle;
pub use error::{Result, TransformError};
pub use memory::{
    Encode, HostMemory, MemoryError, MemoryRange, Pointer, DEFAULT_SCRATCH_LIMIT, SCRATCH_BASE,
};
pub use profiling_layers::{ProfilingLayers, RENDER_STAGES_LAYER};
pub use state::{InstanceRecord, ReplayState, ResourceId, StateError};
pub use trace_session::{BackendError, DoneCallback, TraceState, TracingBackend, TracingSession};
pub use transform::{Transform, TransformChain};
pub use wait_for_fence::{
    fence_for_cmd, is_first_command, FenceCallback, WaitForFence, WaitPredicate,
};
pub use wait_for_tracing::WaitForTracing;
pub use writer::{CommandRecorder, Writer};
