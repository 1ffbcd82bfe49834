//! Command stream representation.
//!
//! [`CmdKind`] is a closed set: the kinds this crate inspects or injects get their own variant,
//! everything else captured from the application travels as [`CmdKind::Opaque`] and is passed
//! through untouched.

use std::fmt;

use capreplay_sync::FenceId;

use crate::memory::{Encode, HostMemory, MemoryError, MemoryRange, Pointer};
use crate::state::ResourceId;

/// Stable ordinal of a command in the captured stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CmdId(pub u64);

impl CmdId {
    /// Marks commands injected by a transform, which have no capture ordinal.
    pub const NONE: Self = Self(u64::MAX);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for CmdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("<injected>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VkResult {
    Success,
    ErrorInitializationFailed,
    ErrorLayerNotPresent,
    ErrorExtensionNotPresent,
}

/// A read or write of application memory recorded at capture time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Observation {
    pub range: MemoryRange,
    pub id: ResourceId,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Observations {
    /// Applied to memory before the command's arguments are read.
    pub reads: Vec<Observation>,
    /// Applied to memory after the command has mutated state.
    pub writes: Vec<Observation>,
}

/// Argument block of an instance-creation command as laid out in host memory.
///
/// Layout (little-endian, 40 bytes):
/// `flags: u32, enabled_layer_count: u32, pp_enabled_layer_names: u64,
///  enabled_extension_count: u32, _pad: u32, pp_enabled_extension_names: u64,
///  p_application_info: u64`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstanceCreateInfo {
    pub flags: u32,
    pub enabled_layer_count: u32,
    pub pp_enabled_layer_names: Pointer,
    pub enabled_extension_count: u32,
    pub pp_enabled_extension_names: Pointer,
    pub p_application_info: Pointer,
}

impl InstanceCreateInfo {
    pub const SIZE_BYTES: u64 = 40;

    pub fn read(mem: &HostMemory, ptr: Pointer) -> Result<Self, MemoryError> {
        let bytes = mem.read(ptr.0, Self::SIZE_BYTES)?;
        let u32_at = |off: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[off..off + 4]);
            u32::from_le_bytes(buf)
        };
        let u64_at = |off: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[off..off + 8]);
            u64::from_le_bytes(buf)
        };
        Ok(Self {
            flags: u32_at(0),
            enabled_layer_count: u32_at(4),
            pp_enabled_layer_names: Pointer(u64_at(8)),
            enabled_extension_count: u32_at(16),
            pp_enabled_extension_names: Pointer(u64_at(24)),
            p_application_info: Pointer(u64_at(32)),
        })
    }
}

impl Encode for InstanceCreateInfo {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.enabled_layer_count.to_le_bytes());
        out.extend_from_slice(&self.pp_enabled_layer_names.0.to_le_bytes());
        out.extend_from_slice(&self.enabled_extension_count.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.pp_enabled_extension_names.0.to_le_bytes());
        out.extend_from_slice(&self.p_application_info.0.to_le_bytes());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreateInstance {
    pub create_info: Pointer,
    pub allocator: Pointer,
    pub instance: Pointer,
    pub result: VkResult,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CmdKind {
    CreateInstance(CreateInstance),
    CreateDevice {
        device: DeviceHandle,
    },
    DestroyDevice {
        device: DeviceHandle,
    },
    /// Quiescence barrier: wait until all work submitted to `device` has finished.
    DeviceWaitIdle {
        device: DeviceHandle,
        result: VkResult,
    },
    /// Stall replay until the orchestrator acknowledges `fence`.
    WaitFence {
        fence: FenceId,
    },
    Opaque {
        name: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cmd {
    /// Capture thread the command was issued on.
    pub thread: u64,
    pub kind: CmdKind,
    pub observations: Observations,
}

impl Cmd {
    pub fn new(thread: u64, kind: CmdKind) -> Self {
        Self {
            thread,
            kind,
            observations: Observations::default(),
        }
    }

    pub fn name(&self) -> &str {
        match &self.kind {
            CmdKind::CreateInstance(_) => "vkCreateInstance",
            CmdKind::CreateDevice { .. } => "vkCreateDevice",
            CmdKind::DestroyDevice { .. } => "vkDestroyDevice",
            CmdKind::DeviceWaitIdle { .. } => "vkDeviceWaitIdle",
            CmdKind::WaitFence { .. } => "WaitFence",
            CmdKind::Opaque { name } => name,
        }
    }

    pub fn add_read(&mut self, obs: Observation) -> &mut Self {
        self.observations.reads.push(obs);
        self
    }

    pub fn add_write(&mut self, obs: Observation) -> &mut Self {
        self.observations.writes.push(obs);
        self
    }
}

/// Builds commands tagged with a capture thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommandBuilder {
    pub thread: u64,
}

impl CommandBuilder {
    pub fn new(thread: u64) -> Self {
        Self { thread }
    }

    pub fn create_instance(
        &self,
        create_info: Pointer,
        allocator: Pointer,
        instance: Pointer,
        result: VkResult,
    ) -> Cmd {
        Cmd::new(
            self.thread,
            CmdKind::CreateInstance(CreateInstance {
                create_info,
                allocator,
                instance,
                result,
            }),
        )
    }

    pub fn create_device(&self, device: DeviceHandle) -> Cmd {
        Cmd::new(self.thread, CmdKind::CreateDevice { device })
    }

    pub fn destroy_device(&self, device: DeviceHandle) -> Cmd {
        Cmd::new(self.thread, CmdKind::DestroyDevice { device })
    }

    pub fn device_wait_idle(&self, device: DeviceHandle, result: VkResult) -> Cmd {
        Cmd::new(self.thread, CmdKind::DeviceWaitIdle { device, result })
    }

    pub fn wait_fence(&self, fence: FenceId) -> Cmd {
        Cmd::new(self.thread, CmdKind::WaitFence { fence })
    }

    pub fn opaque(&self, name: impl Into<String>) -> Cmd {
        Cmd::new(self.thread, CmdKind::Opaque { name: name.into() })
    }
}
