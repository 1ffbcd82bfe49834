//! Minimal replay state: host memory, captured resource data, and the objects transforms need
//! to reason about (devices, created instances).
//!
//! This is not a general API state engine. It understands only the command kinds in
//! [`CmdKind`]; opaque commands just have their observations applied.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::alloc::AllocResult;
use crate::cmd::{Cmd, CmdId, CmdKind, DeviceHandle, InstanceCreateInfo, Observation, Observations};
use crate::memory::{HostMemory, MemoryError, Pointer};

/// Content identifier of a captured (or transform-generated) blob of memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("unknown resource {0:?}")]
    UnknownResource(ResourceId),
    #[error("resource {id:?} holds {actual} bytes, observation expects {expected}")]
    ResourceSizeMismatch {
        id: ResourceId,
        expected: u64,
        actual: u64,
    },
    #[error("unknown device {0:?}")]
    UnknownDevice(DeviceHandle),
    #[error("device {0:?} already exists")]
    DuplicateDevice(DeviceHandle),
}

/// Instance as seen by the state engine when its creation command was applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: CmdId,
    pub layers: Vec<String>,
    pub extensions: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ReplayState {
    memory: HostMemory,
    resources: HashMap<ResourceId, Arc<[u8]>>,
    next_resource: u64,
    devices: BTreeSet<DeviceHandle>,
    instances: Vec<InstanceRecord>,
}

impl ReplayState {
    pub fn new(scratch_limit: u64) -> Self {
        Self {
            memory: HostMemory::new(scratch_limit),
            ..Self::default()
        }
    }

    pub fn memory(&self) -> &HostMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut HostMemory {
        &mut self.memory
    }

    pub fn store_resource(&mut self, bytes: impl Into<Arc<[u8]>>) -> ResourceId {
        let id = ResourceId(self.next_resource);
        self.next_resource += 1;
        self.resources.insert(id, bytes.into());
        id
    }

    /// Number of stored resources, captured and scratch-backed.
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn resource(&self, id: ResourceId) -> Option<&[u8]> {
        self.resources.get(&id).map(|bytes| &bytes[..])
    }

    /// Record `bytes` as captured data at `addr` and return the observation describing it.
    ///
    /// Memory is not touched; the data lands there when a command carrying the observation is
    /// applied.
    pub fn observe(&mut self, addr: u64, bytes: &[u8]) -> Observation {
        let range = crate::memory::MemoryRange::new(addr, bytes.len() as u64);
        let id = self.store_resource(bytes);
        Observation { range, id }
    }

    pub fn apply_reads(&mut self, observations: &Observations) -> Result<(), StateError> {
        observations
            .reads
            .iter()
            .try_for_each(|obs| self.apply_observation(obs))
    }

    pub fn apply_writes(&mut self, observations: &Observations) -> Result<(), StateError> {
        observations
            .writes
            .iter()
            .try_for_each(|obs| self.apply_observation(obs))
    }

    fn apply_observation(&mut self, obs: &Observation) -> Result<(), StateError> {
        let data = self
            .resources
            .get(&obs.id)
            .ok_or(StateError::UnknownResource(obs.id))?;
        if data.len() as u64 != obs.range.size {
            return Err(StateError::ResourceSizeMismatch {
                id: obs.id,
                expected: obs.range.size,
                actual: data.len() as u64,
            });
        }
        self.memory.write(obs.range.base, data)?;
        Ok(())
    }

    /// Allocate scratch memory holding `bytes` and register the bytes as a resource so the
    /// allocation can be attached to a command as a read observation.
    ///
    /// The resource outlives the scratch block: emitted commands keep referring to it, so
    /// `resources` grows by one entry per successful allocation for the life of the state.
    /// Only rewritten commands allocate, which keeps this to a few small blocks per instance
    /// creation. A failed allocation registers nothing.
    pub fn alloc_data(&mut self, bytes: Vec<u8>) -> Result<AllocResult, MemoryError> {
        let id = ResourceId(self.next_resource);
        let shared: Arc<[u8]> = Arc::from(bytes.as_slice());
        let range = self.memory.alloc(bytes)?;
        self.next_resource += 1;
        self.resources.insert(id, shared);
        Ok(AllocResult { range, id })
    }

    /// Release the scratch memory behind `alloc`. The resource data stays available to
    /// commands that already reference it.
    pub fn free(&mut self, alloc: AllocResult) -> Result<(), MemoryError> {
        self.memory.free(alloc.range.base)
    }

    pub fn devices(&self) -> impl Iterator<Item = DeviceHandle> + '_ {
        self.devices.iter().copied()
    }

    pub fn instances(&self) -> &[InstanceRecord] {
        &self.instances
    }

    pub fn read_instance_create_info(&self, ptr: Pointer) -> Result<InstanceCreateInfo, MemoryError> {
        InstanceCreateInfo::read(&self.memory, ptr)
    }

    /// Read `count` NUL-terminated strings through the pointer array at `list`.
    pub fn read_strings(&self, list: Pointer, count: u32) -> Result<Vec<String>, MemoryError> {
        self.memory
            .read_pointers(list, count)?
            .into_iter()
            .map(|ptr| self.memory.read_cstr(ptr))
            .collect()
    }

    /// Apply the effects of `cmd` to the state.
    pub fn mutate(&mut self, id: CmdId, cmd: &Cmd) -> Result<(), StateError> {
        self.apply_reads(&cmd.observations)?;
        match &cmd.kind {
            CmdKind::CreateInstance(create) => {
                let info = self.read_instance_create_info(create.create_info)?;
                let layers =
                    self.read_strings(info.pp_enabled_layer_names, info.enabled_layer_count)?;
                let extensions = self.read_strings(
                    info.pp_enabled_extension_names,
                    info.enabled_extension_count,
                )?;
                self.instances.push(InstanceRecord {
                    id,
                    layers,
                    extensions,
                });
            }
            CmdKind::CreateDevice { device } => {
                if !self.devices.insert(*device) {
                    return Err(StateError::DuplicateDevice(*device));
                }
            }
            CmdKind::DestroyDevice { device } => {
                if !self.devices.remove(device) {
                    return Err(StateError::UnknownDevice(*device));
                }
            }
            CmdKind::DeviceWaitIdle { device, .. } => {
                if !self.devices.contains(device) {
                    return Err(StateError::UnknownDevice(*device));
                }
            }
            CmdKind::WaitFence { .. } | CmdKind::Opaque { .. } => {}
        }
        self.apply_writes(&cmd.observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::CommandBuilder;
    use pretty_assertions::assert_eq;

    #[test]
    fn device_lifecycle_is_tracked() {
        let cb = CommandBuilder::new(0);
        let mut state = ReplayState::default();
        state.mutate(CmdId(0), &cb.create_device(DeviceHandle(2))).unwrap();
        state.mutate(CmdId(1), &cb.create_device(DeviceHandle(1))).unwrap();
        assert_eq!(
            state.devices().collect::<Vec<_>>(),
            vec![DeviceHandle(1), DeviceHandle(2)]
        );

        assert_eq!(
            state.mutate(CmdId(2), &cb.create_device(DeviceHandle(1))),
            Err(StateError::DuplicateDevice(DeviceHandle(1)))
        );
        state.mutate(CmdId(3), &cb.destroy_device(DeviceHandle(2))).unwrap();
        assert_eq!(
            state.mutate(
                CmdId(4),
                &cb.device_wait_idle(DeviceHandle(2), crate::cmd::VkResult::Success)
            ),
            Err(StateError::UnknownDevice(DeviceHandle(2)))
        );
    }

    #[test]
    fn read_observation_with_wrong_size_is_rejected() {
        let mut state = ReplayState::default();
        let mut obs = state.observe(0x10, &[1, 2, 3]);
        obs.range.size = 4;

        let mut cmd = CommandBuilder::new(0).opaque("vkCmdDraw");
        cmd.add_read(obs);
        assert_eq!(
            state.mutate(CmdId(0), &cmd),
            Err(StateError::ResourceSizeMismatch {
                id: obs.id,
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn opaque_command_applies_observations() {
        let mut state = ReplayState::default();
        let read = state.observe(0x10, &[1, 2]);
        let write = state.observe(0x20, &[3, 4]);

        let mut cmd = CommandBuilder::new(0).opaque("vkQueueSubmit");
        cmd.add_read(read).add_write(write);
        state.mutate(CmdId(0), &cmd).unwrap();

        assert_eq!(state.memory().read(0x10, 2).unwrap(), &[1, 2]);
        assert_eq!(state.memory().read(0x20, 2).unwrap(), &[3, 4]);
    }

    #[test]
    fn freed_scratch_keeps_resource_data() {
        let mut state = ReplayState::default();
        let alloc = state.alloc_data(vec![9, 9]).unwrap();
        state.free(alloc).unwrap();
        assert!(!state.memory().is_allocated(alloc.ptr()));
        assert_eq!(state.resource(alloc.id), Some(&[9u8, 9][..]));
    }

    #[test]
    fn only_successful_allocations_retain_resources() {
        let mut state = ReplayState::new(32);
        let kept = state.alloc_data(vec![1; 16]).unwrap();
        assert_eq!(state.resource_count(), 1);

        assert!(state.alloc_data(vec![2; 64]).is_err());
        assert_eq!(state.resource_count(), 1);

        state.free(kept).unwrap();
        let again = state.alloc_data(vec![3; 16]).unwrap();
        assert_ne!(again.id, kept.id);
        assert_eq!(state.resource_count(), 2);
    }
}
