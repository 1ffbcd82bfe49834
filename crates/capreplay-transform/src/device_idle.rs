use crate::cmd::{CmdId, CommandBuilder, DeviceHandle, VkResult};
use crate::error::Result;
use crate::writer::Writer;

/// Emit a `vkDeviceWaitIdle` for every device known to the replay state.
///
/// All devices are drained, not just the one the triggering command touched, so that
/// synchronization points are global across every device queue. Devices are visited in
/// ascending handle order.
pub fn emit_device_wait_idle(out: &mut dyn Writer) -> Result<()> {
    let cb = CommandBuilder::new(0);
    let devices: Vec<DeviceHandle> = out.state().devices().collect();
    for device in devices {
        out.mutate_and_write(CmdId::NONE, cb.device_wait_idle(device, VkResult::Success))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::CmdKind;
    use crate::writer::CommandRecorder;
    use pretty_assertions::assert_eq;

    #[test]
    fn drains_every_known_device() {
        let cb = CommandBuilder::new(3);
        let mut recorder = CommandRecorder::default();
        for handle in [5, 1, 3] {
            recorder
                .mutate_and_write(CmdId(handle), cb.create_device(DeviceHandle(handle)))
                .unwrap();
        }

        emit_device_wait_idle(&mut recorder).unwrap();

        let waited: Vec<_> = recorder.cmds()[3..]
            .iter()
            .map(|(id, cmd)| {
                assert_eq!(*id, CmdId::NONE);
                match cmd.kind {
                    CmdKind::DeviceWaitIdle { device, result } => {
                        assert_eq!(result, VkResult::Success);
                        device
                    }
                    ref other => panic!("unexpected command {other:?}"),
                }
            })
            .collect();
        assert_eq!(waited, vec![DeviceHandle(1), DeviceHandle(3), DeviceHandle(5)]);
    }

    #[test]
    fn no_devices_emits_nothing() {
        let mut recorder = CommandRecorder::default();
        emit_device_wait_idle(&mut recorder).unwrap();
        assert!(recorder.cmds().is_empty());
    }
}
