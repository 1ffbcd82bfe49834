use crate::cmd::{Cmd, CmdId};
use crate::error::TransformError;
use crate::state::ReplayState;

/// Sink that transforms emit commands into.
///
/// `mutate_and_write` applies the command to the replay state and appends it to the output as
/// one step; it must be called for every command that should survive into the replay, in final
/// emission order.
pub trait Writer {
    fn state(&self) -> &ReplayState;

    fn state_mut(&mut self) -> &mut ReplayState;

    fn mutate_and_write(&mut self, id: CmdId, cmd: Cmd) -> Result<(), TransformError>;
}

/// Writer that applies commands to an owned [`ReplayState`] and records them in order.
#[derive(Debug, Default)]
pub struct CommandRecorder {
    state: ReplayState,
    cmds: Vec<(CmdId, Cmd)>,
}

impl CommandRecorder {
    pub fn new(state: ReplayState) -> Self {
        Self {
            state,
            cmds: Vec::new(),
        }
    }

    pub fn cmds(&self) -> &[(CmdId, Cmd)] {
        &self.cmds
    }

    pub fn into_parts(self) -> (ReplayState, Vec<(CmdId, Cmd)>) {
        (self.state, self.cmds)
    }
}

impl Writer for CommandRecorder {
    fn state(&self) -> &ReplayState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ReplayState {
        &mut self.state
    }

    fn mutate_and_write(&mut self, id: CmdId, cmd: Cmd) -> Result<(), TransformError> {
        self.state.mutate(id, &cmd)?;
        tracing::trace!(%id, cmd = cmd.name(), "recorded command");
        self.cmds.push((id, cmd));
        Ok(())
    }
}
