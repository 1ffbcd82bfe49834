//! Transform contract and the chain that applies transforms in order.

use crate::cmd::{Cmd, CmdId};
use crate::error::Result;
use crate::state::ReplayState;
use crate::writer::Writer;

/// A stage that may inspect, rewrite, inject or drop stream commands.
pub trait Transform: Send {
    fn name(&self) -> &'static str;

    /// Process one incoming command, writing whatever should replace it to `out`.
    fn transform(&mut self, id: CmdId, cmd: Cmd, out: &mut dyn Writer) -> Result<()>;

    /// Called once after the last command. Must be safe to call even if no commands were seen.
    fn flush(&mut self, out: &mut dyn Writer) -> Result<()>;

    /// Called before a looped subsequence is replayed again.
    fn pre_loop(&mut self, _out: &mut dyn Writer) -> Result<()> {
        Ok(())
    }

    /// Called after a looped subsequence has been replayed.
    fn post_loop(&mut self, _out: &mut dyn Writer) -> Result<()> {
        Ok(())
    }
}

/// Writer handed to a transform: forwards into the remaining transforms, then into the sink.
struct ChainWriter<'a, 's> {
    rest: &'a mut [Box<dyn Transform>],
    sink: &'a mut (dyn Writer + 's),
}

impl Writer for ChainWriter<'_, '_> {
    fn state(&self) -> &ReplayState {
        self.sink.state()
    }

    fn state_mut(&mut self) -> &mut ReplayState {
        self.sink.state_mut()
    }

    fn mutate_and_write(&mut self, id: CmdId, cmd: Cmd) -> Result<()> {
        match self.rest.split_first_mut() {
            None => self.sink.mutate_and_write(id, cmd),
            Some((head, tail)) => {
                let mut next = ChainWriter {
                    rest: tail,
                    sink: &mut *self.sink,
                };
                head.transform(id, cmd, &mut next)
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Hook {
    Flush,
    PreLoop,
    PostLoop,
}

/// Ordered sequence of transforms. Later transforms observe the output of earlier ones.
#[derive(Default)]
pub struct TransformChain {
    transforms: Vec<Box<dyn Transform>>,
}

impl std::fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, transform: impl Transform + 'static) -> Self {
        self.push(Box::new(transform));
        self
    }

    pub fn push(&mut self, transform: Box<dyn Transform>) {
        self.transforms.push(transform);
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.transforms.iter().map(|t| t.name())
    }

    /// Feed one command into the head of the chain.
    pub fn transform(&mut self, id: CmdId, cmd: Cmd, sink: &mut dyn Writer) -> Result<()> {
        ChainWriter {
            rest: &mut self.transforms,
            sink: &mut *sink,
        }
        .mutate_and_write(id, cmd)
    }

    /// Flush every transform in order. Commands flushed by transform `i` pass through
    /// transforms `i + 1..`.
    pub fn flush(&mut self, sink: &mut dyn Writer) -> Result<()> {
        self.for_each_hook(Hook::Flush, sink)
    }

    pub fn pre_loop(&mut self, sink: &mut dyn Writer) -> Result<()> {
        self.for_each_hook(Hook::PreLoop, sink)
    }

    pub fn post_loop(&mut self, sink: &mut dyn Writer) -> Result<()> {
        self.for_each_hook(Hook::PostLoop, sink)
    }

    /// Transform a whole stream, then flush.
    pub fn run(
        &mut self,
        cmds: impl IntoIterator<Item = (CmdId, Cmd)>,
        sink: &mut dyn Writer,
    ) -> Result<()> {
        for (id, cmd) in cmds {
            self.transform(id, cmd, sink)?;
        }
        self.flush(sink)
    }

    fn for_each_hook(&mut self, hook: Hook, sink: &mut dyn Writer) -> Result<()> {
        for i in 0..self.transforms.len() {
            let Some((head, tail)) = self.transforms[i..].split_first_mut() else {
                break;
            };
            let _span = tracing::debug_span!("transform_hook", transform = head.name()).entered();
            let mut out = ChainWriter {
                rest: tail,
                sink: &mut *sink,
            };
            match hook {
                Hook::Flush => head.flush(&mut out)?,
                Hook::PreLoop => head.pre_loop(&mut out)?,
                Hook::PostLoop => head.post_loop(&mut out)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::{CmdKind, CommandBuilder};
    use crate::writer::CommandRecorder;
    use pretty_assertions::assert_eq;

    /// Injects a marker before every command and one on flush.
    struct Marker(&'static str);

    impl Transform for Marker {
        fn name(&self) -> &'static str {
            self.0
        }

        fn transform(&mut self, id: CmdId, cmd: Cmd, out: &mut dyn Writer) -> Result<()> {
            out.mutate_and_write(CmdId::NONE, CommandBuilder::new(0).opaque(self.0))?;
            out.mutate_and_write(id, cmd)
        }

        fn flush(&mut self, out: &mut dyn Writer) -> Result<()> {
            out.mutate_and_write(
                CmdId::NONE,
                CommandBuilder::new(0).opaque(format!("{}-flush", self.0)),
            )
        }

        fn pre_loop(&mut self, out: &mut dyn Writer) -> Result<()> {
            out.mutate_and_write(
                CmdId::NONE,
                CommandBuilder::new(0).opaque(format!("{}-pre", self.0)),
            )
        }
    }

    /// Drops every opaque command named "drop-me".
    struct Dropper;

    impl Transform for Dropper {
        fn name(&self) -> &'static str {
            "Dropper"
        }

        fn transform(&mut self, id: CmdId, cmd: Cmd, out: &mut dyn Writer) -> Result<()> {
            if matches!(&cmd.kind, CmdKind::Opaque { name } if name == "drop-me") {
                return Ok(());
            }
            out.mutate_and_write(id, cmd)
        }

        fn flush(&mut self, _out: &mut dyn Writer) -> Result<()> {
            Ok(())
        }
    }

    fn names(recorder: &CommandRecorder) -> Vec<String> {
        recorder
            .cmds()
            .iter()
            .map(|(_, cmd)| cmd.name().to_string())
            .collect()
    }

    #[test]
    fn later_transforms_see_output_of_earlier_ones() {
        let mut chain = TransformChain::new().with(Marker("a")).with(Marker("b"));
        let mut recorder = CommandRecorder::default();
        chain
            .run([(CmdId(0), CommandBuilder::new(0).opaque("draw"))], &mut recorder)
            .unwrap();

        assert_eq!(
            names(&recorder),
            vec!["b", "a", "b", "draw", "b", "a-flush", "b-flush"]
        );
    }

    #[test]
    fn dropped_commands_never_reach_sink() {
        let cb = CommandBuilder::new(0);
        let mut chain = TransformChain::new().with(Dropper);
        let mut recorder = CommandRecorder::default();
        chain
            .run(
                [
                    (CmdId(0), cb.opaque("keep")),
                    (CmdId(1), cb.opaque("drop-me")),
                    (CmdId(2), cb.opaque("keep-too")),
                ],
                &mut recorder,
            )
            .unwrap();

        assert_eq!(names(&recorder), vec!["keep", "keep-too"]);
        assert_eq!(recorder.cmds()[1].0, CmdId(2));
    }

    #[test]
    fn loop_hooks_default_to_noop() {
        let mut chain = TransformChain::new().with(Dropper).with(Marker("m"));
        let mut recorder = CommandRecorder::default();
        chain.pre_loop(&mut recorder).unwrap();
        chain.post_loop(&mut recorder).unwrap();
        assert_eq!(names(&recorder), vec!["m-pre"]);
    }

    #[test]
    fn flush_of_empty_stream_is_safe() {
        let mut chain = TransformChain::new().with(Dropper);
        let mut recorder = CommandRecorder::default();
        chain.run(Vec::new(), &mut recorder).unwrap();
        assert!(recorder.cmds().is_empty());
        assert_eq!(chain.names().collect::<Vec<_>>(), vec!["Dropper"]);
    }
}
