//! Forces the render-stages producer layer on for every instance the replay creates, so the
//! replay device can emit per-stage GPU timing.

use crate::alloc::ScratchScope;
use crate::cmd::{Cmd, CmdId, CmdKind, CommandBuilder, CreateInstance, InstanceCreateInfo};
use crate::error::{Result, TransformError};
use crate::transform::Transform;
use crate::writer::Writer;

/// Layer that produces render-stage timing data.
pub const RENDER_STAGES_LAYER: &str = "VkRenderStagesProducer";

#[derive(Clone, Debug)]
pub struct ProfilingLayers {
    required_layer: String,
}

impl Default for ProfilingLayers {
    fn default() -> Self {
        Self::new(RENDER_STAGES_LAYER)
    }
}

impl ProfilingLayers {
    pub fn new(required_layer: impl Into<String>) -> Self {
        Self {
            required_layer: required_layer.into(),
        }
    }

    pub fn required_layer(&self) -> &str {
        &self.required_layer
    }

    fn rewrite_create_instance(
        &self,
        id: CmdId,
        cmd: Cmd,
        create: CreateInstance,
        out: &mut dyn Writer,
    ) -> Result<()> {
        let mut scope = ScratchScope::new(out);

        let state = scope.state_mut();
        state.apply_reads(&cmd.observations)?;
        let info = state.read_instance_create_info(create.create_info)?;
        let mem = state.memory();
        let mut layers = mem.read_pointers(info.pp_enabled_layer_names, info.enabled_layer_count)?;
        let exts =
            mem.read_pointers(info.pp_enabled_extension_names, info.enabled_extension_count)?;

        for &layer in &layers {
            if mem.read_cstr(layer)? == self.required_layer {
                tracing::debug!(%id, layer = %self.required_layer, "layer already enabled");
                return scope.emit(id, cmd);
            }
        }

        let layer_count = info
            .enabled_layer_count
            .checked_add(1)
            .ok_or(TransformError::InvalidArguments("enabled layer count overflows u32"))?;

        let name_data = scope.alloc(self.required_layer.as_str())?;
        layers.push(name_data.ptr());
        let layers_data = scope.alloc(&layers)?;
        let exts_data = scope.alloc(&exts)?;

        let patched = InstanceCreateInfo {
            enabled_layer_count: layer_count,
            pp_enabled_layer_names: layers_data.ptr(),
            enabled_extension_count: info.enabled_extension_count,
            pp_enabled_extension_names: exts_data.ptr(),
            ..info
        };
        let info_data = scope.alloc(&patched)?;

        let mut rewritten = CommandBuilder::new(cmd.thread).create_instance(
            info_data.ptr(),
            create.allocator,
            create.instance,
            create.result,
        );
        rewritten
            .add_read(info_data.data())
            .add_read(layers_data.data())
            .add_read(name_data.data())
            .add_read(exts_data.data());
        // Carry the original observations over so the state engine sees the same side
        // effects as if the unmodified command had run.
        for &read in &cmd.observations.reads {
            rewritten.add_read(read);
        }
        for &write in &cmd.observations.writes {
            rewritten.add_write(write);
        }

        tracing::debug!(%id, layer = %self.required_layer, layer_count, "injected layer");
        scope.emit(id, rewritten)
    }
}

impl Transform for ProfilingLayers {
    fn name(&self) -> &'static str {
        "ProfilingLayers"
    }

    fn transform(&mut self, id: CmdId, cmd: Cmd, out: &mut dyn Writer) -> Result<()> {
        let _span = tracing::debug_span!("ProfilingLayers", %id).entered();
        match cmd.kind {
            CmdKind::CreateInstance(create) => self.rewrite_create_instance(id, cmd, create, out),
            _ => out.mutate_and_write(id, cmd),
        }
    }

    fn flush(&mut self, _out: &mut dyn Writer) -> Result<()> {
        Ok(())
    }
}
