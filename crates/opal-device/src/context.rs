//! The device context: the synchronous binding surface.
//!
//! Every mutator follows the same contract: validate first (failures leave
//! state untouched and emit nothing), skip redundant sets without emitting,
//! otherwise acquire the new reference before releasing the old one and emit
//! exactly one command per accepted change. The context is single-threaded
//! by construction (`&mut self` everywhere); the sink worker is the only
//! other thread that observes the stream.

use std::mem;
use std::sync::Arc;

use glam::{Mat4, Vec4};
use opal_cmd::{
    ColorRgba, Command, CommandSink, IndexFormat, LightParams, Material, PipelineKind,
    PrimitiveType, Rect, RenderState, SamplerStateKind, ShaderType, TextureStageStateKind,
    TransformState, Viewport, ClearFlags, STREAM_SOURCE_INDEXED_DATA, STREAM_SOURCE_INSTANCE_DATA,
};
use tracing::{debug, warn};

use crate::device::{DeviceCaps, FeatureLevel, IdAllocator};
use crate::error::DeviceError;
use crate::format::dsv_srv_conflict;
use crate::light::validate_light;
use crate::resource::{
    BindFlags, Query, RenderTargetView, Resource, Sampler, Shader, ShaderResourceView,
    UnorderedAccessView, VertexDeclaration, ViewDesc,
};
use crate::state::{
    IndexBufferBinding, State, MAX_CLIP_PLANES, MAX_CONSTANT_BUFFERS, MAX_RENDER_TARGETS,
    MAX_SAMPLERS_PER_STAGE, MAX_SHADER_RESOURCE_VIEWS, MAX_STREAMS, MAX_STREAM_OUTPUTS,
    MAX_TEXTURE_STAGES, MAX_UNORDERED_ACCESS_VIEWS, MAX_VIEWPORTS,
};
use crate::state_object::{
    blend_desc_from_state, depth_stencil_desc_from_state, rasterizer_desc_from_state, BlendState,
    DepthStencilState, RasterizerState, StateObjectCaches,
};

bitflags::bitflags! {
    /// Composite-state groups invalidated by legacy scalar state changes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct LegacyDirty: u32 {
        const BLEND = 1 << 0;
        const RASTERIZER = 1 << 1;
        const DEPTH_STENCIL = 1 << 2;
    }
}

/// Composite groups a legacy render state feeds into.
fn legacy_dirty_groups(state: RenderState) -> LegacyDirty {
    use RenderState as RS;
    match state {
        RS::AlphaBlendEnable
        | RS::SrcBlend
        | RS::DestBlend
        | RS::BlendOp
        | RS::SeparateAlphaBlendEnable
        | RS::SrcBlendAlpha
        | RS::DestBlendAlpha
        | RS::BlendOpAlpha
        | RS::ColorWriteEnable
        | RS::ColorWriteEnable1
        | RS::ColorWriteEnable2
        | RS::ColorWriteEnable3
        | RS::BlendFactor
        | RS::MultisampleMask => LegacyDirty::BLEND,
        RS::FillMode
        | RS::CullMode
        | RS::DepthBias
        | RS::SlopeScaleDepthBias
        | RS::ScissorTestEnable
        | RS::AntialiasedLineEnable
        | RS::MultisampleAntialias => LegacyDirty::RASTERIZER,
        RS::ZEnable
        | RS::ZWriteEnable
        | RS::ZFunc
        | RS::StencilEnable
        | RS::StencilFail
        | RS::StencilZFail
        | RS::StencilPass
        | RS::StencilFunc
        | RS::StencilRef
        | RS::StencilMask
        | RS::StencilWriteMask
        | RS::TwoSidedStencilMode
        | RS::CcwStencilFail
        | RS::CcwStencilZFail
        | RS::CcwStencilPass
        | RS::CcwStencilFunc => LegacyDirty::DEPTH_STENCIL,
        _ => LegacyDirty::empty(),
    }
}

fn option_arc_eq<T: ?Sized>(a: &Option<Arc<T>>, b: Option<&Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

fn check_bind_flags(resource: &Resource, required: BindFlags) -> Result<(), DeviceError> {
    let actual = resource.desc().bind_flags;
    if actual.contains(required) {
        Ok(())
    } else {
        warn!(?required, ?actual, resource = ?resource.id(), "bind flag check failed");
        Err(DeviceError::InvalidBindFlags { required, actual })
    }
}

pub struct DeviceContext {
    sink: Arc<dyn CommandSink>,
    ids: Arc<IdAllocator>,
    caps: DeviceCaps,
    state: State,
    caches: StateObjectCaches,
    dirty: LegacyDirty,
    warned_wbuffer: bool,
}

impl DeviceContext {
    pub(crate) fn new(sink: Arc<dyn CommandSink>, ids: Arc<IdAllocator>, caps: DeviceCaps) -> Self {
        Self {
            sink,
            ids,
            caps,
            state: State::default(),
            caches: StateObjectCaches::default(),
            dirty: LegacyDirty::all(),
            warned_wbuffer: false,
        }
    }

    pub fn sink(&self) -> &Arc<dyn CommandSink> {
        &self.sink
    }

    /// Adapter limits this context validates against.
    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// Read-only view of the full bound state.
    pub fn state(&self) -> &State {
        &self.state
    }

    // --- Output merger ---

    pub fn set_render_target_view(
        &mut self,
        index: u32,
        view: Option<&Arc<RenderTargetView>>,
        set_viewport: bool,
    ) -> Result<(), DeviceError> {
        let limit = self.caps.max_render_targets.min(MAX_RENDER_TARGETS as u32);
        if index >= limit {
            warn!(index, limit, "render target index out of range");
            return Err(DeviceError::InvalidIndex { index, limit });
        }
        if let Some(view) = view {
            check_bind_flags(view.resource(), BindFlags::RENDER_TARGET)?;
        }

        let slot = index as usize;
        let same = option_arc_eq(&self.state.fb.render_targets[slot], view);
        if same && !set_viewport {
            return Ok(());
        }

        if !same {
            if let Some(view) = view {
                let resource = Arc::clone(view.resource());
                let desc = *view.desc();
                self.unbind_conflicting_srvs(&resource, &desc, false);
            }
            let new = view.cloned();
            let old = mem::replace(&mut self.state.fb.render_targets[slot], new);
            self.sink.emit(Command::SetRenderTargetView {
                index,
                view: view.map(|v| v.id()),
            });
            drop(old);
        }

        // Binding the primary target conventionally re-aims viewport 0 and
        // scissor 0 at the new surface.
        if index == 0 && set_viewport {
            let dims = self.state.fb.render_targets[0]
                .as_ref()
                .map(|v| (v.width(), v.height()));
            if let Some((w, h)) = dims {
                let viewport = Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: w as f32,
                    height: h as f32,
                    min_z: 0.0,
                    max_z: 1.0,
                };
                let rect = Rect {
                    left: 0,
                    top: 0,
                    right: w as i32,
                    bottom: h as i32,
                };
                self.set_viewports(&[viewport])?;
                self.set_scissor_rects(&[rect])?;
            }
        }
        Ok(())
    }

    pub fn set_depth_stencil_view(
        &mut self,
        view: Option<&Arc<RenderTargetView>>,
    ) -> Result<(), DeviceError> {
        if let Some(view) = view {
            check_bind_flags(view.resource(), BindFlags::DEPTH_STENCIL)?;
            if !view.desc().format.is_depth_stencil() {
                return Err(DeviceError::InvalidViewFormat(view.desc().format));
            }
        }
        if option_arc_eq(&self.state.fb.depth_stencil, view) {
            return Ok(());
        }

        if let Some(view) = view {
            let resource = Arc::clone(view.resource());
            let desc = *view.desc();
            self.unbind_conflicting_srvs(&resource, &desc, true);
        }
        let new = view.cloned();
        let old = mem::replace(&mut self.state.fb.depth_stencil, new);
        self.sink.emit(Command::SetDepthStencilView {
            view: view.map(|v| v.id()),
        });
        drop(old);
        Ok(())
    }

    pub fn render_target_view(&self, index: u32) -> Option<&Arc<RenderTargetView>> {
        self.state
            .fb
            .render_targets
            .get(index as usize)
            .and_then(|slot| slot.as_ref())
    }

    pub fn depth_stencil_view(&self) -> Option<&Arc<RenderTargetView>> {
        self.state.fb.depth_stencil.as_ref()
    }

    /// Drops shader-resource bindings that would read subresources the new
    /// output view may write. Unbinds are emitted before the caller's bind
    /// command so the stream never holds both sides at once.
    fn unbind_conflicting_srvs(&mut self, resource: &Arc<Resource>, desc: &ViewDesc, is_dsv: bool) {
        for ty in ShaderType::ALL {
            for slot in 0..MAX_SHADER_RESOURCE_VIEWS {
                let conflicts = match &self.state.shader_resource_views[ty as usize][slot] {
                    Some(srv)
                        if Arc::ptr_eq(srv.resource(), resource)
                            && srv.desc().overlaps(desc) =>
                    {
                        if is_dsv {
                            dsv_srv_conflict(desc.format, desc.dsv_flags, srv.desc().format)
                        } else {
                            true
                        }
                    }
                    _ => false,
                };
                if conflicts {
                    warn!(
                        stage = ?ty,
                        slot,
                        resource = ?resource.id(),
                        "unbinding shader resource view that aliases a bound output"
                    );
                    let old = self.state.shader_resource_views[ty as usize][slot].take();
                    self.sink.emit(Command::SetShaderResourceViews {
                        ty,
                        start_idx: slot as u32,
                        views: vec![None],
                    });
                    drop(old);
                }
            }
        }
    }

    // --- Shaders and shader-stage bindings ---

    pub fn set_shader(
        &mut self,
        ty: ShaderType,
        shader: Option<&Arc<Shader>>,
    ) -> Result<(), DeviceError> {
        if let Some(shader) = shader {
            if shader.shader_type() != ty {
                return Err(DeviceError::ShaderStageMismatch {
                    expected: ty,
                    actual: shader.shader_type(),
                });
            }
        }
        let slot = &mut self.state.shaders[ty as usize];
        if option_arc_eq(slot, shader) {
            return Ok(());
        }
        let old = mem::replace(slot, shader.cloned());
        self.sink.emit(Command::SetShader {
            ty,
            shader: shader.map(|s| s.id()),
        });
        drop(old);
        Ok(())
    }

    pub fn shader(&self, ty: ShaderType) -> Option<&Arc<Shader>> {
        self.state.shaders[ty as usize].as_ref()
    }

    pub fn set_constant_buffers(
        &mut self,
        ty: ShaderType,
        start_idx: u32,
        buffers: &[Option<Arc<Resource>>],
    ) -> Result<(), DeviceError> {
        let end = start_idx as usize + buffers.len();
        if end > MAX_CONSTANT_BUFFERS {
            return Err(DeviceError::InvalidIndex {
                index: end as u32,
                limit: MAX_CONSTANT_BUFFERS as u32,
            });
        }
        for buffer in buffers.iter().flatten() {
            check_bind_flags(buffer, BindFlags::CONSTANT_BUFFER)?;
        }

        let slots = &mut self.state.constant_buffers[ty as usize][start_idx as usize..end];
        if !replace_slot_range(slots, buffers) {
            return Ok(());
        }
        self.sink.emit(Command::SetConstantBuffers {
            ty,
            start_idx,
            buffers: buffers.iter().map(|b| b.as_ref().map(|r| r.id())).collect(),
        });
        Ok(())
    }

    pub fn set_samplers(
        &mut self,
        ty: ShaderType,
        start_idx: u32,
        samplers: &[Option<Arc<Sampler>>],
    ) -> Result<(), DeviceError> {
        let end = start_idx as usize + samplers.len();
        if end > MAX_SAMPLERS_PER_STAGE {
            return Err(DeviceError::InvalidIndex {
                index: end as u32,
                limit: MAX_SAMPLERS_PER_STAGE as u32,
            });
        }
        let slots = &mut self.state.samplers[ty as usize][start_idx as usize..end];
        if !replace_slot_range(slots, samplers) {
            return Ok(());
        }
        self.sink.emit(Command::SetSamplers {
            ty,
            start_idx,
            samplers: samplers.iter().map(|s| s.as_ref().map(|s| s.id())).collect(),
        });
        Ok(())
    }

    pub fn set_shader_resource_views(
        &mut self,
        ty: ShaderType,
        start_idx: u32,
        views: &[Option<Arc<ShaderResourceView>>],
    ) -> Result<(), DeviceError> {
        let end = start_idx as usize + views.len();
        if end > MAX_SHADER_RESOURCE_VIEWS {
            return Err(DeviceError::InvalidIndex {
                index: end as u32,
                limit: MAX_SHADER_RESOURCE_VIEWS as u32,
            });
        }
        for view in views.iter().flatten() {
            check_bind_flags(view.resource(), BindFlags::SHADER_RESOURCE)?;
        }
        let slots = &mut self.state.shader_resource_views[ty as usize][start_idx as usize..end];
        if !replace_slot_range(slots, views) {
            return Ok(());
        }
        self.sink.emit(Command::SetShaderResourceViews {
            ty,
            start_idx,
            views: views.iter().map(|v| v.as_ref().map(|v| v.id())).collect(),
        });
        Ok(())
    }

    pub fn set_unordered_access_views(
        &mut self,
        pipeline: PipelineKind,
        start_idx: u32,
        views: &[Option<Arc<UnorderedAccessView>>],
    ) -> Result<(), DeviceError> {
        if self.caps.feature_level < FeatureLevel::Level11_0 {
            return Err(DeviceError::FeatureLevelTooLow {
                required: FeatureLevel::Level11_0,
            });
        }
        let end = start_idx as usize + views.len();
        if end > MAX_UNORDERED_ACCESS_VIEWS {
            return Err(DeviceError::InvalidIndex {
                index: end as u32,
                limit: MAX_UNORDERED_ACCESS_VIEWS as u32,
            });
        }
        for view in views.iter().flatten() {
            check_bind_flags(view.resource(), BindFlags::UNORDERED_ACCESS)?;
        }
        let slots = &mut self.state.unordered_access_views[pipeline as usize][start_idx as usize..end];
        if !replace_slot_range(slots, views) {
            return Ok(());
        }
        self.sink.emit(Command::SetUnorderedAccessViews {
            pipeline,
            start_idx,
            views: views.iter().map(|v| v.as_ref().map(|v| v.id())).collect(),
        });
        Ok(())
    }

    // --- Input assembly ---

    pub fn set_stream_source(
        &mut self,
        stream: u32,
        buffer: Option<&Arc<Resource>>,
        offset: u32,
        stride: u32,
    ) -> Result<(), DeviceError> {
        if stream as usize >= MAX_STREAMS {
            return Err(DeviceError::InvalidIndex {
                index: stream,
                limit: MAX_STREAMS as u32,
            });
        }
        if let Some(buffer) = buffer {
            check_bind_flags(buffer, BindFlags::VERTEX_BUFFER)?;
        }
        let slot = &mut self.state.streams[stream as usize];
        if option_arc_eq(&slot.buffer, buffer) && slot.offset == offset && slot.stride == stride {
            return Ok(());
        }
        let old = mem::replace(&mut slot.buffer, buffer.cloned());
        slot.offset = offset;
        slot.stride = stride;
        self.sink.emit(Command::SetStreamSource {
            stream,
            buffer: buffer.map(|b| b.id()),
            offset,
            stride,
        });
        drop(old);
        Ok(())
    }

    pub fn set_stream_source_freq(
        &mut self,
        stream: u32,
        frequency: u32,
    ) -> Result<(), DeviceError> {
        if stream as usize >= MAX_STREAMS {
            return Err(DeviceError::InvalidIndex {
                index: stream,
                limit: MAX_STREAMS as u32,
            });
        }
        let markers = STREAM_SOURCE_INDEXED_DATA | STREAM_SOURCE_INSTANCE_DATA;
        // A frequency carries at most one marker bit and a non-zero count.
        if frequency & markers == markers || frequency & !markers == 0 {
            return Err(DeviceError::InvalidStreamFrequency(frequency));
        }
        // Stream 0 carries the indexed geometry; it cannot hold per-instance
        // data (the legacy runtime rejects this with an invalid call).
        if stream == 0 && frequency & STREAM_SOURCE_INSTANCE_DATA != 0 {
            warn!(frequency, "per-instance frequency is not allowed on stream 0");
            return Err(DeviceError::InvalidStreamFrequency(frequency));
        }
        let slot = &mut self.state.streams[stream as usize];
        if slot.frequency == frequency {
            return Ok(());
        }
        slot.frequency = frequency;
        self.sink
            .emit(Command::SetStreamSourceFreq { stream, frequency });
        Ok(())
    }

    pub fn set_stream_output(
        &mut self,
        index: u32,
        buffer: Option<&Arc<Resource>>,
        offset: u32,
    ) -> Result<(), DeviceError> {
        if index as usize >= MAX_STREAM_OUTPUTS {
            return Err(DeviceError::InvalidIndex {
                index,
                limit: MAX_STREAM_OUTPUTS as u32,
            });
        }
        if let Some(buffer) = buffer {
            check_bind_flags(buffer, BindFlags::STREAM_OUTPUT)?;
        }
        let slot = &mut self.state.stream_outputs[index as usize];
        if option_arc_eq(&slot.buffer, buffer) && slot.offset == offset {
            return Ok(());
        }
        let old = mem::replace(&mut slot.buffer, buffer.cloned());
        slot.offset = offset;
        let outputs = self
            .state
            .stream_outputs
            .iter()
            .map(|so| (so.buffer.as_ref().map(|b| b.id()), so.offset))
            .collect();
        self.sink.emit(Command::SetStreamOutputs { outputs });
        drop(old);
        Ok(())
    }

    pub fn set_index_buffer(
        &mut self,
        buffer: Option<&Arc<Resource>>,
        format: IndexFormat,
        offset: u32,
    ) -> Result<(), DeviceError> {
        if let Some(buffer) = buffer {
            check_bind_flags(buffer, BindFlags::INDEX_BUFFER)?;
        }
        let same = match (&self.state.index_buffer, buffer) {
            (Some(current), Some(new)) => {
                Arc::ptr_eq(&current.buffer, new)
                    && current.format == format
                    && current.offset == offset
            }
            (None, None) => true,
            _ => false,
        };
        if same {
            return Ok(());
        }
        let new = buffer.map(|buffer| IndexBufferBinding {
            buffer: Arc::clone(buffer),
            format,
            offset,
        });
        let old = mem::replace(&mut self.state.index_buffer, new);
        self.sink.emit(Command::SetIndexBuffer {
            buffer: buffer.map(|b| b.id()),
            format,
            offset,
        });
        drop(old);
        Ok(())
    }

    pub fn set_vertex_declaration(&mut self, declaration: Option<&Arc<VertexDeclaration>>) {
        if option_arc_eq(&self.state.vertex_declaration, declaration) {
            return;
        }
        let old = mem::replace(&mut self.state.vertex_declaration, declaration.cloned());
        self.sink.emit(Command::SetVertexDeclaration {
            declaration: declaration.map(|d| d.id()),
        });
        drop(old);
    }

    // --- Composite state objects ---

    pub fn set_blend_state(
        &mut self,
        state: Option<&Arc<BlendState>>,
        factor: ColorRgba,
        sample_mask: u32,
    ) {
        if option_arc_eq(&self.state.blend_state, state)
            && self.state.blend_factor == factor
            && self.state.sample_mask == sample_mask
        {
            return;
        }
        let old = mem::replace(&mut self.state.blend_state, state.cloned());
        self.state.blend_factor = factor;
        self.state.sample_mask = sample_mask;
        self.sink.emit(Command::SetBlendState {
            state: state.map(|s| s.id()),
            factor,
            sample_mask,
        });
        drop(old);
    }

    pub fn set_rasterizer_state(&mut self, state: Option<&Arc<RasterizerState>>) {
        if option_arc_eq(&self.state.rasterizer_state, state) {
            return;
        }
        let old = mem::replace(&mut self.state.rasterizer_state, state.cloned());
        self.sink.emit(Command::SetRasterizerState {
            state: state.map(|s| s.id()),
        });
        drop(old);
    }

    pub fn set_depth_stencil_state(
        &mut self,
        state: Option<&Arc<DepthStencilState>>,
        stencil_ref: u32,
    ) {
        if option_arc_eq(&self.state.depth_stencil_state, state)
            && self.state.stencil_ref == stencil_ref
        {
            return;
        }
        let old = mem::replace(&mut self.state.depth_stencil_state, state.cloned());
        self.state.stencil_ref = stencil_ref;
        self.sink.emit(Command::SetDepthStencilState {
            state: state.map(|s| s.id()),
            stencil_ref,
        });
        drop(old);
    }

    // --- Viewports and scissors ---

    pub fn set_viewports(&mut self, viewports: &[Viewport]) -> Result<(), DeviceError> {
        if viewports.len() > MAX_VIEWPORTS {
            return Err(DeviceError::TooManyViewports {
                count: viewports.len(),
                limit: MAX_VIEWPORTS,
            });
        }
        if self.viewports() == viewports {
            return Ok(());
        }
        self.state.viewports[..viewports.len()].copy_from_slice(viewports);
        self.state.viewport_count = viewports.len();
        self.sink.emit(Command::SetViewports {
            viewports: viewports.to_vec(),
        });
        Ok(())
    }

    /// The active viewports (set count, not the backing capacity).
    pub fn viewports(&self) -> &[Viewport] {
        &self.state.viewports[..self.state.viewport_count]
    }

    pub fn set_scissor_rects(&mut self, rects: &[Rect]) -> Result<(), DeviceError> {
        if rects.len() > MAX_VIEWPORTS {
            return Err(DeviceError::TooManyScissorRects {
                count: rects.len(),
                limit: MAX_VIEWPORTS,
            });
        }
        if self.scissor_rects() == rects {
            return Ok(());
        }
        self.state.scissor_rects[..rects.len()].copy_from_slice(rects);
        self.state.scissor_rect_count = rects.len();
        self.sink.emit(Command::SetScissorRects {
            rects: rects.to_vec(),
        });
        Ok(())
    }

    pub fn scissor_rects(&self) -> &[Rect] {
        &self.state.scissor_rects[..self.state.scissor_rect_count]
    }

    // --- Legacy scalar state ---

    pub fn set_render_state(&mut self, state: RenderState, value: u32) {
        let slot = &mut self.state.render_states[state as usize];
        if *slot == value {
            return;
        }
        *slot = value;
        self.dirty |= legacy_dirty_groups(state);
        self.sink.emit(Command::SetRenderState { state, value });
    }

    pub fn set_sampler_state(
        &mut self,
        sampler: u32,
        state: SamplerStateKind,
        value: u32,
    ) -> Result<(), DeviceError> {
        if sampler as usize >= MAX_SAMPLERS_PER_STAGE {
            return Err(DeviceError::InvalidIndex {
                index: sampler,
                limit: MAX_SAMPLERS_PER_STAGE as u32,
            });
        }
        let slot = &mut self.state.sampler_states[sampler as usize][state as usize];
        if *slot == value {
            return Ok(());
        }
        *slot = value;
        self.sink.emit(Command::SetSamplerState {
            sampler,
            state,
            value,
        });
        Ok(())
    }

    pub fn set_texture_stage_state(
        &mut self,
        stage: u32,
        state: TextureStageStateKind,
        value: u32,
    ) -> Result<(), DeviceError> {
        if stage as usize >= MAX_TEXTURE_STAGES {
            return Err(DeviceError::InvalidIndex {
                index: stage,
                limit: MAX_TEXTURE_STAGES as u32,
            });
        }
        let slot = &mut self.state.texture_stage_states[stage as usize][state as usize];
        if *slot == value {
            return Ok(());
        }
        *slot = value;
        self.sink.emit(Command::SetTextureStageState {
            stage,
            state,
            value,
        });
        Ok(())
    }

    pub fn set_texture(
        &mut self,
        stage: u32,
        texture: Option<&Arc<Resource>>,
    ) -> Result<(), DeviceError> {
        if stage as usize >= MAX_TEXTURE_STAGES {
            return Err(DeviceError::InvalidIndex {
                index: stage,
                limit: MAX_TEXTURE_STAGES as u32,
            });
        }
        if let Some(texture) = texture {
            check_bind_flags(texture, BindFlags::SHADER_RESOURCE)?;
        }
        let slot = &mut self.state.textures[stage as usize];
        if option_arc_eq(slot, texture) {
            return Ok(());
        }
        let old = mem::replace(slot, texture.cloned());
        self.sink.emit(Command::SetTexture {
            stage,
            texture: texture.map(|t| t.id()),
        });
        drop(old);
        Ok(())
    }

    // --- Fixed-function state ---

    pub fn set_transform(&mut self, state: TransformState, matrix: Mat4) -> Result<(), DeviceError> {
        let index = state.index().ok_or(DeviceError::InvalidTransform)?;
        if self.state.transforms[index] == matrix {
            debug!(?state, "transform unchanged, skipping");
            return Ok(());
        }
        self.state.transforms[index] = matrix;
        self.sink.emit(Command::SetTransform { state, matrix });
        Ok(())
    }

    pub fn transform(&self, state: TransformState) -> Result<Mat4, DeviceError> {
        let index = state.index().ok_or(DeviceError::InvalidTransform)?;
        Ok(self.state.transforms[index])
    }

    /// Multiplies `matrix` onto the current value of the slot.
    pub fn multiply_transform(
        &mut self,
        state: TransformState,
        matrix: Mat4,
    ) -> Result<(), DeviceError> {
        let current = self.transform(state)?;
        self.set_transform(state, current * matrix)
    }

    pub fn set_clip_plane(&mut self, index: u32, plane: Vec4) -> Result<(), DeviceError> {
        let limit = self.caps.max_clip_planes.min(MAX_CLIP_PLANES as u32);
        if index >= limit {
            return Err(DeviceError::InvalidIndex { index, limit });
        }
        let slot = &mut self.state.clip_planes[index as usize];
        if *slot == plane {
            return Ok(());
        }
        *slot = plane;
        self.sink.emit(Command::SetClipPlane { index, plane });
        Ok(())
    }

    pub fn set_material(&mut self, material: &Material) {
        if self.state.material == *material {
            return;
        }
        self.state.material = *material;
        self.sink.emit(Command::SetMaterial {
            material: *material,
        });
    }

    pub fn set_light(&mut self, index: u32, params: &LightParams) -> Result<(), DeviceError> {
        validate_light(params)?;
        if self.state.lights.get(index).map(|e| e.params) == Some(*params) {
            return Ok(());
        }
        let derived = self.state.lights.set(index, *params);
        self.sink.emit(Command::SetLight {
            index,
            light: *params,
            derived,
        });
        Ok(())
    }

    pub fn set_light_enable(&mut self, index: u32, enable: bool) {
        if let Some(entry) = self.state.lights.get(index) {
            if entry.enabled == enable {
                return;
            }
        }
        let created = self.state.lights.set_enable(index, enable);
        if created {
            // The implicit default light must reach the backend before its
            // enable toggle.
            if let Some(entry) = self.state.lights.get(index) {
                self.sink.emit(Command::SetLight {
                    index,
                    light: entry.params,
                    derived: entry.derived,
                });
            }
        }
        self.sink.emit(Command::SetLightEnable { index, enable });
    }

    pub fn set_predication(&mut self, query: Option<&Arc<Query>>, value: bool) {
        if option_arc_eq(&self.state.predicate, query) && self.state.predicate_value == value {
            return;
        }
        let old = mem::replace(&mut self.state.predicate, query.cloned());
        self.state.predicate_value = value;
        self.sink.emit(Command::SetPredication {
            query: query.map(|q| q.id()),
            value,
        });
        drop(old);
    }

    // --- Legacy composite commit ---

    /// Rebuilds the composite state objects invalidated since the last draw
    /// and binds them. Identical descriptors dedup to the same cached object,
    /// so a rebuild that lands on the same values emits nothing.
    pub fn commit_legacy_state(&mut self) {
        if self.dirty.contains(LegacyDirty::BLEND) {
            let desc = blend_desc_from_state(&self.state);
            let blend = self.caches.blend.get_or_create(desc, &self.ids, &self.sink);
            let factor = ColorRgba::from_argb(self.state.render_state(RenderState::BlendFactor));
            let sample_mask = self.state.render_state(RenderState::MultisampleMask);
            self.set_blend_state(Some(&blend), factor, sample_mask);
        }
        if self.dirty.contains(LegacyDirty::RASTERIZER) {
            let desc = rasterizer_desc_from_state(&self.state);
            let rasterizer = self
                .caches
                .rasterizer
                .get_or_create(desc, &self.ids, &self.sink);
            self.set_rasterizer_state(Some(&rasterizer));
        }
        if self.dirty.contains(LegacyDirty::DEPTH_STENCIL) {
            let desc = depth_stencil_desc_from_state(&self.state, &mut self.warned_wbuffer);
            let depth_stencil = self
                .caches
                .depth_stencil
                .get_or_create(desc, &self.ids, &self.sink);
            let stencil_ref = self.state.render_state(RenderState::StencilRef);
            self.set_depth_stencil_state(Some(&depth_stencil), stencil_ref);
        }
        self.dirty = LegacyDirty::empty();
    }

    // --- Draw / dispatch / clear ---

    pub fn draw(&mut self, primitive_type: PrimitiveType, start_vertex: u32, vertex_count: u32) {
        self.draw_instanced(primitive_type, start_vertex, vertex_count, 0, 1);
    }

    pub fn draw_instanced(
        &mut self,
        primitive_type: PrimitiveType,
        start_vertex: u32,
        vertex_count: u32,
        start_instance: u32,
        instance_count: u32,
    ) {
        self.commit_legacy_state();
        self.sink.emit(Command::Draw {
            primitive_type,
            start_vertex,
            vertex_count,
            start_instance,
            instance_count,
        });
    }

    pub fn draw_indexed(
        &mut self,
        primitive_type: PrimitiveType,
        start_index: u32,
        index_count: u32,
        base_vertex: i32,
    ) {
        self.draw_indexed_instanced(primitive_type, start_index, index_count, base_vertex, 0, 1);
    }

    pub fn draw_indexed_instanced(
        &mut self,
        primitive_type: PrimitiveType,
        start_index: u32,
        index_count: u32,
        base_vertex: i32,
        start_instance: u32,
        instance_count: u32,
    ) {
        self.commit_legacy_state();
        self.sink.emit(Command::DrawIndexed {
            primitive_type,
            start_index,
            index_count,
            base_vertex,
            start_instance,
            instance_count,
        });
    }

    pub fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        self.sink.emit(Command::Dispatch {
            group_count_x,
            group_count_y,
            group_count_z,
        });
    }

    pub fn clear(&mut self, flags: ClearFlags, color: ColorRgba, depth: f32, stencil: u32) {
        if flags.is_empty() {
            return;
        }
        if !(0.0..=1.0).contains(&depth) {
            warn!(depth, "clear depth outside [0, 1]");
        }
        self.sink.emit(Command::Clear {
            flags,
            color,
            depth,
            stencil,
        });
    }

    // --- Reset ---

    /// Returns every binding to its default and drops all held references.
    /// The reset notification reaches the backend before any destruction
    /// triggered by the dropped references.
    pub fn reset_state(&mut self) {
        self.sink.emit(Command::ResetState);
        self.state.reset();
        self.caches.clear();
        self.dirty = LegacyDirty::all();
    }
}

/// Replaces a contiguous slot range, acquiring each new reference before the
/// old one is released. Returns false when every slot already held the same
/// binding (nothing changed, nothing to emit).
fn replace_slot_range<T>(slots: &mut [Option<Arc<T>>], items: &[Option<Arc<T>>]) -> bool {
    let changed = slots
        .iter()
        .zip(items)
        .any(|(slot, item)| !option_arc_eq(slot, item.as_ref()));
    if !changed {
        return false;
    }
    for (slot, item) in slots.iter_mut().zip(items) {
        let old = mem::replace(slot, item.clone());
        drop(old);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_cmd::{RecordingSink, ResourceId, SinkEvent, ViewId};

    use crate::format::Format;
    use crate::resource::{AccessFlags, ResourceDesc, ViewDesc};

    struct Harness {
        sink: Arc<RecordingSink>,
        ids: Arc<IdAllocator>,
    }

    impl Harness {
        fn new() -> (Self, DeviceContext) {
            Self::with_caps(DeviceCaps::default())
        }

        fn with_caps(caps: DeviceCaps) -> (Self, DeviceContext) {
            let sink = Arc::new(RecordingSink::new());
            let ids = Arc::new(IdAllocator::default());
            let ctx = DeviceContext::new(sink.clone() as Arc<dyn CommandSink>, ids.clone(), caps);
            (Self { sink, ids }, ctx)
        }

        fn texture(&self, bind_flags: BindFlags) -> Arc<Resource> {
            let desc = ResourceDesc::texture_2d(Format::Rgba8Unorm, 256, 128, 1, bind_flags);
            Arc::new(Resource::new(
                ResourceId(self.ids.next()),
                desc,
                self.sink.clone() as Arc<dyn CommandSink>,
            ))
        }

        fn rtv(&self, resource: &Arc<Resource>) -> Arc<RenderTargetView> {
            Arc::new(RenderTargetView::new(
                ViewId(self.ids.next()),
                Arc::clone(resource),
                ViewDesc::whole(resource.desc().format),
            ))
        }

        fn srv(&self, resource: &Arc<Resource>) -> Arc<ShaderResourceView> {
            Arc::new(ShaderResourceView::new(
                ViewId(self.ids.next()),
                Arc::clone(resource),
                ViewDesc::whole(resource.desc().format),
            ))
        }

        fn uav(&self, resource: &Arc<Resource>) -> Arc<UnorderedAccessView> {
            Arc::new(UnorderedAccessView::new(
                ViewId(self.ids.next()),
                Arc::clone(resource),
                ViewDesc::whole(resource.desc().format),
            ))
        }

        fn take_all(&self) {
            let _ = self.sink.take();
        }

        fn commands(&self) -> Vec<Command> {
            self.sink
                .take()
                .into_iter()
                .filter_map(|e| match e {
                    SinkEvent::Command(c) => Some(c),
                    SinkEvent::Finish => None,
                })
                .collect()
        }
    }

    #[test]
    fn redundant_set_emits_nothing() {
        let (h, mut ctx) = Harness::new();
        let tex = h.texture(BindFlags::RENDER_TARGET);
        let rtv = h.rtv(&tex);

        ctx.set_render_target_view(0, Some(&rtv), false).unwrap();
        assert_eq!(h.commands().len(), 1);

        ctx.set_render_target_view(0, Some(&rtv), false).unwrap();
        assert!(h.commands().is_empty());
    }

    #[test]
    fn rebinding_does_not_drop_refcount_to_zero() {
        let (h, mut ctx) = Harness::new();
        let tex = h.texture(BindFlags::RENDER_TARGET);
        let a = h.rtv(&tex);
        let b = h.rtv(&tex);

        ctx.set_render_target_view(0, Some(&a), false).unwrap();
        let baseline = Arc::strong_count(&a);
        ctx.set_render_target_view(0, Some(&b), false).unwrap();
        assert_eq!(Arc::strong_count(&a), baseline - 1);
        assert_eq!(Arc::strong_count(&b), baseline);
        // Nothing was destroyed: no view dropped its last reference.
        assert!(!h
            .commands()
            .iter()
            .any(|c| matches!(c, Command::DestroyObject { .. })));
    }

    #[test]
    fn out_of_range_target_index_is_rejected_without_side_effects() {
        let (h, mut ctx) = Harness::new();
        let tex = h.texture(BindFlags::RENDER_TARGET);
        let rtv = h.rtv(&tex);
        let err = ctx.set_render_target_view(99, Some(&rtv), false);
        assert!(matches!(err, Err(DeviceError::InvalidIndex { .. })));
        assert!(h.commands().is_empty());
    }

    #[test]
    fn adapter_limits_cap_bind_indices() {
        let caps = DeviceCaps {
            feature_level: FeatureLevel::Level9_3,
            max_render_targets: 1,
            max_clip_planes: 2,
            ..DeviceCaps::default()
        };
        let (h, mut ctx) = Harness::with_caps(caps);

        let tex = h.texture(BindFlags::RENDER_TARGET);
        let rtv = h.rtv(&tex);
        // Index 1 is in the state array but beyond what the adapter exposes.
        assert!(matches!(
            ctx.set_render_target_view(1, Some(&rtv), false),
            Err(DeviceError::InvalidIndex { index: 1, limit: 1 })
        ));
        ctx.set_render_target_view(0, Some(&rtv), false).unwrap();

        assert!(matches!(
            ctx.set_clip_plane(2, Vec4::new(0.0, 1.0, 0.0, 0.0)),
            Err(DeviceError::InvalidIndex { index: 2, limit: 2 })
        ));
        ctx.set_clip_plane(1, Vec4::new(0.0, 1.0, 0.0, 0.0)).unwrap();
    }

    #[test]
    fn uav_binding_requires_level_11() {
        let caps = DeviceCaps {
            feature_level: FeatureLevel::Level10_1,
            ..DeviceCaps::default()
        };
        let (h, mut ctx) = Harness::with_caps(caps);
        let tex = h.texture(BindFlags::UNORDERED_ACCESS);
        let uav = h.uav(&tex);
        assert!(matches!(
            ctx.set_unordered_access_views(PipelineKind::Compute, 0, &[Some(uav.clone())]),
            Err(DeviceError::FeatureLevelTooLow { .. })
        ));
        assert!(h.commands().is_empty());

        let (h, mut ctx) = Harness::new();
        let tex = h.texture(BindFlags::UNORDERED_ACCESS);
        let uav = h.uav(&tex);
        ctx.set_unordered_access_views(PipelineKind::Compute, 0, &[Some(uav)])
            .unwrap();
        assert_eq!(h.commands().len(), 1);
    }

    #[test]
    fn missing_bind_flag_is_rejected() {
        let (h, mut ctx) = Harness::new();
        let tex = h.texture(BindFlags::SHADER_RESOURCE);
        let rtv = h.rtv(&tex);
        let err = ctx.set_render_target_view(0, Some(&rtv), false);
        assert!(matches!(err, Err(DeviceError::InvalidBindFlags { .. })));
        assert!(h.commands().is_empty());
    }

    #[test]
    fn binding_render_target_unbinds_aliasing_srv() {
        let (h, mut ctx) = Harness::new();
        let tex = h.texture(BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE);
        let rtv = h.rtv(&tex);
        let srv = h.srv(&tex);

        ctx.set_shader_resource_views(ShaderType::Pixel, 3, &[Some(srv.clone())])
            .unwrap();
        h.take_all();
        ctx.set_render_target_view(0, Some(&rtv), false).unwrap();

        let commands = h.commands();
        // The unbind precedes the bind in the stream.
        assert!(matches!(
            commands[0],
            Command::SetShaderResourceViews { ty: ShaderType::Pixel, start_idx: 3, .. }
        ));
        assert!(matches!(commands[1], Command::SetRenderTargetView { .. }));
        assert!(ctx.state().shader_resource_views[ShaderType::Pixel as usize][3].is_none());
    }

    #[test]
    fn primary_target_bind_resets_viewport_and_scissor() {
        let (h, mut ctx) = Harness::new();
        let tex = h.texture(BindFlags::RENDER_TARGET);
        let rtv = h.rtv(&tex);

        ctx.set_render_target_view(0, Some(&rtv), true).unwrap();
        let commands = h.commands();
        assert!(matches!(commands[0], Command::SetRenderTargetView { .. }));
        match &commands[1] {
            Command::SetViewports { viewports } => {
                assert_eq!(viewports.len(), 1);
                assert_eq!(viewports[0].width, 256.0);
                assert_eq!(viewports[0].height, 128.0);
            }
            other => panic!("expected viewport command, got {other:?}"),
        }
        match &commands[2] {
            Command::SetScissorRects { rects } => {
                assert_eq!(rects, &vec![Rect { left: 0, top: 0, right: 256, bottom: 128 }]);
            }
            other => panic!("expected scissor command, got {other:?}"),
        }
        assert_eq!(ctx.viewports().len(), 1);
    }

    #[test]
    fn stream_frequency_validation() {
        let (h, mut ctx) = Harness::new();
        assert!(matches!(
            ctx.set_stream_source_freq(0, 0),
            Err(DeviceError::InvalidStreamFrequency(0))
        ));
        assert!(matches!(
            ctx.set_stream_source_freq(
                0,
                STREAM_SOURCE_INDEXED_DATA | STREAM_SOURCE_INSTANCE_DATA | 1
            ),
            Err(DeviceError::InvalidStreamFrequency(_))
        ));
        ctx.set_stream_source_freq(1, STREAM_SOURCE_INSTANCE_DATA | 4)
            .unwrap();
        assert_eq!(h.commands().len(), 1);
    }

    #[test]
    fn instance_frequency_on_stream_zero_is_rejected() {
        let (h, mut ctx) = Harness::new();
        assert!(matches!(
            ctx.set_stream_source_freq(0, STREAM_SOURCE_INSTANCE_DATA | 2),
            Err(DeviceError::InvalidStreamFrequency(_))
        ));
        assert_eq!(ctx.state().streams[0].frequency, 1);
        assert!(h.commands().is_empty());

        // Indexed data on stream 0 is the instancing convention and stays
        // legal.
        ctx.set_stream_source_freq(0, STREAM_SOURCE_INDEXED_DATA | 2)
            .unwrap();
        assert_eq!(h.commands().len(), 1);
    }

    #[test]
    fn draw_commits_legacy_state_and_dedups_composites() {
        let (h, mut ctx) = Harness::new();
        ctx.draw(PrimitiveType::TriangleList, 0, 3);
        let first = h.commands();
        // First draw binds the three freshly built composite objects.
        assert_eq!(
            first
                .iter()
                .filter(|c| matches!(
                    c,
                    Command::SetBlendState { .. }
                        | Command::SetRasterizerState { .. }
                        | Command::SetDepthStencilState { .. }
                ))
                .count(),
            3
        );

        // A state write that lands on the same composite descriptor must not
        // rebind anything.
        ctx.set_render_state(RenderState::CullMode, 2);
        ctx.set_render_state(RenderState::CullMode, 3);
        ctx.draw(PrimitiveType::TriangleList, 0, 3);
        let second = h.commands();
        assert!(second
            .iter()
            .all(|c| !matches!(c, Command::SetBlendState { .. }
                | Command::SetDepthStencilState { .. })));
        assert!(second
            .iter()
            .all(|c| !matches!(c, Command::SetRasterizerState { .. })));
    }

    #[test]
    fn shader_stage_mismatch_is_rejected() {
        let (h, mut ctx) = Harness::new();
        let shader = Arc::new(Shader::new(
            opal_cmd::ShaderId(1),
            ShaderType::Pixel,
            h.sink.clone() as Arc<dyn CommandSink>,
        ));
        assert!(matches!(
            ctx.set_shader(ShaderType::Vertex, Some(&shader)),
            Err(DeviceError::ShaderStageMismatch { .. })
        ));
        assert!(h.commands().is_empty());
    }

    #[test]
    fn enabling_unset_light_emits_set_light_first() {
        let (h, mut ctx) = Harness::new();
        ctx.set_light_enable(5, true);
        let commands = h.commands();
        assert!(matches!(commands[0], Command::SetLight { index: 5, .. }));
        assert!(matches!(
            commands[1],
            Command::SetLightEnable {
                index: 5,
                enable: true
            }
        ));

        // Toggling to the current value is a no-op.
        ctx.set_light_enable(5, true);
        assert!(h.commands().is_empty());
    }
}
