//! Recorded state snapshots (stateblocks).
//!
//! A stateblock pairs a mask of saved slots with a captured [`State`].
//! Captured bindings are held by reference, so objects in a stateblock stay
//! alive until the block is dropped. Applying a block replays the marked
//! slots through the context, which re-runs the usual change detection; an
//! apply over identical state emits nothing.

use std::collections::BTreeSet;
use std::sync::Arc;

use glam::{Mat4, Vec4};
use opal_cmd::{
    IndexFormat, LightParams, Material, Rect, RenderState, SamplerStateKind, ShaderType,
    TextureStageStateKind, TransformState, Viewport, RENDER_STATE_COUNT, SAMPLER_STATE_COUNT,
    TEXTURE_STAGE_STATE_COUNT, TRANSFORM_COUNT,
};

use crate::context::DeviceContext;
use crate::error::DeviceError;
use crate::resource::{Resource, Shader, VertexDeclaration};
use crate::state::{
    IndexBufferBinding, State, MAX_CLIP_PLANES, MAX_SAMPLERS_PER_STAGE, MAX_STREAMS,
    MAX_TEXTURE_STAGES,
};

/// Predefined save-mask classes, mirroring the legacy API's block types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateblockType {
    All,
    VertexState,
    PixelState,
}

/// Render states belonging to the vertex-processing half of the pipeline.
const RENDER_STATES_VERTEX: &[RenderState] = &[
    RenderState::ShadeMode,
    RenderState::CullMode,
    RenderState::FogEnable,
    RenderState::SpecularEnable,
    RenderState::FogColor,
    RenderState::FogStart,
    RenderState::FogEnd,
    RenderState::FogDensity,
    RenderState::RangeFogEnable,
    RenderState::Clipping,
    RenderState::Lighting,
    RenderState::Ambient,
    RenderState::FogVertexMode,
    RenderState::ColorVertex,
    RenderState::LocalViewer,
    RenderState::NormalizeNormals,
    RenderState::DiffuseMaterialSource,
    RenderState::SpecularMaterialSource,
    RenderState::AmbientMaterialSource,
    RenderState::EmissiveMaterialSource,
    RenderState::VertexBlend,
    RenderState::ClipPlaneEnable,
    RenderState::PointSize,
];

/// Render states belonging to the pixel-processing half of the pipeline.
const RENDER_STATES_PIXEL: &[RenderState] = &[
    RenderState::ZEnable,
    RenderState::FillMode,
    RenderState::ZWriteEnable,
    RenderState::AlphaTestEnable,
    RenderState::SrcBlend,
    RenderState::DestBlend,
    RenderState::ZFunc,
    RenderState::AlphaBlendEnable,
    RenderState::FogTableMode,
    RenderState::StencilEnable,
    RenderState::StencilFail,
    RenderState::StencilZFail,
    RenderState::StencilPass,
    RenderState::StencilFunc,
    RenderState::StencilRef,
    RenderState::StencilMask,
    RenderState::StencilWriteMask,
    RenderState::TextureFactor,
    RenderState::MultisampleAntialias,
    RenderState::MultisampleMask,
    RenderState::ColorWriteEnable,
    RenderState::BlendOp,
    RenderState::ScissorTestEnable,
    RenderState::SlopeScaleDepthBias,
    RenderState::AntialiasedLineEnable,
    RenderState::TwoSidedStencilMode,
    RenderState::CcwStencilFail,
    RenderState::CcwStencilZFail,
    RenderState::CcwStencilPass,
    RenderState::CcwStencilFunc,
    RenderState::ColorWriteEnable1,
    RenderState::ColorWriteEnable2,
    RenderState::ColorWriteEnable3,
    RenderState::BlendFactor,
    RenderState::SrgbWriteEnable,
    RenderState::DepthBias,
    RenderState::SeparateAlphaBlendEnable,
    RenderState::SrcBlendAlpha,
    RenderState::DestBlendAlpha,
    RenderState::BlendOpAlpha,
];

/// Which slots a stateblock saves. One flag per slot, mirroring the layout
/// of [`State`].
#[derive(Clone, Debug)]
pub struct SavedStates {
    pub render_states: [bool; RENDER_STATE_COUNT],
    pub sampler_states: [[bool; SAMPLER_STATE_COUNT]; MAX_SAMPLERS_PER_STAGE],
    pub texture_stage_states: [[bool; TEXTURE_STAGE_STATE_COUNT]; MAX_TEXTURE_STAGES],
    pub textures: [bool; MAX_TEXTURE_STAGES],
    pub transforms: [bool; TRANSFORM_COUNT],
    pub clip_planes: [bool; MAX_CLIP_PLANES],
    pub streams: [bool; MAX_STREAMS],
    pub shaders: [bool; ShaderType::COUNT],
    pub material: bool,
    pub index_buffer: bool,
    pub vertex_declaration: bool,
    pub viewports: bool,
    pub scissor_rects: bool,
    /// Save every light that exists at capture time.
    pub all_lights: bool,
    /// Individually recorded light indices.
    pub lights: BTreeSet<u32>,
}

impl Default for SavedStates {
    fn default() -> Self {
        Self {
            render_states: [false; RENDER_STATE_COUNT],
            sampler_states: [[false; SAMPLER_STATE_COUNT]; MAX_SAMPLERS_PER_STAGE],
            texture_stage_states: [[false; TEXTURE_STAGE_STATE_COUNT]; MAX_TEXTURE_STAGES],
            textures: [false; MAX_TEXTURE_STAGES],
            transforms: [false; TRANSFORM_COUNT],
            clip_planes: [false; MAX_CLIP_PLANES],
            streams: [false; MAX_STREAMS],
            shaders: [false; ShaderType::COUNT],
            material: false,
            index_buffer: false,
            vertex_declaration: false,
            viewports: false,
            scissor_rects: false,
            all_lights: false,
            lights: BTreeSet::new(),
        }
    }
}

impl SavedStates {
    fn all() -> Self {
        let mut saved = Self {
            render_states: [false; RENDER_STATE_COUNT],
            sampler_states: [[true; SAMPLER_STATE_COUNT]; MAX_SAMPLERS_PER_STAGE],
            texture_stage_states: [[true; TEXTURE_STAGE_STATE_COUNT]; MAX_TEXTURE_STAGES],
            textures: [true; MAX_TEXTURE_STAGES],
            transforms: [true; TRANSFORM_COUNT],
            clip_planes: [true; MAX_CLIP_PLANES],
            streams: [true; MAX_STREAMS],
            shaders: [true; ShaderType::COUNT],
            material: true,
            index_buffer: true,
            vertex_declaration: true,
            viewports: true,
            scissor_rects: true,
            all_lights: true,
            lights: BTreeSet::new(),
        };
        // Only states with a defined id exist in the sparse numbering.
        for &rs in RenderState::ALL {
            saved.render_states[rs as usize] = true;
        }
        saved
    }

    fn vertex() -> Self {
        let mut saved = Self::default();
        for &rs in RENDER_STATES_VERTEX {
            saved.render_states[rs as usize] = true;
        }
        saved.transforms = [true; TRANSFORM_COUNT];
        saved.clip_planes = [true; MAX_CLIP_PLANES];
        saved.streams = [true; MAX_STREAMS];
        saved.shaders[ShaderType::Vertex as usize] = true;
        saved.vertex_declaration = true;
        saved.material = true;
        saved.all_lights = true;
        saved
    }

    fn pixel() -> Self {
        let mut saved = Self::default();
        for &rs in RENDER_STATES_PIXEL {
            saved.render_states[rs as usize] = true;
        }
        saved.sampler_states = [[true; SAMPLER_STATE_COUNT]; MAX_SAMPLERS_PER_STAGE];
        saved.texture_stage_states = [[true; TEXTURE_STAGE_STATE_COUNT]; MAX_TEXTURE_STAGES];
        saved.textures = [true; MAX_TEXTURE_STAGES];
        saved.shaders[ShaderType::Pixel as usize] = true;
        saved
    }
}

#[derive(Clone, Debug)]
pub struct Stateblock {
    saved: SavedStates,
    state: State,
}

impl Stateblock {
    /// A block with the predefined mask for `ty`, capturing the current
    /// values immediately.
    pub fn capture_from(ty: StateblockType, from: &State) -> Self {
        let saved = match ty {
            StateblockType::All => SavedStates::all(),
            StateblockType::VertexState => SavedStates::vertex(),
            StateblockType::PixelState => SavedStates::pixel(),
        };
        let mut block = Self {
            saved,
            state: State::default(),
        };
        block.capture(from);
        block
    }

    /// An empty block that accumulates marks through the `record_*` setters.
    pub fn recording() -> Self {
        Self {
            saved: SavedStates::default(),
            state: State::default(),
        }
    }

    pub fn saved(&self) -> &SavedStates {
        &self.saved
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    // --- Recording ---

    pub fn record_render_state(&mut self, state: RenderState, value: u32) {
        self.saved.render_states[state as usize] = true;
        self.state.render_states[state as usize] = value;
    }

    pub fn record_sampler_state(&mut self, sampler: u32, state: SamplerStateKind, value: u32) {
        if let Some(states) = self.state.sampler_states.get_mut(sampler as usize) {
            self.saved.sampler_states[sampler as usize][state as usize] = true;
            states[state as usize] = value;
        }
    }

    pub fn record_texture_stage_state(
        &mut self,
        stage: u32,
        state: TextureStageStateKind,
        value: u32,
    ) {
        if let Some(states) = self.state.texture_stage_states.get_mut(stage as usize) {
            self.saved.texture_stage_states[stage as usize][state as usize] = true;
            states[state as usize] = value;
        }
    }

    pub fn record_texture(&mut self, stage: u32, texture: Option<Arc<Resource>>) {
        if let Some(slot) = self.state.textures.get_mut(stage as usize) {
            self.saved.textures[stage as usize] = true;
            *slot = texture;
        }
    }

    pub fn record_transform(&mut self, state: TransformState, matrix: Mat4) {
        if let Some(index) = state.index() {
            self.saved.transforms[index] = true;
            self.state.transforms[index] = matrix;
        }
    }

    pub fn record_clip_plane(&mut self, index: u32, plane: Vec4) {
        if let Some(slot) = self.state.clip_planes.get_mut(index as usize) {
            self.saved.clip_planes[index as usize] = true;
            *slot = plane;
        }
    }

    pub fn record_material(&mut self, material: &Material) {
        self.saved.material = true;
        self.state.material = *material;
    }

    pub fn record_light(&mut self, index: u32, params: &LightParams) {
        self.saved.lights.insert(index);
        self.state.lights.set(index, *params);
    }

    pub fn record_light_enable(&mut self, index: u32, enable: bool) {
        self.saved.lights.insert(index);
        self.state.lights.set_enable(index, enable);
    }

    pub fn record_stream_source(
        &mut self,
        stream: u32,
        buffer: Option<Arc<Resource>>,
        offset: u32,
        stride: u32,
    ) {
        if let Some(slot) = self.state.streams.get_mut(stream as usize) {
            self.saved.streams[stream as usize] = true;
            slot.buffer = buffer;
            slot.offset = offset;
            slot.stride = stride;
        }
    }

    pub fn record_index_buffer(
        &mut self,
        buffer: Option<Arc<Resource>>,
        format: IndexFormat,
        offset: u32,
    ) {
        self.saved.index_buffer = true;
        self.state.index_buffer = buffer.map(|buffer| IndexBufferBinding {
            buffer,
            format,
            offset,
        });
    }

    pub fn record_shader(&mut self, ty: ShaderType, shader: Option<Arc<Shader>>) {
        self.saved.shaders[ty as usize] = true;
        self.state.shaders[ty as usize] = shader;
    }

    pub fn record_vertex_declaration(&mut self, declaration: Option<Arc<VertexDeclaration>>) {
        self.saved.vertex_declaration = true;
        self.state.vertex_declaration = declaration;
    }

    pub fn record_viewports(&mut self, viewports: &[Viewport]) {
        let count = viewports.len().min(self.state.viewports.len());
        self.saved.viewports = true;
        self.state.viewports[..count].copy_from_slice(&viewports[..count]);
        self.state.viewport_count = count;
    }

    pub fn record_scissor_rects(&mut self, rects: &[Rect]) {
        let count = rects.len().min(self.state.scissor_rects.len());
        self.saved.scissor_rects = true;
        self.state.scissor_rects[..count].copy_from_slice(&rects[..count]);
        self.state.scissor_rect_count = count;
    }

    // --- Capture ---

    /// Refreshes every marked slot from `from`, keeping the mask unchanged.
    pub fn capture(&mut self, from: &State) {
        for (index, saved) in self.saved.render_states.iter().enumerate() {
            if *saved {
                self.state.render_states[index] = from.render_states[index];
            }
        }
        for (sampler, mask) in self.saved.sampler_states.iter().enumerate() {
            for (index, saved) in mask.iter().enumerate() {
                if *saved {
                    self.state.sampler_states[sampler][index] =
                        from.sampler_states[sampler][index];
                }
            }
        }
        for (stage, mask) in self.saved.texture_stage_states.iter().enumerate() {
            for (index, saved) in mask.iter().enumerate() {
                if *saved {
                    self.state.texture_stage_states[stage][index] =
                        from.texture_stage_states[stage][index];
                }
            }
        }
        for (stage, saved) in self.saved.textures.iter().enumerate() {
            if *saved {
                self.state.textures[stage] = from.textures[stage].clone();
            }
        }
        for (index, saved) in self.saved.transforms.iter().enumerate() {
            if *saved {
                self.state.transforms[index] = from.transforms[index];
            }
        }
        for (index, saved) in self.saved.clip_planes.iter().enumerate() {
            if *saved {
                self.state.clip_planes[index] = from.clip_planes[index];
            }
        }
        for (stream, saved) in self.saved.streams.iter().enumerate() {
            if *saved {
                self.state.streams[stream] = from.streams[stream].clone();
            }
        }
        for (index, saved) in self.saved.shaders.iter().enumerate() {
            if *saved {
                self.state.shaders[index] = from.shaders[index].clone();
            }
        }
        if self.saved.material {
            self.state.material = from.material;
        }
        if self.saved.index_buffer {
            self.state.index_buffer = from.index_buffer.clone();
        }
        if self.saved.vertex_declaration {
            self.state.vertex_declaration = from.vertex_declaration.clone();
        }
        if self.saved.viewports {
            self.state.viewports = from.viewports;
            self.state.viewport_count = from.viewport_count;
        }
        if self.saved.scissor_rects {
            self.state.scissor_rects = from.scissor_rects;
            self.state.scissor_rect_count = from.scissor_rect_count;
        }
        if self.saved.all_lights {
            self.state.lights = from.lights.clone();
        } else {
            for &index in &self.saved.lights {
                if let Some(entry) = from.lights.get(index) {
                    self.state.lights.set(index, entry.params);
                    self.state.lights.set_enable(index, entry.enabled);
                }
            }
        }
    }

    // --- Apply ---

    /// Replays every marked slot through the context. Slots whose captured
    /// value matches the live state pass through the context's change
    /// detection and emit nothing.
    pub fn apply(&self, ctx: &mut DeviceContext) -> Result<(), DeviceError> {
        for (index, saved) in self.saved.render_states.iter().enumerate() {
            if *saved {
                if let Some(&rs) = RenderState::ALL.iter().find(|rs| **rs as usize == index) {
                    ctx.set_render_state(rs, self.state.render_states[index]);
                }
            }
        }
        for (sampler, mask) in self.saved.sampler_states.iter().enumerate() {
            for &kind in SamplerStateKind::ALL {
                if mask[kind as usize] {
                    ctx.set_sampler_state(
                        sampler as u32,
                        kind,
                        self.state.sampler_states[sampler][kind as usize],
                    )?;
                }
            }
        }
        for (stage, mask) in self.saved.texture_stage_states.iter().enumerate() {
            for &kind in TextureStageStateKind::ALL {
                if mask[kind as usize] {
                    ctx.set_texture_stage_state(
                        stage as u32,
                        kind,
                        self.state.texture_stage_states[stage][kind as usize],
                    )?;
                }
            }
        }
        for (stage, saved) in self.saved.textures.iter().enumerate() {
            if *saved {
                ctx.set_texture(stage as u32, self.state.textures[stage].as_ref())?;
            }
        }
        for transform in transform_slots() {
            if let Some(index) = transform.index() {
                if self.saved.transforms[index] {
                    ctx.set_transform(transform, self.state.transforms[index])?;
                }
            }
        }
        for (index, saved) in self.saved.clip_planes.iter().enumerate() {
            if *saved {
                ctx.set_clip_plane(index as u32, self.state.clip_planes[index])?;
            }
        }
        for (stream, saved) in self.saved.streams.iter().enumerate() {
            if *saved {
                let source = &self.state.streams[stream];
                ctx.set_stream_source(
                    stream as u32,
                    source.buffer.as_ref(),
                    source.offset,
                    source.stride,
                )?;
                ctx.set_stream_source_freq(stream as u32, source.frequency)?;
            }
        }
        for ty in ShaderType::ALL {
            if self.saved.shaders[ty as usize] {
                ctx.set_shader(ty, self.state.shaders[ty as usize].as_ref())?;
            }
        }
        if self.saved.material {
            ctx.set_material(&self.state.material);
        }
        if self.saved.index_buffer {
            match &self.state.index_buffer {
                Some(binding) => {
                    ctx.set_index_buffer(Some(&binding.buffer), binding.format, binding.offset)?
                }
                None => ctx.set_index_buffer(None, IndexFormat::Uint16, 0)?,
            }
        }
        if self.saved.vertex_declaration {
            ctx.set_vertex_declaration(self.state.vertex_declaration.as_ref());
        }
        if self.saved.viewports {
            let viewports = self.state.viewports[..self.state.viewport_count].to_vec();
            ctx.set_viewports(&viewports)?;
        }
        if self.saved.scissor_rects {
            let rects = self.state.scissor_rects[..self.state.scissor_rect_count].to_vec();
            ctx.set_scissor_rects(&rects)?;
        }
        if self.saved.all_lights {
            for (index, entry) in self.state.lights.iter() {
                ctx.set_light(index, &entry.params)?;
                ctx.set_light_enable(index, entry.enabled);
            }
        } else {
            for &index in &self.saved.lights {
                if let Some(entry) = self.state.lights.get(index) {
                    let (params, enabled) = (entry.params, entry.enabled);
                    ctx.set_light(index, &params)?;
                    ctx.set_light_enable(index, enabled);
                }
            }
        }
        Ok(())
    }
}

/// Every addressable transform slot, in storage order.
fn transform_slots() -> impl Iterator<Item = TransformState> {
    [TransformState::View, TransformState::Projection]
        .into_iter()
        .chain((0..8).map(TransformState::Texture))
        .chain((0..4).map(TransformState::World))
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use opal_cmd::LightType;

    fn state_with_changes() -> State {
        let mut state = State::default();
        state.render_states[RenderState::Lighting as usize] = 0;
        state.render_states[RenderState::ZEnable as usize] = 1;
        state.transforms[0] = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        state.lights.set(
            2,
            LightParams {
                light_type: LightType::Point,
                position: Vec3::new(1.0, 0.0, 0.0),
                range: 10.0,
                ..Default::default()
            },
        );
        state.lights.set_enable(2, true);
        state
    }

    #[test]
    fn all_block_captures_everything_marked() {
        let from = state_with_changes();
        let block = Stateblock::capture_from(StateblockType::All, &from);
        assert_eq!(
            block.state().render_states[RenderState::Lighting as usize],
            0
        );
        assert_eq!(block.state().transforms[0], from.transforms[0]);
        assert!(block.state().lights.is_enabled(2));
    }

    #[test]
    fn vertex_block_skips_pixel_states() {
        let from = state_with_changes();
        let block = Stateblock::capture_from(StateblockType::VertexState, &from);
        // Lighting is vertex state, ZEnable is pixel state.
        assert!(block.saved().render_states[RenderState::Lighting as usize]);
        assert!(!block.saved().render_states[RenderState::ZEnable as usize]);
        assert_eq!(
            block.state().render_states[RenderState::ZEnable as usize],
            State::default().render_states[RenderState::ZEnable as usize]
        );
    }

    #[test]
    fn recording_marks_only_touched_slots() {
        let mut block = Stateblock::recording();
        block.record_render_state(RenderState::CullMode, 1);
        block.record_transform(TransformState::View, Mat4::IDENTITY);
        assert!(block.saved().render_states[RenderState::CullMode as usize]);
        assert!(!block.saved().render_states[RenderState::ZEnable as usize]);
        assert!(block.saved().transforms[0]);
        assert!(!block.saved().material);
    }

    #[test]
    fn recapture_refreshes_marked_slots_only() {
        let mut block = Stateblock::recording();
        block.record_render_state(RenderState::CullMode, 1);

        let mut from = State::default();
        from.render_states[RenderState::CullMode as usize] = 2;
        from.render_states[RenderState::ZEnable as usize] = 1;
        block.capture(&from);

        assert_eq!(block.state().render_states[RenderState::CullMode as usize], 2);
        // Unmarked slots keep their defaults.
        assert_eq!(
            block.state().render_states[RenderState::ZEnable as usize],
            State::default().render_states[RenderState::ZEnable as usize]
        );
    }
}
