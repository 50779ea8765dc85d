//! The full bindable-state snapshot.
//!
//! One `State` exists per device context (and per recorded stateblock).
//! Every pointer-valued slot owns its object through an `Arc`; replacing a
//! slot must acquire the new reference before the old one is released (the
//! context mutators uphold this).

use std::array;
use std::sync::Arc;

use glam::{Mat4, Vec4};
use opal_cmd::{
    ColorRgba, IndexFormat, Material, PipelineKind, Rect, RenderState, ShaderType, Viewport,
    RENDER_STATE_COUNT, SAMPLER_STATE_COUNT, TEXTURE_STAGE_STATE_COUNT, TRANSFORM_COUNT,
};

use crate::light::LightMap;
use crate::resource::{
    Query, RenderTargetView, Resource, Sampler, Shader, ShaderResourceView, UnorderedAccessView,
    VertexDeclaration,
};
use crate::state_object::{BlendState, DepthStencilState, RasterizerState};

pub const MAX_RENDER_TARGETS: usize = 8;
pub const MAX_VIEWPORTS: usize = 16;
pub const MAX_STREAMS: usize = 16;
pub const MAX_CONSTANT_BUFFERS: usize = 15;
pub const MAX_SAMPLERS_PER_STAGE: usize = 16;
pub const MAX_SHADER_RESOURCE_VIEWS: usize = 128;
pub const MAX_UNORDERED_ACCESS_VIEWS: usize = 8;
pub const MAX_CLIP_PLANES: usize = 8;
pub const MAX_TEXTURE_STAGES: usize = 8;
pub const MAX_STREAM_OUTPUTS: usize = 4;

pub use crate::light::MAX_ACTIVE_LIGHTS;

// Legacy render-state value enums (D3D numbering), used by the composite
// state translation and the software vertex pipeline.

/// `ZEnable` values. `UseW` is accepted but degrades to a standard depth
/// test (W-buffers are unsupported distinctly).
pub const ZB_FALSE: u32 = 0;
pub const ZB_TRUE: u32 = 1;
pub const ZB_USE_W: u32 = 2;

/// `DiffuseMaterialSource` and friends.
pub const MCS_MATERIAL: u32 = 0;
pub const MCS_COLOR1: u32 = 1;
pub const MCS_COLOR2: u32 = 2;

/// `FogVertexMode` / `FogTableMode` values.
pub const FOG_NONE: u32 = 0;
pub const FOG_EXP: u32 = 1;
pub const FOG_EXP2: u32 = 2;
pub const FOG_LINEAR: u32 = 3;

#[derive(Clone, Debug, Default)]
pub struct StreamSource {
    pub buffer: Option<Arc<Resource>>,
    pub offset: u32,
    pub stride: u32,
    /// Raw frequency value including the indexed/instance marker bits.
    pub frequency: u32,
}

#[derive(Clone, Debug)]
pub struct IndexBufferBinding {
    pub buffer: Arc<Resource>,
    pub format: IndexFormat,
    pub offset: u32,
}

#[derive(Clone, Debug, Default)]
pub struct StreamOutput {
    pub buffer: Option<Arc<Resource>>,
    pub offset: u32,
}

#[derive(Clone, Debug, Default)]
pub struct Framebuffer {
    pub render_targets: [Option<Arc<RenderTargetView>>; MAX_RENDER_TARGETS],
    pub depth_stencil: Option<Arc<RenderTargetView>>,
}

#[derive(Clone, Debug)]
pub struct State {
    pub fb: Framebuffer,
    pub shaders: [Option<Arc<Shader>>; ShaderType::COUNT],
    pub constant_buffers: [[Option<Arc<Resource>>; MAX_CONSTANT_BUFFERS]; ShaderType::COUNT],
    pub samplers: [[Option<Arc<Sampler>>; MAX_SAMPLERS_PER_STAGE]; ShaderType::COUNT],
    pub shader_resource_views:
        [[Option<Arc<ShaderResourceView>>; MAX_SHADER_RESOURCE_VIEWS]; ShaderType::COUNT],
    pub unordered_access_views:
        [[Option<Arc<UnorderedAccessView>>; MAX_UNORDERED_ACCESS_VIEWS]; PipelineKind::COUNT],

    pub streams: [StreamSource; MAX_STREAMS],
    pub index_buffer: Option<IndexBufferBinding>,
    pub vertex_declaration: Option<Arc<VertexDeclaration>>,
    pub stream_outputs: [StreamOutput; MAX_STREAM_OUTPUTS],

    pub blend_state: Option<Arc<BlendState>>,
    pub blend_factor: ColorRgba,
    pub sample_mask: u32,
    pub rasterizer_state: Option<Arc<RasterizerState>>,
    pub depth_stencil_state: Option<Arc<DepthStencilState>>,
    pub stencil_ref: u32,

    pub viewports: [Viewport; MAX_VIEWPORTS],
    pub viewport_count: usize,
    pub scissor_rects: [Rect; MAX_VIEWPORTS],
    pub scissor_rect_count: usize,

    pub predicate: Option<Arc<Query>>,
    pub predicate_value: bool,

    pub render_states: [u32; RENDER_STATE_COUNT],
    pub sampler_states: [[u32; SAMPLER_STATE_COUNT]; MAX_SAMPLERS_PER_STAGE],
    pub texture_stage_states: [[u32; TEXTURE_STAGE_STATE_COUNT]; MAX_TEXTURE_STAGES],
    pub textures: [Option<Arc<Resource>>; MAX_TEXTURE_STAGES],
    pub transforms: [Mat4; TRANSFORM_COUNT],
    pub clip_planes: [Vec4; MAX_CLIP_PLANES],
    pub material: Material,
    pub lights: LightMap,
}

impl Default for State {
    fn default() -> Self {
        Self {
            fb: Framebuffer::default(),
            shaders: array::from_fn(|_| None),
            constant_buffers: array::from_fn(|_| array::from_fn(|_| None)),
            samplers: array::from_fn(|_| array::from_fn(|_| None)),
            shader_resource_views: array::from_fn(|_| array::from_fn(|_| None)),
            unordered_access_views: array::from_fn(|_| array::from_fn(|_| None)),
            streams: array::from_fn(|_| StreamSource {
                frequency: 1,
                ..StreamSource::default()
            }),
            index_buffer: None,
            vertex_declaration: None,
            stream_outputs: array::from_fn(|_| StreamOutput::default()),
            blend_state: None,
            blend_factor: ColorRgba::WHITE,
            sample_mask: u32::MAX,
            rasterizer_state: None,
            depth_stencil_state: None,
            stencil_ref: 0,
            viewports: [Viewport::default(); MAX_VIEWPORTS],
            viewport_count: 1,
            scissor_rects: [Rect::default(); MAX_VIEWPORTS],
            scissor_rect_count: 1,
            predicate: None,
            predicate_value: false,
            render_states: default_render_states(),
            sampler_states: [default_sampler_states(); MAX_SAMPLERS_PER_STAGE],
            texture_stage_states: default_texture_stage_states(),
            textures: array::from_fn(|_| None),
            transforms: [Mat4::IDENTITY; TRANSFORM_COUNT],
            clip_planes: [Vec4::ZERO; MAX_CLIP_PLANES],
            material: Material::default(),
            lights: LightMap::default(),
        }
    }
}

impl State {
    pub fn render_state(&self, state: RenderState) -> u32 {
        self.render_states[state as usize]
    }

    /// Float-valued render states store the f32 bit pattern.
    pub fn render_state_f32(&self, state: RenderState) -> f32 {
        f32::from_bits(self.render_states[state as usize])
    }

    pub fn render_state_bool(&self, state: RenderState) -> bool {
        self.render_states[state as usize] != 0
    }

    /// Drops every bound object and restores defaults.
    pub fn reset(&mut self) {
        *self = State::default();
    }
}

fn default_render_states() -> [u32; RENDER_STATE_COUNT] {
    use RenderState as RS;
    let mut rs = [0u32; RENDER_STATE_COUNT];
    let set = |rs: &mut [u32; RENDER_STATE_COUNT], state: RS, value: u32| {
        rs[state as usize] = value;
    };
    set(&mut rs, RS::ZEnable, ZB_FALSE);
    set(&mut rs, RS::FillMode, 3); // solid
    set(&mut rs, RS::ShadeMode, 2); // gouraud
    set(&mut rs, RS::ZWriteEnable, 1);
    set(&mut rs, RS::SrcBlend, 2); // one
    set(&mut rs, RS::DestBlend, 1); // zero
    set(&mut rs, RS::CullMode, 3); // ccw
    set(&mut rs, RS::ZFunc, 4); // less-equal
    set(&mut rs, RS::FogStart, 0f32.to_bits());
    set(&mut rs, RS::FogEnd, 1f32.to_bits());
    set(&mut rs, RS::FogDensity, 1f32.to_bits());
    set(&mut rs, RS::StencilFail, 1); // keep
    set(&mut rs, RS::StencilZFail, 1);
    set(&mut rs, RS::StencilPass, 1);
    set(&mut rs, RS::StencilFunc, 8); // always
    set(&mut rs, RS::StencilMask, u32::MAX);
    set(&mut rs, RS::StencilWriteMask, u32::MAX);
    set(&mut rs, RS::TextureFactor, u32::MAX);
    set(&mut rs, RS::Clipping, 1);
    set(&mut rs, RS::Lighting, 1);
    set(&mut rs, RS::ColorVertex, 1);
    set(&mut rs, RS::LocalViewer, 1);
    set(&mut rs, RS::DiffuseMaterialSource, MCS_COLOR1);
    set(&mut rs, RS::SpecularMaterialSource, MCS_COLOR2);
    set(&mut rs, RS::AmbientMaterialSource, MCS_MATERIAL);
    set(&mut rs, RS::EmissiveMaterialSource, MCS_MATERIAL);
    set(&mut rs, RS::PointSize, 1f32.to_bits());
    set(&mut rs, RS::MultisampleAntialias, 1);
    set(&mut rs, RS::MultisampleMask, u32::MAX);
    set(&mut rs, RS::ColorWriteEnable, 0xf);
    set(&mut rs, RS::BlendOp, 1); // add
    set(&mut rs, RS::CcwStencilFail, 1);
    set(&mut rs, RS::CcwStencilZFail, 1);
    set(&mut rs, RS::CcwStencilPass, 1);
    set(&mut rs, RS::CcwStencilFunc, 8);
    set(&mut rs, RS::ColorWriteEnable1, 0xf);
    set(&mut rs, RS::ColorWriteEnable2, 0xf);
    set(&mut rs, RS::ColorWriteEnable3, 0xf);
    set(&mut rs, RS::BlendFactor, u32::MAX);
    set(&mut rs, RS::SrcBlendAlpha, 2);
    set(&mut rs, RS::DestBlendAlpha, 1);
    set(&mut rs, RS::BlendOpAlpha, 1);
    rs
}

fn default_sampler_states() -> [u32; SAMPLER_STATE_COUNT] {
    use opal_cmd::SamplerStateKind as SS;
    let mut ss = [0u32; SAMPLER_STATE_COUNT];
    ss[SS::AddressU as usize] = 1; // wrap
    ss[SS::AddressV as usize] = 1;
    ss[SS::AddressW as usize] = 1;
    ss[SS::MagFilter as usize] = 1; // point
    ss[SS::MinFilter as usize] = 1;
    ss[SS::MipFilter as usize] = 0; // none
    ss[SS::MaxAnisotropy as usize] = 1;
    ss
}

fn default_texture_stage_states(
) -> [[u32; TEXTURE_STAGE_STATE_COUNT]; MAX_TEXTURE_STAGES] {
    use opal_cmd::TextureStageStateKind as TSS;
    let mut stages = [[0u32; TEXTURE_STAGE_STATE_COUNT]; MAX_TEXTURE_STAGES];
    for (i, stage) in stages.iter_mut().enumerate() {
        // Stage 0 modulates, the rest are disabled; standard legacy cascade.
        stage[TSS::ColorOp as usize] = if i == 0 { 4 } else { 1 }; // modulate / disable
        stage[TSS::ColorArg1 as usize] = 2; // texture
        stage[TSS::ColorArg2 as usize] = 0; // current
        stage[TSS::AlphaOp as usize] = if i == 0 { 2 } else { 1 }; // select-arg1 / disable
        stage[TSS::AlphaArg1 as usize] = 2;
        stage[TSS::AlphaArg2 as usize] = 0;
        stage[TSS::TexCoordIndex as usize] = i as u32;
    }
    stages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_matches_legacy_defaults() {
        let state = State::default();
        assert!(state.render_state_bool(RenderState::Lighting));
        assert!(!state.render_state_bool(RenderState::FogEnable));
        assert_eq!(state.render_state(RenderState::CullMode), 3);
        assert_eq!(state.render_state_f32(RenderState::FogEnd), 1.0);
        assert_eq!(state.render_state(RenderState::ColorWriteEnable), 0xf);
        assert_eq!(state.viewport_count, 1);
        assert_eq!(state.streams[0].frequency, 1);
        assert_eq!(state.sample_mask, u32::MAX);
        assert!(state.fb.render_targets.iter().all(|rt| rt.is_none()));
        assert_eq!(state.transforms[0], Mat4::IDENTITY);
    }
}
