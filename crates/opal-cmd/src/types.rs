//! Wire-visible types shared by the command stream and the device core.
//!
//! Everything here is plain data: commands reference objects through
//! lightweight id newtypes and carry scalar payloads, so a recorded stream
//! can be replayed without touching the device's ownership model.

use glam::{Mat4, Vec3, Vec4};

/// Lightweight handle identifying a buffer or texture resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u64);

/// Lightweight handle identifying a resource view (RTV/DSV/SRV/UAV).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ViewId(pub u64);

/// Lightweight handle identifying a shader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShaderId(pub u64);

/// Lightweight handle identifying a sampler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerId(pub u64);

/// Lightweight handle identifying an immutable composite state object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StateObjectId(pub u64);

/// Lightweight handle identifying a query (predication).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueryId(pub u64);

/// Lightweight handle identifying a vertex declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexDeclarationId(pub u64);

/// Shader pipeline stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderType {
    Vertex,
    Hull,
    Domain,
    Geometry,
    Pixel,
    Compute,
}

impl ShaderType {
    pub const COUNT: usize = 6;

    pub const ALL: [ShaderType; Self::COUNT] = [
        ShaderType::Vertex,
        ShaderType::Hull,
        ShaderType::Domain,
        ShaderType::Geometry,
        ShaderType::Pixel,
        ShaderType::Compute,
    ];

    /// Stages that belong to the graphics pipeline.
    pub const GRAPHICS: [ShaderType; 5] = [
        ShaderType::Vertex,
        ShaderType::Hull,
        ShaderType::Domain,
        ShaderType::Geometry,
        ShaderType::Pixel,
    ];
}

/// Which pipeline a binding applies to (for bindings that exist on both).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Graphics,
    Compute,
}

impl PipelineKind {
    pub const COUNT: usize = 2;
}

/// Backend-agnostic index format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

/// Primitive topology carried by draw commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
    TriangleFan,
}

bitflags::bitflags! {
    /// Targets affected by a clear command.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ClearFlags: u32 {
        const TARGET = 1 << 0;
        const ZBUFFER = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

/// Normalized RGBA color, component range unconstrained (lighting sums may
/// exceed 1 before downstream saturation).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ColorRgba {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl ColorRgba {
    pub const BLACK: Self = Self::new(0.0, 0.0, 0.0, 1.0);
    pub const WHITE: Self = Self::new(1.0, 1.0, 1.0, 1.0);
    pub const TRANSPARENT: Self = Self::new(0.0, 0.0, 0.0, 0.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Unpacks a D3D-style 0xAARRGGBB color.
    pub fn from_argb(argb: u32) -> Self {
        Self {
            r: ((argb >> 16) & 0xff) as f32 / 255.0,
            g: ((argb >> 8) & 0xff) as f32 / 255.0,
            b: (argb & 0xff) as f32 / 255.0,
            a: ((argb >> 24) & 0xff) as f32 / 255.0,
        }
    }
}

impl From<[f32; 4]> for ColorRgba {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<ColorRgba> for Vec4 {
    fn from(c: ColorRgba) -> Self {
        Vec4::new(c.r, c.g, c.b, c.a)
    }
}

impl From<ColorRgba> for Vec3 {
    fn from(c: ColorRgba) -> Self {
        Vec3::new(c.r, c.g, c.b)
    }
}

/// Viewport rectangle plus depth range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_z: f32,
    pub max_z: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            min_z: 0.0,
            max_z: 1.0,
        }
    }
}

/// Integer scissor rectangle (right/bottom exclusive).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// Fixed-function material.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Material {
    pub diffuse: ColorRgba,
    pub ambient: ColorRgba,
    pub specular: ColorRgba,
    pub emissive: ColorRgba,
    pub power: f32,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            diffuse: ColorRgba::WHITE,
            ambient: ColorRgba::TRANSPARENT,
            specular: ColorRgba::TRANSPARENT,
            emissive: ColorRgba::TRANSPARENT,
            power: 0.0,
        }
    }
}

/// Fixed-function light type (D3D numbering).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum LightType {
    Point = 1,
    Spot = 2,
    Directional = 3,
}

/// Application-supplied light parameters, stored untransformed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LightParams {
    pub light_type: LightType,
    pub diffuse: ColorRgba,
    pub specular: ColorRgba,
    pub ambient: ColorRgba,
    pub position: Vec3,
    pub direction: Vec3,
    pub range: f32,
    pub falloff: f32,
    /// Constant/linear/quadratic attenuation coefficients.
    pub attenuation: [f32; 3],
    /// Inner cone angle (radians, full angle).
    pub theta: f32,
    /// Outer cone angle (radians, full angle).
    pub phi: f32,
}

impl Default for LightParams {
    fn default() -> Self {
        Self {
            light_type: LightType::Directional,
            diffuse: ColorRgba::WHITE,
            specular: ColorRgba::TRANSPARENT,
            ambient: ColorRgba::TRANSPARENT,
            position: Vec3::ZERO,
            direction: Vec3::new(0.0, 0.0, 1.0),
            range: 0.0,
            falloff: 0.0,
            attenuation: [0.0, 0.0, 0.0],
            theta: 0.0,
            phi: 0.0,
        }
    }
}

/// Device-computed light parameters derived from [`LightParams`] at
/// `set_light` time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DerivedLight {
    pub position: Vec4,
    pub direction: Vec4,
    /// GL-style spot exponent bridging the D3D falloff model.
    pub exponent: f32,
    /// Spot cutoff half-angle in degrees (180 for point lights).
    pub cutoff: f32,
}

/// Legacy scalar render states (D3D9 numbering). Float-valued states store
/// the f32 bit pattern in the u32 value, as the original API does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RenderState {
    ZEnable = 7,
    FillMode = 8,
    ShadeMode = 9,
    ZWriteEnable = 14,
    AlphaTestEnable = 15,
    SrcBlend = 19,
    DestBlend = 20,
    CullMode = 22,
    ZFunc = 23,
    AlphaBlendEnable = 27,
    FogEnable = 28,
    SpecularEnable = 29,
    FogColor = 34,
    FogTableMode = 35,
    FogStart = 36,
    FogEnd = 37,
    FogDensity = 38,
    RangeFogEnable = 48,
    StencilEnable = 52,
    StencilFail = 53,
    StencilZFail = 54,
    StencilPass = 55,
    StencilFunc = 56,
    StencilRef = 57,
    StencilMask = 58,
    StencilWriteMask = 59,
    TextureFactor = 60,
    Clipping = 136,
    Lighting = 137,
    Ambient = 139,
    FogVertexMode = 140,
    ColorVertex = 141,
    LocalViewer = 142,
    NormalizeNormals = 143,
    DiffuseMaterialSource = 145,
    SpecularMaterialSource = 146,
    AmbientMaterialSource = 147,
    EmissiveMaterialSource = 148,
    VertexBlend = 151,
    ClipPlaneEnable = 152,
    PointSize = 154,
    MultisampleAntialias = 161,
    MultisampleMask = 162,
    ColorWriteEnable = 168,
    BlendOp = 171,
    ScissorTestEnable = 174,
    SlopeScaleDepthBias = 175,
    AntialiasedLineEnable = 176,
    TwoSidedStencilMode = 185,
    CcwStencilFail = 186,
    CcwStencilZFail = 187,
    CcwStencilPass = 188,
    CcwStencilFunc = 189,
    ColorWriteEnable1 = 190,
    ColorWriteEnable2 = 191,
    ColorWriteEnable3 = 192,
    BlendFactor = 193,
    SrgbWriteEnable = 194,
    DepthBias = 195,
    SeparateAlphaBlendEnable = 206,
    SrcBlendAlpha = 207,
    DestBlendAlpha = 208,
    BlendOpAlpha = 209,
}

/// One past the highest render-state id; sizes the dense state array.
pub const RENDER_STATE_COUNT: usize = 210;

impl RenderState {
    pub const ALL: &'static [RenderState] = &[
        RenderState::ZEnable,
        RenderState::FillMode,
        RenderState::ShadeMode,
        RenderState::ZWriteEnable,
        RenderState::AlphaTestEnable,
        RenderState::SrcBlend,
        RenderState::DestBlend,
        RenderState::CullMode,
        RenderState::ZFunc,
        RenderState::AlphaBlendEnable,
        RenderState::FogEnable,
        RenderState::SpecularEnable,
        RenderState::FogColor,
        RenderState::FogTableMode,
        RenderState::FogStart,
        RenderState::FogEnd,
        RenderState::FogDensity,
        RenderState::RangeFogEnable,
        RenderState::StencilEnable,
        RenderState::StencilFail,
        RenderState::StencilZFail,
        RenderState::StencilPass,
        RenderState::StencilFunc,
        RenderState::StencilRef,
        RenderState::StencilMask,
        RenderState::StencilWriteMask,
        RenderState::TextureFactor,
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
}

/// Legacy per-sampler states (D3D9 numbering).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SamplerStateKind {
    AddressU = 1,
    AddressV = 2,
    AddressW = 3,
    BorderColor = 4,
    MagFilter = 5,
    MinFilter = 6,
    MipFilter = 7,
    MipMapLodBias = 8,
    MaxMipLevel = 9,
    MaxAnisotropy = 10,
    SrgbTexture = 11,
    ElementIndex = 12,
    DmapOffset = 13,
}

pub const SAMPLER_STATE_COUNT: usize = 14;

impl SamplerStateKind {
    pub const ALL: &'static [SamplerStateKind] = &[
        SamplerStateKind::AddressU,
        SamplerStateKind::AddressV,
        SamplerStateKind::AddressW,
        SamplerStateKind::BorderColor,
        SamplerStateKind::MagFilter,
        SamplerStateKind::MinFilter,
        SamplerStateKind::MipFilter,
        SamplerStateKind::MipMapLodBias,
        SamplerStateKind::MaxMipLevel,
        SamplerStateKind::MaxAnisotropy,
        SamplerStateKind::SrgbTexture,
        SamplerStateKind::ElementIndex,
        SamplerStateKind::DmapOffset,
    ];
}

/// Legacy per-texture-stage states (D3D9 numbering, representative subset).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TextureStageStateKind {
    ColorOp = 1,
    ColorArg1 = 2,
    ColorArg2 = 3,
    AlphaOp = 4,
    AlphaArg1 = 5,
    AlphaArg2 = 6,
    BumpEnvMat00 = 7,
    BumpEnvMat01 = 8,
    BumpEnvMat10 = 9,
    BumpEnvMat11 = 10,
    TexCoordIndex = 11,
    BumpEnvLScale = 22,
    BumpEnvLOffset = 23,
    TextureTransformFlags = 24,
    ColorArg0 = 26,
    AlphaArg0 = 27,
    ResultArg = 28,
    Constant = 32,
}

pub const TEXTURE_STAGE_STATE_COUNT: usize = 33;

impl TextureStageStateKind {
    pub const ALL: &'static [TextureStageStateKind] = &[
        TextureStageStateKind::ColorOp,
        TextureStageStateKind::ColorArg1,
        TextureStageStateKind::ColorArg2,
        TextureStageStateKind::AlphaOp,
        TextureStageStateKind::AlphaArg1,
        TextureStageStateKind::AlphaArg2,
        TextureStageStateKind::BumpEnvMat00,
        TextureStageStateKind::BumpEnvMat01,
        TextureStageStateKind::BumpEnvMat10,
        TextureStageStateKind::BumpEnvMat11,
        TextureStageStateKind::TexCoordIndex,
        TextureStageStateKind::BumpEnvLScale,
        TextureStageStateKind::BumpEnvLOffset,
        TextureStageStateKind::TextureTransformFlags,
        TextureStageStateKind::ColorArg0,
        TextureStageStateKind::AlphaArg0,
        TextureStageStateKind::ResultArg,
        TextureStageStateKind::Constant,
    ];
}

/// Transform matrix slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransformState {
    View,
    Projection,
    /// Texture-coordinate transform, stage 0..8.
    Texture(u8),
    /// World matrix, index 0..4 (vertex blending).
    World(u8),
}

pub const TRANSFORM_COUNT: usize = 14;

impl TransformState {
    /// Dense storage index, or `None` for an out-of-range stage/index.
    pub fn index(self) -> Option<usize> {
        match self {
            TransformState::View => Some(0),
            TransformState::Projection => Some(1),
            TransformState::Texture(i) if i < 8 => Some(2 + i as usize),
            TransformState::World(i) if i < 4 => Some(10 + i as usize),
            _ => None,
        }
    }
}

/// Marker bit in a stream frequency value: the stream holds indexed
/// (per-vertex, repeated per instance) data.
pub const STREAM_SOURCE_INDEXED_DATA: u32 = 1 << 30;
/// Marker bit in a stream frequency value: the stream holds per-instance
/// data advanced once every `n` instances.
pub const STREAM_SOURCE_INSTANCE_DATA: u32 = 1 << 31;

/// A full 4x4 transform payload.
pub type TransformMatrix = Mat4;
