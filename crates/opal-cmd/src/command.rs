//! The serialized device command stream.
//!
//! One variant per state-mutation kind. Commands are appended by the device
//! context in the exact order the corresponding state mutations occurred and
//! replayed in FIFO order by the sink's worker. Payloads are ids and scalars
//! only; object lifetime is the device core's concern, and FIFO ordering
//! guarantees a destroy command is observed after the object's last use.

use glam::{Mat4, Vec4};

use crate::types::{
    ClearFlags, ColorRgba, DerivedLight, IndexFormat, LightParams, Material, PipelineKind,
    PrimitiveType, QueryId, Rect, RenderState, ResourceId, SamplerId, SamplerStateKind, ShaderId,
    ShaderType, StateObjectId, TransformState, VertexDeclarationId, ViewId, Viewport,
    TextureStageStateKind,
};

/// Reference to any destroyable object kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectRef {
    Resource(ResourceId),
    View(ViewId),
    Shader(ShaderId),
    Sampler(SamplerId),
    StateObject(StateObjectId),
    Query(QueryId),
    VertexDeclaration(VertexDeclarationId),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    SetRenderTargetView {
        index: u32,
        view: Option<ViewId>,
    },
    SetDepthStencilView {
        view: Option<ViewId>,
    },
    SetShader {
        ty: ShaderType,
        shader: Option<ShaderId>,
    },
    SetConstantBuffers {
        ty: ShaderType,
        start_idx: u32,
        buffers: Vec<Option<ResourceId>>,
    },
    SetSamplers {
        ty: ShaderType,
        start_idx: u32,
        samplers: Vec<Option<SamplerId>>,
    },
    SetShaderResourceViews {
        ty: ShaderType,
        start_idx: u32,
        views: Vec<Option<ViewId>>,
    },
    SetUnorderedAccessViews {
        pipeline: PipelineKind,
        start_idx: u32,
        views: Vec<Option<ViewId>>,
    },
    SetStreamSource {
        stream: u32,
        buffer: Option<ResourceId>,
        offset: u32,
        stride: u32,
    },
    SetStreamSourceFreq {
        stream: u32,
        frequency: u32,
    },
    SetStreamOutputs {
        outputs: Vec<(Option<ResourceId>, u32)>,
    },
    SetIndexBuffer {
        buffer: Option<ResourceId>,
        format: IndexFormat,
        offset: u32,
    },
    SetVertexDeclaration {
        declaration: Option<VertexDeclarationId>,
    },
    SetBlendState {
        state: Option<StateObjectId>,
        factor: ColorRgba,
        sample_mask: u32,
    },
    SetRasterizerState {
        state: Option<StateObjectId>,
    },
    SetDepthStencilState {
        state: Option<StateObjectId>,
        stencil_ref: u32,
    },
    SetViewports {
        viewports: Vec<Viewport>,
    },
    SetScissorRects {
        rects: Vec<Rect>,
    },
    SetRenderState {
        state: RenderState,
        value: u32,
    },
    SetSamplerState {
        sampler: u32,
        state: SamplerStateKind,
        value: u32,
    },
    SetTextureStageState {
        stage: u32,
        state: TextureStageStateKind,
        value: u32,
    },
    SetTexture {
        stage: u32,
        texture: Option<ResourceId>,
    },
    SetTransform {
        state: TransformState,
        matrix: Mat4,
    },
    SetClipPlane {
        index: u32,
        plane: Vec4,
    },
    SetMaterial {
        material: Material,
    },
    SetLight {
        index: u32,
        light: LightParams,
        derived: DerivedLight,
    },
    SetLightEnable {
        index: u32,
        enable: bool,
    },
    SetPredication {
        query: Option<QueryId>,
        value: bool,
    },
    Draw {
        primitive_type: PrimitiveType,
        start_vertex: u32,
        vertex_count: u32,
        start_instance: u32,
        instance_count: u32,
    },
    DrawIndexed {
        primitive_type: PrimitiveType,
        start_index: u32,
        index_count: u32,
        base_vertex: i32,
        start_instance: u32,
        instance_count: u32,
    },
    Dispatch {
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    },
    Clear {
        flags: ClearFlags,
        color: ColorRgba,
        depth: f32,
        stencil: u32,
    },
    /// Drop every backend-side binding; emitted when the state container is
    /// reset to defaults (device reset / uninit).
    ResetState,
    /// Ask the backend to drop device-side storage for a resource without
    /// destroying the object (the application may still hold a reference).
    UnloadResource {
        resource: ResourceId,
    },
    /// Final destruction once the last owner released the object.
    DestroyObject {
        object: ObjectRef,
    },
}
