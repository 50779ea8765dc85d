//! Bindable objects and their shared-ownership model.
//!
//! Every binding slot owns its object through an `Arc`; the atomic strong
//! count is the resource refcount. Dropping the last handle emits a destroy
//! command through the sink stored in the object, so backend-side destruction
//! is FIFO-ordered after the object's last use in the stream.

use std::fmt;
use std::sync::Arc;

use opal_cmd::{
    Command, CommandSink, ObjectRef, QueryId, ResourceId, SamplerId, ShaderId, ShaderType,
    VertexDeclarationId, ViewId,
};

use crate::format::Format;

bitflags::bitflags! {
    /// Roles a resource may be bound in.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BindFlags: u32 {
        const RENDER_TARGET = 1 << 0;
        const DEPTH_STENCIL = 1 << 1;
        const SHADER_RESOURCE = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
        const VERTEX_BUFFER = 1 << 4;
        const INDEX_BUFFER = 1 << 5;
        const CONSTANT_BUFFER = 1 << 6;
        const STREAM_OUTPUT = 1 << 7;
    }
}

bitflags::bitflags! {
    /// CPU/GPU access class.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const GPU = 1 << 0;
        const MAP_READ = 1 << 1;
        const MAP_WRITE = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Depth-stencil view behavior flags. A read-only plane cannot be
    /// written through the view and therefore never hazards an SRV.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DsvFlags: u32 {
        const READ_ONLY_DEPTH = 1 << 0;
        const READ_ONLY_STENCIL = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer,
    Texture1d,
    Texture2d,
    Texture3d,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResourceDesc {
    pub kind: ResourceKind,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    /// Buffer byte size; zero for textures.
    pub size: u64,
    pub bind_flags: BindFlags,
    pub access: AccessFlags,
}

impl ResourceDesc {
    pub fn buffer(size: u64, bind_flags: BindFlags, access: AccessFlags) -> Self {
        Self {
            kind: ResourceKind::Buffer,
            format: Format::Unknown,
            width: 0,
            height: 0,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            size,
            bind_flags,
            access,
        }
    }

    pub fn texture_2d(
        format: Format,
        width: u32,
        height: u32,
        mip_levels: u32,
        bind_flags: BindFlags,
    ) -> Self {
        Self {
            kind: ResourceKind::Texture2d,
            format,
            width,
            height,
            depth: 1,
            mip_levels,
            array_layers: 1,
            size: 0,
            bind_flags,
            access: AccessFlags::GPU,
        }
    }
}

/// A buffer or texture. Shared between binding slots, in-flight stateblocks
/// and the application via `Arc`.
pub struct Resource {
    id: ResourceId,
    desc: ResourceDesc,
    sink: Arc<dyn CommandSink>,
}

impl Resource {
    pub(crate) fn new(id: ResourceId, desc: ResourceDesc, sink: Arc<dyn CommandSink>) -> Self {
        Self { id, desc, sink }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn desc(&self) -> &ResourceDesc {
        &self.desc
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        self.sink.emit(Command::DestroyObject {
            object: ObjectRef::Resource(self.id),
        });
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

/// Sub-resource range plus format reinterpretation for a view.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewDesc {
    pub format: Format,
    pub first_mip: u32,
    pub mip_count: u32,
    pub first_layer: u32,
    pub layer_count: u32,
    pub dsv_flags: DsvFlags,
}

impl ViewDesc {
    /// A view over every subresource, in the resource's own format.
    pub fn whole(format: Format) -> Self {
        Self {
            format,
            first_mip: 0,
            mip_count: u32::MAX,
            first_layer: 0,
            layer_count: u32::MAX,
            dsv_flags: DsvFlags::empty(),
        }
    }

    /// Whether two views over the same resource touch overlapping
    /// subresources.
    pub fn overlaps(&self, other: &ViewDesc) -> bool {
        fn ranges_overlap(a_start: u32, a_count: u32, b_start: u32, b_count: u32) -> bool {
            let a_end = a_start.saturating_add(a_count);
            let b_end = b_start.saturating_add(b_count);
            a_start < b_end && b_start < a_end
        }
        ranges_overlap(self.first_mip, self.mip_count, other.first_mip, other.mip_count)
            && ranges_overlap(
                self.first_layer,
                self.layer_count,
                other.first_layer,
                other.layer_count,
            )
    }
}

macro_rules! view_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name {
            id: ViewId,
            resource: Arc<Resource>,
            desc: ViewDesc,
        }

        impl $name {
            pub(crate) fn new(id: ViewId, resource: Arc<Resource>, desc: ViewDesc) -> Self {
                Self { id, resource, desc }
            }

            pub fn id(&self) -> ViewId {
                self.id
            }

            pub fn resource(&self) -> &Arc<Resource> {
                &self.resource
            }

            pub fn desc(&self) -> &ViewDesc {
                &self.desc
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.resource.sink.emit(Command::DestroyObject {
                    object: ObjectRef::View(self.id),
                });
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("id", &self.id)
                    .field("resource", &self.resource.id)
                    .field("desc", &self.desc)
                    .finish()
            }
        }
    };
}

view_type! {
    /// Output-merger view. Serves both the render-target and depth-stencil
    /// roles; the role is implied by the bind point and the view format.
    RenderTargetView
}
view_type! {
    /// Read-only shader-visible view.
    ShaderResourceView
}
view_type! {
    /// Read-write shader-visible view.
    UnorderedAccessView
}

impl RenderTargetView {
    /// Mip-adjusted width, used when a bind resets viewport 0.
    pub fn width(&self) -> u32 {
        (self.resource.desc.width >> self.desc.first_mip).max(1)
    }

    pub fn height(&self) -> u32 {
        (self.resource.desc.height >> self.desc.first_mip).max(1)
    }
}

pub struct Shader {
    id: ShaderId,
    ty: ShaderType,
    sink: Arc<dyn CommandSink>,
}

impl Shader {
    pub(crate) fn new(id: ShaderId, ty: ShaderType, sink: Arc<dyn CommandSink>) -> Self {
        Self { id, ty, sink }
    }

    pub fn id(&self) -> ShaderId {
        self.id
    }

    pub fn shader_type(&self) -> ShaderType {
        self.ty
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        self.sink.emit(Command::DestroyObject {
            object: ObjectRef::Shader(self.id),
        });
    }
}

impl fmt::Debug for Shader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shader")
            .field("id", &self.id)
            .field("ty", &self.ty)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FilterMode {
    Point,
    Linear,
    Anisotropic,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AddressMode {
    Wrap,
    Mirror,
    Clamp,
    Border,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerDesc {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub mip_filter: FilterMode,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub lod_bias: f32,
    pub max_anisotropy: u32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            min_filter: FilterMode::Point,
            mag_filter: FilterMode::Point,
            mip_filter: FilterMode::Point,
            address_u: AddressMode::Wrap,
            address_v: AddressMode::Wrap,
            address_w: AddressMode::Wrap,
            lod_bias: 0.0,
            max_anisotropy: 1,
        }
    }
}

pub struct Sampler {
    id: SamplerId,
    desc: SamplerDesc,
    sink: Arc<dyn CommandSink>,
}

impl Sampler {
    pub(crate) fn new(id: SamplerId, desc: SamplerDesc, sink: Arc<dyn CommandSink>) -> Self {
        Self { id, desc, sink }
    }

    pub fn id(&self) -> SamplerId {
        self.id
    }

    pub fn desc(&self) -> &SamplerDesc {
        &self.desc
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.sink.emit(Command::DestroyObject {
            object: ObjectRef::Sampler(self.id),
        });
    }
}

impl fmt::Debug for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sampler")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKind {
    Occlusion,
    Event,
}

pub struct Query {
    id: QueryId,
    kind: QueryKind,
    sink: Arc<dyn CommandSink>,
}

impl Query {
    pub(crate) fn new(id: QueryId, kind: QueryKind, sink: Arc<dyn CommandSink>) -> Self {
        Self { id, kind, sink }
    }

    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        self.sink.emit(Command::DestroyObject {
            object: ObjectRef::Query(self.id),
        });
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexElementFormat {
    Float1,
    Float2,
    Float3,
    Float4,
    UByte4Norm,
    Short2,
    Short4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeclUsage {
    Position,
    Normal,
    Diffuse,
    Specular,
    TexCoord,
    BlendWeight,
    BlendIndices,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexElement {
    pub stream: u32,
    pub offset: u32,
    pub format: VertexElementFormat,
    pub usage: DeclUsage,
    pub usage_index: u32,
}

pub struct VertexDeclaration {
    id: VertexDeclarationId,
    elements: Vec<VertexElement>,
    sink: Arc<dyn CommandSink>,
}

impl VertexDeclaration {
    pub(crate) fn new(
        id: VertexDeclarationId,
        elements: Vec<VertexElement>,
        sink: Arc<dyn CommandSink>,
    ) -> Self {
        Self { id, elements, sink }
    }

    pub fn id(&self) -> VertexDeclarationId {
        self.id
    }

    pub fn elements(&self) -> &[VertexElement] {
        &self.elements
    }
}

impl Drop for VertexDeclaration {
    fn drop(&mut self) {
        self.sink.emit(Command::DestroyObject {
            object: ObjectRef::VertexDeclaration(self.id),
        });
    }
}

impl fmt::Debug for VertexDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VertexDeclaration")
            .field("id", &self.id)
            .field("elements", &self.elements)
            .finish_non_exhaustive()
    }
}
