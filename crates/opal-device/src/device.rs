//! Device: object factory, live-resource registry and teardown sequencing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use opal_cmd::{
    Command, CommandSink, QueryId, RenderState, ResourceId, SamplerId, ShaderId, ShaderType,
    VertexDeclarationId, ViewId,
};
use tracing::{debug, warn};

use crate::context::DeviceContext;
use crate::error::DeviceError;
use crate::format::Format;
use crate::resource::{
    BindFlags, Query, QueryKind, RenderTargetView, Resource, ResourceDesc, Sampler, SamplerDesc,
    Shader, ShaderResourceView, UnorderedAccessView, VertexDeclaration, VertexElement, ViewDesc,
};
use crate::state::ZB_TRUE;
use crate::stateblock::{Stateblock, StateblockType};

/// Capability tier gating which state slots and limits are active.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FeatureLevel {
    Level9_1,
    Level9_3,
    Level10_0,
    Level10_1,
    Level11_0,
}

#[derive(Clone, Copy, Debug)]
pub struct DeviceCaps {
    pub feature_level: FeatureLevel,
    pub max_render_targets: u32,
    pub max_clip_planes: u32,
    pub max_ffp_lights: u32,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            feature_level: FeatureLevel::Level11_0,
            max_render_targets: crate::state::MAX_RENDER_TARGETS as u32,
            max_clip_planes: crate::state::MAX_CLIP_PLANES as u32,
            max_ffp_lights: crate::state::MAX_ACTIVE_LIGHTS as u32,
        }
    }
}

/// Monotonic id source shared by the device and its caches. Relaxed is
/// sufficient: ids only need uniqueness, not ordering.
#[derive(Debug, Default)]
pub struct IdAllocator(AtomicU64);

impl IdAllocator {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Backend collaborator. Creation/destruction minutiae live behind the
/// command sink; the adapter only covers capability queries and the 3D
/// bring-up/teardown bracket.
pub trait Adapter {
    fn caps(&self) -> DeviceCaps;
    fn init_3d(&mut self) -> Result<(), DeviceError>;
    fn uninit_3d(&mut self);
}

/// Implicit swapchain shape for [`Device::set_implicit_swapchain`] and
/// [`Device::reset`].
#[derive(Clone, Copy, Debug)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub auto_depth_stencil: bool,
    pub depth_stencil_format: Format,
}

impl Default for SwapchainDesc {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            format: Format::Bgra8Unorm,
            auto_depth_stencil: false,
            depth_stencil_format: Format::D24UnormS8Uint,
        }
    }
}

pub struct Device {
    sink: Arc<dyn CommandSink>,
    ids: Arc<IdAllocator>,
    adapter: Box<dyn Adapter>,
    caps: DeviceCaps,
    context: DeviceContext,
    /// Every resource ever created and possibly still alive. Client-thread
    /// only; pruned opportunistically.
    registry: Vec<Weak<Resource>>,
    back_buffer_view: Option<Arc<RenderTargetView>>,
    auto_depth_stencil_view: Option<Arc<RenderTargetView>>,
    initialized: bool,
}

impl Device {
    pub fn new(
        mut adapter: Box<dyn Adapter>,
        sink: Arc<dyn CommandSink>,
    ) -> Result<Self, DeviceError> {
        let caps = adapter.caps();
        adapter.init_3d()?;
        let ids = Arc::new(IdAllocator::default());
        let context = DeviceContext::new(Arc::clone(&sink), Arc::clone(&ids), caps);
        Ok(Self {
            sink,
            ids,
            adapter,
            caps,
            context,
            registry: Vec::new(),
            back_buffer_view: None,
            auto_depth_stencil_view: None,
            initialized: true,
        })
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut DeviceContext {
        &mut self.context
    }

    pub fn back_buffer_view(&self) -> Option<&Arc<RenderTargetView>> {
        self.back_buffer_view.as_ref()
    }

    pub fn auto_depth_stencil_view(&self) -> Option<&Arc<RenderTargetView>> {
        self.auto_depth_stencil_view.as_ref()
    }

    // --- Object factory ---

    pub fn create_buffer(&mut self, desc: ResourceDesc) -> Arc<Resource> {
        self.create_resource(desc)
    }

    pub fn create_texture(&mut self, desc: ResourceDesc) -> Arc<Resource> {
        self.create_resource(desc)
    }

    fn create_resource(&mut self, desc: ResourceDesc) -> Arc<Resource> {
        let resource = Arc::new(Resource::new(
            ResourceId(self.ids.next()),
            desc,
            Arc::clone(&self.sink),
        ));
        debug!(id = ?resource.id(), kind = ?desc.kind, "created resource");
        self.registry.push(Arc::downgrade(&resource));
        resource
    }

    pub fn create_render_target_view(
        &mut self,
        resource: &Arc<Resource>,
        desc: ViewDesc,
    ) -> Result<Arc<RenderTargetView>, DeviceError> {
        let required = if desc.format.is_depth_stencil() {
            BindFlags::DEPTH_STENCIL
        } else {
            BindFlags::RENDER_TARGET
        };
        let actual = resource.desc().bind_flags;
        if !actual.contains(required) {
            return Err(DeviceError::InvalidBindFlags { required, actual });
        }
        Ok(Arc::new(RenderTargetView::new(
            ViewId(self.ids.next()),
            Arc::clone(resource),
            desc,
        )))
    }

    pub fn create_shader_resource_view(
        &mut self,
        resource: &Arc<Resource>,
        desc: ViewDesc,
    ) -> Result<Arc<ShaderResourceView>, DeviceError> {
        let actual = resource.desc().bind_flags;
        if !actual.contains(BindFlags::SHADER_RESOURCE) {
            return Err(DeviceError::InvalidBindFlags {
                required: BindFlags::SHADER_RESOURCE,
                actual,
            });
        }
        Ok(Arc::new(ShaderResourceView::new(
            ViewId(self.ids.next()),
            Arc::clone(resource),
            desc,
        )))
    }

    pub fn create_unordered_access_view(
        &mut self,
        resource: &Arc<Resource>,
        desc: ViewDesc,
    ) -> Result<Arc<UnorderedAccessView>, DeviceError> {
        if self.caps.feature_level < FeatureLevel::Level11_0 {
            return Err(DeviceError::FeatureLevelTooLow {
                required: FeatureLevel::Level11_0,
            });
        }
        let actual = resource.desc().bind_flags;
        if !actual.contains(BindFlags::UNORDERED_ACCESS) {
            return Err(DeviceError::InvalidBindFlags {
                required: BindFlags::UNORDERED_ACCESS,
                actual,
            });
        }
        Ok(Arc::new(UnorderedAccessView::new(
            ViewId(self.ids.next()),
            Arc::clone(resource),
            desc,
        )))
    }

    pub fn create_shader(&mut self, ty: ShaderType, _bytecode: &[u8]) -> Arc<Shader> {
        Arc::new(Shader::new(
            ShaderId(self.ids.next()),
            ty,
            Arc::clone(&self.sink),
        ))
    }

    pub fn create_sampler(&mut self, desc: SamplerDesc) -> Arc<Sampler> {
        Arc::new(Sampler::new(
            SamplerId(self.ids.next()),
            desc,
            Arc::clone(&self.sink),
        ))
    }

    pub fn create_query(&mut self, kind: QueryKind) -> Arc<Query> {
        Arc::new(Query::new(
            QueryId(self.ids.next()),
            kind,
            Arc::clone(&self.sink),
        ))
    }

    pub fn create_vertex_declaration(
        &mut self,
        elements: Vec<VertexElement>,
    ) -> Arc<VertexDeclaration> {
        Arc::new(VertexDeclaration::new(
            VertexDeclarationId(self.ids.next()),
            elements,
            Arc::clone(&self.sink),
        ))
    }

    pub fn create_stateblock(&self, ty: StateblockType) -> Stateblock {
        Stateblock::capture_from(ty, self.context.state())
    }

    /// Replays a stateblock through the context, then rebuilds any composite
    /// state the replayed legacy states invalidated.
    pub fn apply_stateblock(&mut self, block: &Stateblock) -> Result<(), DeviceError> {
        block.apply(&mut self.context)?;
        self.context.commit_legacy_state();
        Ok(())
    }

    // --- Implicit swapchain ---

    /// Builds the back-buffer target (and optional auto depth-stencil),
    /// binds them, and re-aims viewport and scissor at the new surface.
    pub fn set_implicit_swapchain(&mut self, desc: &SwapchainDesc) -> Result<(), DeviceError> {
        let back_buffer = self.create_texture(ResourceDesc::texture_2d(
            desc.format,
            desc.width,
            desc.height,
            1,
            BindFlags::RENDER_TARGET,
        ));
        let back_buffer_view =
            self.create_render_target_view(&back_buffer, ViewDesc::whole(desc.format))?;
        self.context
            .set_render_target_view(0, Some(&back_buffer_view), true)?;
        self.back_buffer_view = Some(back_buffer_view);

        if desc.auto_depth_stencil {
            let depth = self.create_texture(ResourceDesc::texture_2d(
                desc.depth_stencil_format,
                desc.width,
                desc.height,
                1,
                BindFlags::DEPTH_STENCIL,
            ));
            let depth_view = self
                .create_render_target_view(&depth, ViewDesc::whole(desc.depth_stencil_format))?;
            self.context.set_depth_stencil_view(Some(&depth_view))?;
            // An auto depth-stencil implies the depth test defaults on.
            self.context.set_render_state(RenderState::ZEnable, ZB_TRUE);
            self.auto_depth_stencil_view = Some(depth_view);
        } else {
            self.context.set_depth_stencil_view(None)?;
            self.auto_depth_stencil_view = None;
        }
        Ok(())
    }

    /// Device reset: drain the stream, return all state to defaults, drop
    /// the implicit views, then rebuild the swapchain surfaces.
    pub fn reset(&mut self, desc: &SwapchainDesc) -> Result<(), DeviceError> {
        self.sink.finish();
        self.context.reset_state();
        let old_back_buffer = self.back_buffer_view.take();
        let old_depth_stencil = self.auto_depth_stencil_view.take();
        drop(old_back_buffer);
        drop(old_depth_stencil);
        self.prune_registry();
        self.set_implicit_swapchain(desc)
    }

    /// Full 3D teardown. The ordering is load-bearing: stream drained first,
    /// then state dropped, then still-live resources unloaded, then the
    /// adapter torn down, and the implicit views released last.
    pub fn uninit_3d(&mut self) {
        if !self.initialized {
            return;
        }
        self.initialized = false;

        self.sink.finish();
        self.context.reset_state();

        for weak in &self.registry {
            if let Some(resource) = weak.upgrade() {
                warn!(id = ?resource.id(), "resource still alive at uninit");
                self.sink.emit(Command::UnloadResource {
                    resource: resource.id(),
                });
            }
        }
        self.registry.clear();

        self.adapter.uninit_3d();

        let back_buffer = self.back_buffer_view.take();
        let depth_stencil = self.auto_depth_stencil_view.take();
        drop(back_buffer);
        drop(depth_stencil);
    }

    /// Live registered resources, pruning dead entries as a side effect.
    pub fn live_resources(&mut self) -> Vec<Arc<Resource>> {
        self.prune_registry();
        self.registry
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn prune_registry(&mut self) {
        self.registry.retain(|weak| weak.strong_count() > 0);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.uninit_3d();
    }
}
