//! Retained-mode device core: a full bindable-state container, a
//! change-detecting binding surface, deduplicating composite state caches,
//! a software fixed-function vertex pipeline and strict teardown
//! sequencing, all feeding a FIFO command sink (see `opal-cmd`).
//!
//! The device and its context are single-threaded by construction; the
//! sink's worker thread is the only consumer of the emitted stream, and all
//! bookkeeping (registry, caches, refcounts) stays on the client thread.

pub mod context;
pub mod device;
pub mod error;
pub mod ffp;
pub mod format;
pub mod light;
pub mod resource;
pub mod state;
pub mod state_object;
pub mod stateblock;

pub use context::DeviceContext;
pub use device::{Adapter, Device, DeviceCaps, FeatureLevel, IdAllocator, SwapchainDesc};
pub use error::DeviceError;
pub use ffp::{process_vertices, FfpConfig, FfpVertex, ProcessedVertex};
pub use format::{dsv_srv_conflict, Format};
pub use light::{LightEntry, LightMap, MAX_ACTIVE_LIGHTS};
pub use resource::{
    AccessFlags, BindFlags, DsvFlags, Query, QueryKind, RenderTargetView, Resource, ResourceDesc,
    ResourceKind, Sampler, SamplerDesc, Shader, ShaderResourceView, UnorderedAccessView,
    VertexDeclaration, VertexElement, ViewDesc,
};
pub use state::State;
pub use state_object::{
    BlendState, BlendStateDesc, DepthStencilState, DepthStencilStateDesc, RasterizerState,
    RasterizerStateDesc, StateObjectCache, StateObjectCaches,
};
pub use stateblock::{SavedStates, Stateblock, StateblockType};
