//! `opal-cmd` is the command-stream protocol layer of the Opal device core.
//!
//! It defines:
//! - The serialized [`Command`] stream the device context emits (one variant
//!   per state-mutation kind), carrying id newtypes and scalars only.
//! - The [`CommandSink`] boundary trait plus [`CommandQueue`], a worker-thread
//!   FIFO implementation, and the [`CommandExecutor`] replay hook.
//! - Wire-visible state types shared with the device core (viewports, legacy
//!   state ids, light/material parameters, ...).

mod command;
mod sink;
mod types;

pub use command::{Command, ObjectRef};
pub use sink::{CommandExecutor, CommandQueue, CommandSink};
#[cfg(any(test, feature = "test-utils"))]
pub use sink::{RecordingSink, SinkEvent};
pub use types::{
    ClearFlags, ColorRgba, DerivedLight, IndexFormat, LightParams, LightType, Material,
    PipelineKind, PrimitiveType, QueryId, Rect, RenderState, ResourceId, SamplerId,
    SamplerStateKind, ShaderId, ShaderType, StateObjectId, TextureStageStateKind, TransformMatrix,
    TransformState, VertexDeclarationId, ViewId, Viewport, RENDER_STATE_COUNT,
    SAMPLER_STATE_COUNT, STREAM_SOURCE_INDEXED_DATA, STREAM_SOURCE_INSTANCE_DATA,
    TEXTURE_STAGE_STATE_COUNT, TRANSFORM_COUNT,
};
