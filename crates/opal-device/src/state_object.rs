//! Immutable composite state objects and their deduplicating caches.
//!
//! Blend/rasterizer/depth-stencil state is built from legacy scalar render
//! states on commit, then deduplicated by descriptor byte-equality: no two
//! state objects with identical descriptors coexist, so descriptor equality
//! implies object identity. Cache entries are never mutated in place.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;
use opal_cmd::{Command, CommandSink, ObjectRef, RenderState, StateObjectId};
use tracing::warn;

use crate::device::IdAllocator;
use crate::state::{State, MAX_RENDER_TARGETS, ZB_FALSE, ZB_TRUE, ZB_USE_W};

/// Per-render-target blend parameters. Fields hold raw legacy enum values;
/// the descriptor is a value object keyed by its bytes, not interpreted
/// here.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct RenderTargetBlendDesc {
    pub enable: u32,
    pub src: u32,
    pub dst: u32,
    pub op: u32,
    pub src_alpha: u32,
    pub dst_alpha: u32,
    pub op_alpha: u32,
    pub write_mask: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct BlendStateDesc {
    /// Non-zero when render targets use differing parameters.
    pub independent: u32,
    pub render_targets: [RenderTargetBlendDesc; MAX_RENDER_TARGETS],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct RasterizerStateDesc {
    pub fill_mode: u32,
    pub cull_mode: u32,
    pub front_ccw: u32,
    pub depth_bias: f32,
    pub slope_scaled_depth_bias: f32,
    pub depth_clip: u32,
    pub scissor_enable: u32,
    pub line_antialias: u32,
    pub multisample: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct StencilOpDesc {
    pub fail: u32,
    pub depth_fail: u32,
    pub pass: u32,
    pub func: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct DepthStencilStateDesc {
    pub depth_enable: u32,
    pub depth_write: u32,
    pub depth_func: u32,
    pub stencil_enable: u32,
    pub stencil_read_mask: u32,
    pub stencil_write_mask: u32,
    pub front: StencilOpDesc,
    pub back: StencilOpDesc,
}

/// An immutable composite state object. Identity (the id) is the dedup
/// guarantee: equal descriptors map to the same object.
pub struct StateObject<D> {
    id: StateObjectId,
    desc: D,
    sink: Arc<dyn CommandSink>,
}

pub type BlendState = StateObject<BlendStateDesc>;
pub type RasterizerState = StateObject<RasterizerStateDesc>;
pub type DepthStencilState = StateObject<DepthStencilStateDesc>;

impl<D: Copy> StateObject<D> {
    pub fn id(&self) -> StateObjectId {
        self.id
    }

    pub fn desc(&self) -> &D {
        &self.desc
    }
}

impl<D> Drop for StateObject<D> {
    fn drop(&mut self) {
        self.sink.emit(Command::DestroyObject {
            object: ObjectRef::StateObject(self.id),
        });
    }
}

impl<D: fmt::Debug> fmt::Debug for StateObject<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateObject")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

/// Hash/Eq by descriptor bytes (descriptors contain f32 fields, so the
/// byte representation is the equality domain).
struct DescKey<D>(D);

impl<D: Pod> Hash for DescKey<D> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write(bytemuck::bytes_of(&self.0));
    }
}

impl<D: Pod> PartialEq for DescKey<D> {
    fn eq(&self, other: &Self) -> bool {
        bytemuck::bytes_of(&self.0) == bytemuck::bytes_of(&other.0)
    }
}

impl<D: Pod> Eq for DescKey<D> {}

pub struct StateObjectCache<D> {
    map: HashMap<DescKey<D>, Arc<StateObject<D>>>,
}

impl<D> Default for StateObjectCache<D> {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
        }
    }
}

impl<D: Pod> StateObjectCache<D> {
    /// Returns the canonical object for `desc`, creating it on first use.
    pub fn get_or_create(
        &mut self,
        desc: D,
        ids: &IdAllocator,
        sink: &Arc<dyn CommandSink>,
    ) -> Arc<StateObject<D>> {
        self.map
            .entry(DescKey(desc))
            .or_insert_with(|| {
                Arc::new(StateObject {
                    id: StateObjectId(ids.next()),
                    desc,
                    sink: Arc::clone(sink),
                })
            })
            .clone()
    }

    /// Drops every cached object (device reset / uninit).
    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[derive(Default)]
pub struct StateObjectCaches {
    pub blend: StateObjectCache<BlendStateDesc>,
    pub rasterizer: StateObjectCache<RasterizerStateDesc>,
    pub depth_stencil: StateObjectCache<DepthStencilStateDesc>,
}

impl StateObjectCaches {
    pub fn clear(&mut self) {
        self.blend.clear();
        self.rasterizer.clear();
        self.depth_stencil.clear();
    }
}

/// Rebuilds the full blend descriptor from the current merged render-state
/// values.
///
/// Legacy single-target blend semantics extend to MRT by fanning target 0's
/// blend parameters out to every target; per-target color-write masks that
/// differ force the independent flag.
pub fn blend_desc_from_state(state: &State) -> BlendStateDesc {
    use RenderState as RS;

    let separate_alpha = state.render_state_bool(RS::SeparateAlphaBlendEnable);
    let rt0 = RenderTargetBlendDesc {
        enable: state.render_state_bool(RS::AlphaBlendEnable) as u32,
        src: state.render_state(RS::SrcBlend),
        dst: state.render_state(RS::DestBlend),
        op: state.render_state(RS::BlendOp),
        src_alpha: if separate_alpha {
            state.render_state(RS::SrcBlendAlpha)
        } else {
            state.render_state(RS::SrcBlend)
        },
        dst_alpha: if separate_alpha {
            state.render_state(RS::DestBlendAlpha)
        } else {
            state.render_state(RS::DestBlend)
        },
        op_alpha: if separate_alpha {
            state.render_state(RS::BlendOpAlpha)
        } else {
            state.render_state(RS::BlendOp)
        },
        write_mask: state.render_state(RS::ColorWriteEnable),
    };

    let masks = [
        state.render_state(RS::ColorWriteEnable),
        state.render_state(RS::ColorWriteEnable1),
        state.render_state(RS::ColorWriteEnable2),
        state.render_state(RS::ColorWriteEnable3),
    ];

    let mut desc = BlendStateDesc {
        independent: 0,
        render_targets: [rt0; MAX_RENDER_TARGETS],
    };
    for (i, rt) in desc.render_targets.iter_mut().enumerate() {
        // Only the first four targets have legacy mask states; the rest
        // follow target 0.
        rt.write_mask = *masks.get(i).unwrap_or(&masks[0]);
        if rt.write_mask != rt0.write_mask {
            desc.independent = 1;
        }
    }
    desc
}

pub fn rasterizer_desc_from_state(state: &State) -> RasterizerStateDesc {
    use RenderState as RS;
    RasterizerStateDesc {
        fill_mode: state.render_state(RS::FillMode),
        cull_mode: state.render_state(RS::CullMode),
        // Legacy API: front faces wind clockwise; cull mode encodes the rest.
        front_ccw: 0,
        depth_bias: state.render_state_f32(RS::DepthBias),
        slope_scaled_depth_bias: state.render_state_f32(RS::SlopeScaleDepthBias),
        depth_clip: 1,
        scissor_enable: state.render_state_bool(RS::ScissorTestEnable) as u32,
        line_antialias: state.render_state_bool(RS::AntialiasedLineEnable) as u32,
        multisample: state.render_state_bool(RS::MultisampleAntialias) as u32,
    }
}

/// `warned_wbuffer` is the caller's one-time diagnostic flag; W-buffering is
/// not supported distinctly and degrades to a standard depth test.
pub fn depth_stencil_desc_from_state(
    state: &State,
    warned_wbuffer: &mut bool,
) -> DepthStencilStateDesc {
    use RenderState as RS;

    let depth_enable = match state.render_state(RS::ZEnable) {
        ZB_FALSE => 0,
        ZB_TRUE => 1,
        ZB_USE_W => {
            if !*warned_wbuffer {
                warn!("W-buffering is not supported, using the Z-buffer");
                *warned_wbuffer = true;
            }
            1
        }
        other => {
            warn!(value = other, "unrecognized ZEnable value, treating as on");
            1
        }
    };

    let front = StencilOpDesc {
        fail: state.render_state(RS::StencilFail),
        depth_fail: state.render_state(RS::StencilZFail),
        pass: state.render_state(RS::StencilPass),
        func: state.render_state(RS::StencilFunc),
    };
    let back = if state.render_state_bool(RS::TwoSidedStencilMode) {
        StencilOpDesc {
            fail: state.render_state(RS::CcwStencilFail),
            depth_fail: state.render_state(RS::CcwStencilZFail),
            pass: state.render_state(RS::CcwStencilPass),
            func: state.render_state(RS::CcwStencilFunc),
        }
    } else {
        front
    };

    DepthStencilStateDesc {
        depth_enable,
        depth_write: state.render_state_bool(RS::ZWriteEnable) as u32,
        depth_func: state.render_state(RS::ZFunc),
        stencil_enable: state.render_state_bool(RS::StencilEnable) as u32,
        stencil_read_mask: state.render_state(RS::StencilMask),
        stencil_write_mask: state.render_state(RS::StencilWriteMask),
        front,
        back,
    }
}
