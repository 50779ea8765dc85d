//! Binding-surface behavior: change detection, reference accounting,
//! hazard auto-unbind and the implicit viewport reset.

use std::sync::Arc;

use glam::Vec4;
use opal_cmd::{Command, CommandSink, PipelineKind, RecordingSink, Rect, ShaderType, SinkEvent};
use opal_device::{
    Adapter, BindFlags, Device, DeviceCaps, DeviceError, FeatureLevel, Format, ResourceDesc,
    ViewDesc,
};

struct NullAdapter;

impl Adapter for NullAdapter {
    fn caps(&self) -> DeviceCaps {
        DeviceCaps::default()
    }

    fn init_3d(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn uninit_3d(&mut self) {}
}

fn device_with_sink() -> (Arc<RecordingSink>, Device) {
    let sink = Arc::new(RecordingSink::new());
    let device = Device::new(Box::new(NullAdapter), sink.clone() as Arc<dyn CommandSink>)
        .expect("device init");
    (sink, device)
}

fn commands(sink: &RecordingSink) -> Vec<Command> {
    sink.take()
        .into_iter()
        .filter_map(|e| match e {
            SinkEvent::Command(c) => Some(c),
            SinkEvent::Finish => None,
        })
        .collect()
}

#[test]
fn identical_sets_emit_exactly_one_command() {
    let (sink, mut device) = device_with_sink();
    let tex = device.create_texture(ResourceDesc::texture_2d(
        Format::Rgba8Unorm,
        256,
        256,
        1,
        BindFlags::RENDER_TARGET,
    ));
    let view = device
        .create_render_target_view(&tex, ViewDesc::whole(Format::Rgba8Unorm))
        .unwrap();

    let baseline = Arc::strong_count(&view);
    device
        .context_mut()
        .set_render_target_view(0, Some(&view), false)
        .unwrap();
    device
        .context_mut()
        .set_render_target_view(0, Some(&view), false)
        .unwrap();

    assert_eq!(commands(&sink).len(), 1);
    // The slot holds exactly one extra reference, not two.
    assert_eq!(Arc::strong_count(&view), baseline + 1);
}

#[test]
fn slot_replacement_conserves_refcounts() {
    let (sink, mut device) = device_with_sink();
    let make_view = |device: &mut Device| {
        let tex = device.create_texture(ResourceDesc::texture_2d(
            Format::Rgba8Unorm,
            64,
            64,
            1,
            BindFlags::RENDER_TARGET,
        ));
        device
            .create_render_target_view(&tex, ViewDesc::whole(Format::Rgba8Unorm))
            .unwrap()
    };
    let a = make_view(&mut device);
    let b = make_view(&mut device);
    let (count_a, count_b) = (Arc::strong_count(&a), Arc::strong_count(&b));

    let ctx = device.context_mut();
    ctx.set_render_target_view(0, Some(&a), false).unwrap();
    ctx.set_render_target_view(0, Some(&b), false).unwrap();
    ctx.set_render_target_view(0, None, false).unwrap();

    // Net refcount delta is zero and the sink saw exactly three commands.
    assert_eq!(Arc::strong_count(&a), count_a);
    assert_eq!(Arc::strong_count(&b), count_b);
    assert_eq!(commands(&sink).len(), 3);
}

#[test]
fn render_target_bind_unbinds_conflicting_srv() {
    let (sink, mut device) = device_with_sink();
    let tex = device.create_texture(ResourceDesc::texture_2d(
        Format::Rgba8Unorm,
        128,
        128,
        1,
        BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE,
    ));
    let rtv = device
        .create_render_target_view(&tex, ViewDesc::whole(Format::Rgba8Unorm))
        .unwrap();
    let srv = device
        .create_shader_resource_view(&tex, ViewDesc::whole(Format::Rgba8Unorm))
        .unwrap();

    device
        .context_mut()
        .set_shader_resource_views(ShaderType::Pixel, 2, &[Some(srv.clone())])
        .unwrap();
    let _ = sink.take();

    device
        .context_mut()
        .set_render_target_view(0, Some(&rtv), false)
        .unwrap();

    let commands = commands(&sink);
    assert_eq!(commands.len(), 2);
    assert!(matches!(
        &commands[0],
        Command::SetShaderResourceViews { ty: ShaderType::Pixel, start_idx: 2, views } if views == &vec![None]
    ));
    assert!(matches!(commands[1], Command::SetRenderTargetView { index: 0, view: Some(_) }));
    assert!(
        device.context().state().shader_resource_views[ShaderType::Pixel as usize][2].is_none()
    );
}

#[test]
fn depth_only_srv_survives_read_only_depth_bind() {
    let (sink, mut device) = device_with_sink();
    let tex = device.create_texture(ResourceDesc::texture_2d(
        Format::D32Float,
        128,
        128,
        1,
        BindFlags::DEPTH_STENCIL | BindFlags::SHADER_RESOURCE,
    ));
    let mut dsv_desc = ViewDesc::whole(Format::D32Float);
    dsv_desc.dsv_flags = opal_device::DsvFlags::READ_ONLY_DEPTH;
    let dsv = device.create_render_target_view(&tex, dsv_desc).unwrap();
    let srv = device
        .create_shader_resource_view(&tex, ViewDesc::whole(Format::D32Float))
        .unwrap();

    device
        .context_mut()
        .set_shader_resource_views(ShaderType::Pixel, 0, &[Some(srv.clone())])
        .unwrap();
    let _ = sink.take();

    device.context_mut().set_depth_stencil_view(Some(&dsv)).unwrap();

    // Read-only depth never hazards the depth-reading SRV.
    assert_eq!(commands(&sink).len(), 1);
    assert!(
        device.context().state().shader_resource_views[ShaderType::Pixel as usize][0].is_some()
    );
}

#[test]
fn primary_target_with_viewport_reset_scenario() {
    let (sink, mut device) = device_with_sink();
    let tex = device.create_texture(ResourceDesc::texture_2d(
        Format::Rgba8Unorm,
        1024,
        768,
        1,
        BindFlags::RENDER_TARGET,
    ));
    let view = device
        .create_render_target_view(&tex, ViewDesc::whole(Format::Rgba8Unorm))
        .unwrap();

    device
        .context_mut()
        .set_render_target_view(0, Some(&view), true)
        .unwrap();

    let commands = commands(&sink);
    assert_eq!(commands.len(), 3);
    assert!(matches!(commands[0], Command::SetRenderTargetView { index: 0, .. }));
    assert!(matches!(commands[1], Command::SetViewports { .. }));
    assert!(matches!(commands[2], Command::SetScissorRects { .. }));

    let ctx = device.context();
    assert_eq!(ctx.viewports().len(), 1);
    let vp = ctx.viewports()[0];
    assert_eq!(
        (vp.x, vp.y, vp.width, vp.height, vp.min_z, vp.max_z),
        (0.0, 0.0, 1024.0, 768.0, 0.0, 1.0)
    );
    assert_eq!(
        ctx.scissor_rects(),
        &[Rect {
            left: 0,
            top: 0,
            right: 1024,
            bottom: 768
        }]
    );
}

#[test]
fn downlevel_adapter_limits_bind_surface() {
    struct DownlevelAdapter;

    impl Adapter for DownlevelAdapter {
        fn caps(&self) -> DeviceCaps {
            DeviceCaps {
                feature_level: FeatureLevel::Level9_3,
                max_render_targets: 1,
                max_clip_planes: 2,
                ..DeviceCaps::default()
            }
        }

        fn init_3d(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn uninit_3d(&mut self) {}
    }

    let sink = Arc::new(RecordingSink::new());
    let mut device = Device::new(Box::new(DownlevelAdapter), sink.clone() as Arc<dyn CommandSink>)
        .expect("device init");

    let tex = device.create_texture(ResourceDesc::texture_2d(
        Format::Rgba8Unorm,
        64,
        64,
        1,
        BindFlags::RENDER_TARGET,
    ));
    let rtv = device
        .create_render_target_view(&tex, ViewDesc::whole(Format::Rgba8Unorm))
        .unwrap();
    let _ = sink.take();

    let ctx = device.context_mut();
    // Slot 1 exists in the state arrays but not on this adapter.
    assert!(matches!(
        ctx.set_render_target_view(1, Some(&rtv), false),
        Err(DeviceError::InvalidIndex { index: 1, limit: 1 })
    ));
    assert!(matches!(
        ctx.set_clip_plane(2, Vec4::new(0.0, 0.0, 1.0, 0.0)),
        Err(DeviceError::InvalidIndex { index: 2, limit: 2 })
    ));
    assert!(matches!(
        ctx.set_unordered_access_views(PipelineKind::Graphics, 0, &[None]),
        Err(DeviceError::FeatureLevelTooLow { .. })
    ));
    assert!(commands(&sink).is_empty());

    ctx.set_render_target_view(0, Some(&rtv), false).unwrap();
    ctx.set_clip_plane(1, Vec4::new(0.0, 0.0, 1.0, 0.0)).unwrap();
    assert_eq!(commands(&sink).len(), 2);
}

#[test]
fn validation_failure_leaves_state_untouched() {
    let (sink, mut device) = device_with_sink();
    let buffer = device.create_buffer(ResourceDesc::buffer(
        256,
        BindFlags::CONSTANT_BUFFER,
        opal_device::AccessFlags::GPU,
    ));

    // A constant buffer is not bindable as a vertex stream.
    let err = device
        .context_mut()
        .set_stream_source(0, Some(&buffer), 0, 16);
    assert!(matches!(err, Err(DeviceError::InvalidBindFlags { .. })));
    assert!(device.context().state().streams[0].buffer.is_none());
    assert!(commands(&sink).is_empty());
}
