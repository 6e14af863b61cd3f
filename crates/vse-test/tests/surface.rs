//! Surface changes and device loss as seen by the renderer.

use vse_gpu::{Extent2D, GpuError};
use vse_render::FrameOutcome;
use vse_test::{GltfBuilder, Harness, NodeSpec, PrimitiveSpec};

fn quad_scene() -> Vec<u8> {
    let mut b = GltfBuilder::new();
    let mesh = b.mesh(&[PrimitiveSpec::quad()]);
    b.node(&NodeSpec::mesh(mesh));
    b.to_glb().unwrap()
}

#[test]
fn resizing_rebuilds_the_depth_target() {
    let mut h = Harness::new().unwrap();
    h.load(&quad_scene()).unwrap();
    h.present().unwrap();
    assert_eq!(h.renderer.depth_extent(), Some(Extent2D::new(320, 240)));
    let images = h.device.live_images();

    h.surface.resize(Extent2D::new(640, 480));
    assert_eq!(h.present().unwrap().draws, 1);
    assert_eq!(h.scheduler.extent(), Extent2D::new(640, 480));
    assert_eq!(h.renderer.depth_extent(), Some(Extent2D::new(640, 480)));

    // The old depth target goes once the frames that used it have finished
    h.present().unwrap();
    h.present().unwrap();
    assert_eq!(h.device.live_images(), images);
    assert!(h.device.violations().is_empty());
}

#[test]
fn minimized_window_skips_frames() {
    let mut h = Harness::new().unwrap();
    h.load(&quad_scene()).unwrap();
    h.present().unwrap();
    let generation = h.scheduler.current_generation();

    h.surface.resize(Extent2D::new(0, 0));
    for _ in 0..3 {
        assert!(matches!(h.render_frame().unwrap(), FrameOutcome::Skipped));
    }
    assert_eq!(h.scheduler.current_generation(), generation);

    h.surface.resize(Extent2D::new(200, 100));
    assert_eq!(h.present().unwrap().draws, 1);
}

#[test]
fn out_of_date_surface_is_retried_next_frame() {
    let mut h = Harness::new().unwrap();
    h.load(&quad_scene()).unwrap();
    h.device.inject_acquire_error(GpuError::OutOfDate);

    assert!(matches!(h.render_frame().unwrap(), FrameOutcome::Skipped));
    assert_eq!(h.present().unwrap().draws, 1);
}

#[test]
fn lost_device_is_terminal() {
    let mut h = Harness::new().unwrap();
    h.load(&quad_scene()).unwrap();
    h.present().unwrap();

    h.device.inject_device_lost();
    let error = h.render_frame().unwrap_err();
    assert!(error.is_terminal(), "{error}");
}
