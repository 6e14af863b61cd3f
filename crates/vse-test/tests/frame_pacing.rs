//! Frame pacing through the full renderer with two frames in flight.

use std::thread;
use std::time::Duration;

use vse_gpu::headless::HeadlessEvent;
use vse_gpu::{FenceId, QueueKind};
use vse_test::{GltfBuilder, Harness, HarnessConfig, NodeSpec, PrimitiveSpec};

fn triangle_scene() -> Vec<u8> {
    let mut builder = GltfBuilder::new();
    let mesh = builder.mesh(&[PrimitiveSpec::triangle()]);
    builder.node(&NodeSpec::mesh(mesh));
    builder.to_glb().unwrap()
}

/// Render one frame while a helper thread releases the oldest submission once
/// the renderer is blocked on its fence. Returns the submission count the
/// helper saw while the frame was blocked.
fn render_blocked_frame(h: &mut Harness) -> usize {
    let device = h.device.clone();
    thread::scope(|s| {
        let helper = s.spawn(move || {
            assert!(
                device.wait_for_fence_waiter(Duration::from_secs(5)),
                "frame never waited on a fence"
            );
            let submitted = device.submission_count();
            assert!(device.complete_next());
            submitted
        });
        h.present().unwrap();
        helper.join().unwrap()
    })
}

fn graphics_fences(events: &[vse_gpu::headless::LoggedEvent]) -> Vec<(u64, FenceId)> {
    events
        .iter()
        .filter_map(|e| match &e.event {
            HeadlessEvent::Submitted {
                queue: QueueKind::Graphics,
                fence: Some(fence),
                ..
            } => Some((e.seq, *fence)),
            _ => None,
        })
        .collect()
}

#[test]
fn five_frames_with_two_in_flight() {
    let mut h = Harness::with_config(HarnessConfig::default().manual()).unwrap();
    h.load(&triangle_scene()).unwrap();
    h.device.complete_all();
    let start = h.device.events().len();
    let submitted_at_start = h.device.submission_count();

    // Both slots are free
    assert_eq!(h.present().unwrap().draws, 1);
    assert_eq!(h.present().unwrap().draws, 1);
    assert_eq!(h.device.pending_submissions(), 2);

    // Frames 3 to 5 each wait for the frame two behind them
    for frame in 3..=5 {
        let seen = render_blocked_frame(&mut h);
        assert_eq!(
            seen,
            submitted_at_start + frame - 1,
            "frame {frame} was submitted before its slot's fence signaled"
        );
    }
    h.device.complete_all();

    let events = h.device.events()[start..].to_vec();
    let fences = graphics_fences(&events);
    assert_eq!(fences.len(), 5);
    let (a, b) = (fences[0].1, fences[1].1);
    assert_ne!(a, b);
    let order: Vec<FenceId> = fences.iter().map(|(_, f)| *f).collect();
    assert_eq!(order, vec![a, b, a, b, a]);

    // Each fence is signaled exactly once per use
    for (i, &(seq, fence)) in fences.iter().enumerate() {
        let next_use = fences[i + 1..]
            .iter()
            .find(|(_, f)| *f == fence)
            .map_or(u64::MAX, |(s, _)| *s);
        let signals = events
            .iter()
            .filter(|e| e.seq > seq && e.seq < next_use)
            .filter(|e| e.event == HeadlessEvent::FenceSignaled(fence))
            .count();
        assert_eq!(signals, 1, "use {i} of {fence:?}");
    }

    // The third frame's wait started before frame 1's fence signaled
    let first_signal = events
        .iter()
        .find(|e| e.event == HeadlessEvent::FenceSignaled(a))
        .unwrap()
        .seq;
    let first_wait = events
        .iter()
        .find(|e| e.event == HeadlessEvent::FenceWaitStarted(a))
        .unwrap()
        .seq;
    assert!(first_wait < first_signal);
    assert!(first_signal < fences[2].0);

    assert!(h.device.violations().is_empty(), "{:?}", h.device.violations());
}

#[test]
fn generations_complete_in_submission_order() {
    let mut h = Harness::new().unwrap();
    h.load(&triangle_scene()).unwrap();

    let before = h.scheduler.current_generation();
    for _ in 0..4 {
        h.present().unwrap();
    }
    assert_eq!(h.scheduler.current_generation(), before + 4);
    assert_eq!(h.scheduler.last_submitted_generation(), before + 4);
    assert!(h.scheduler.completed_generation() <= h.scheduler.last_submitted_generation());
    assert!(h.device.violations().is_empty());
}
