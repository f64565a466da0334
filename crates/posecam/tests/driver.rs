mod common;

use std::{sync::Arc, time::Duration};

use common::*;
use posecam::{
    driver::{LoopOptions, LoopState, PoseLoop},
    error::{CameraError, StartupError, Unavailable},
    frame::{DisplaySize, StillCamera},
    image::Image,
    overlay::{OverlayRenderer, OverlayStyle},
    resolution::Resolution,
    throughput::FpsEstimate,
};
use tokio::sync::Notify;

const LATENCY: Duration = Duration::from_millis(50);

fn options() -> LoopOptions {
    LoopOptions::default()
        .with_refresh_rate(100)
        .with_name("test loop")
}

fn renderer() -> OverlayRenderer {
    OverlayRenderer::new(OverlayStyle::posenet())
}

fn vga_source() -> FakeSource {
    FakeSource::steady(frame(Resolution::VGA, Resolution::VGA))
}

#[tokio::test(start_paused = true)]
async fn model_load_failure_is_reported_once() {
    let surface = RecordingSurface::default();
    let pose_loop = PoseLoop::new(
        FakeCamera(Ok(vga_source())),
        FakeLoader::failing("weights not found"),
        renderer(),
        surface.clone(),
        options(),
    );
    let mut monitor = pose_loop.monitor();
    assert_eq!(monitor.state(), LoopState::Uninitialized);

    let err = pose_loop.run().await.unwrap_err();
    match &err {
        StartupError::AssetLoad(e) => assert_eq!(e.location(), "memory://fake-model"),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(format!("{:#}", anyhow::Error::from(err)).contains("weights not found"));

    assert_eq!(monitor.wait_for_state(LoopState::Running).await, LoopState::Stopped);
    assert!(surface.ops().is_empty());
    assert_eq!(monitor.fps(), None);
}

#[tokio::test(start_paused = true)]
async fn camera_permission_denied() {
    let surface = RecordingSurface::default();
    let estimator = FakeEstimator::returning(None);
    let calls = estimator.calls();
    let pose_loop = PoseLoop::new(
        FakeCamera(Err(CameraError::PermissionDenied)),
        FakeLoader::ok(estimator),
        renderer(),
        surface.clone(),
        options(),
    );
    let monitor = pose_loop.monitor();

    let err = pose_loop.run().await.unwrap_err();
    assert!(matches!(
        err,
        StartupError::Camera(CameraError::PermissionDenied)
    ));
    assert_eq!(monitor.state(), LoopState::Stopped);
    assert_eq!(*calls.lock().unwrap(), 0);
    assert!(surface.ops().is_empty());
}

#[tokio::test(start_paused = true)]
async fn fps_published_every_ten_frames() {
    let estimator =
        FakeEstimator::returning(Some(pose_at(10.0, 10.0, 0.9))).with_latency(LATENCY);
    let pose_loop = PoseLoop::new(
        FakeCamera(Ok(vga_source())),
        FakeLoader::ok(estimator),
        renderer(),
        RecordingSurface::default(),
        options(),
    );
    let stop = pose_loop.stop_handle();
    let mut monitor = pose_loop.monitor();

    let observe = async {
        let mut published = Vec::new();
        while published.len() < 3 {
            let Some(fps) = monitor.next_fps().await else {
                break;
            };
            published.push(fps);
        }
        stop.stop();
        published
    };
    let (result, published) = tokio::join!(pose_loop.run(), observe);
    result.unwrap();

    // Each iteration takes one estimate's latency, so the 10th frame completes after 500 ms.
    assert_eq!(published, vec![FpsEstimate { value: 20 }; 3]);
}

#[tokio::test(start_paused = true)]
async fn unavailable_frames_do_not_count() {
    let native = Resolution::VGA;
    let source = FakeSource::scripted(
        [
            Err(Unavailable::NotAttached),
            Err(Unavailable::NotAttached),
            Err(Unavailable::NotAttached),
        ],
        Ok(frame(native, native)),
    );
    let surface = RecordingSurface::default();
    let pose_loop = PoseLoop::new(
        FakeCamera(Ok(source)),
        FakeLoader::ok(FakeEstimator::returning(None).with_latency(LATENCY)),
        renderer(),
        surface.clone(),
        options(),
    );
    let stop = pose_loop.stop_handle();
    let mut monitor = pose_loop.monitor();

    let observe = async {
        let fps = monitor.next_fps().await;
        stop.stop();
        fps
    };
    let (result, fps) = tokio::join!(pose_loop.run(), observe);
    result.unwrap();

    // Three empty 10 ms ticks, then ten frames of 50 ms each: 10 frames in 530 ms.
    assert_eq!(fps, Some(FpsEstimate { value: 19 }));
    assert_eq!(surface.presents(), 10);
}

#[tokio::test(start_paused = true)]
async fn overlay_cleared_without_pose() {
    let surface = RecordingSurface::default();
    let pose_loop = PoseLoop::new(
        FakeCamera(Ok(vga_source())),
        FakeLoader::ok(FakeEstimator::returning(None).with_latency(LATENCY)),
        renderer(),
        surface.clone(),
        options(),
    );
    let stop = pose_loop.stop_handle();
    let mut monitor = pose_loop.monitor();

    let observe = async {
        monitor.next_fps().await;
        stop.stop();
    };
    let (result, ()) = tokio::join!(pose_loop.run(), observe);
    result.unwrap();

    let ops = surface.ops();
    assert_eq!(ops.len(), 20);
    for render in ops.chunks(2) {
        assert_eq!(render, [Op::Clear(Resolution::VGA), Op::Present]);
    }
}

#[tokio::test(start_paused = true)]
async fn estimation_errors_count_as_no_pose() {
    let surface = RecordingSurface::default();
    let pose_loop = PoseLoop::new(
        FakeCamera(Ok(vga_source())),
        FakeLoader::ok(FakeEstimator::failing().with_latency(LATENCY)),
        renderer(),
        surface.clone(),
        options(),
    );
    let stop = pose_loop.stop_handle();
    let mut monitor = pose_loop.monitor();

    let observe = async {
        let fps = monitor.next_fps().await;
        stop.stop();
        fps
    };
    let (result, fps) = tokio::join!(pose_loop.run(), observe);
    result.unwrap();

    assert_eq!(fps, Some(FpsEstimate { value: 20 }));
    assert_eq!(surface.presents(), 10);
    assert_eq!(surface.circles(), 0);
}

#[tokio::test(start_paused = true)]
async fn keypoints_drawn_in_display_space() {
    let surface = RecordingSurface::default();
    let display = Resolution::new(320, 240);
    let estimator = FakeEstimator::returning(Some(pose_at(100.0, 100.0, 0.9)));
    let pose_loop = PoseLoop::new(
        FakeCamera(Ok(FakeSource::steady(frame(Resolution::VGA, display)))),
        FakeLoader::ok(estimator),
        renderer(),
        surface.clone(),
        options(),
    );
    let stop = pose_loop.stop_handle();
    let mut monitor = pose_loop.monitor();

    let observe = async {
        monitor.next_fps().await;
        stop.stop();
    };
    let (result, ()) = tokio::join!(pose_loop.run(), observe);
    result.unwrap();

    assert_eq!(
        surface.last_render(),
        [
            Op::Clear(display),
            Op::Circle { x: 50.0, y: 50.0 },
            Op::Present
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn resize_applies_to_next_render() {
    let surface = RecordingSurface::default();
    let display = DisplaySize::new(Resolution::new(320, 240));
    let camera = StillCamera::from_image(Image::new(640, 480)).with_display_size(display.clone());
    let estimator =
        FakeEstimator::returning(Some(pose_at(100.0, 100.0, 0.9))).with_latency(LATENCY);
    let pose_loop = PoseLoop::new(
        camera,
        FakeLoader::ok(estimator),
        renderer(),
        surface.clone(),
        options(),
    );
    let stop = pose_loop.stop_handle();
    let mut monitor = pose_loop.monitor();

    let observe = async {
        monitor.next_fps().await;
        display.set(Resolution::new(1280, 960));
        monitor.next_fps().await;
        stop.stop();
    };
    let (result, ()) = tokio::join!(pose_loop.run(), observe);
    result.unwrap();

    assert_eq!(
        surface.ops()[..3],
        [
            Op::Clear(Resolution::new(320, 240)),
            Op::Circle { x: 50.0, y: 50.0 },
            Op::Present
        ]
    );
    assert_eq!(
        surface.last_render(),
        [
            Op::Clear(Resolution::new(1280, 960)),
            Op::Circle { x: 200.0, y: 200.0 },
            Op::Present
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn zero_sized_frame_skips_render() {
    let surface = RecordingSurface::default();
    let estimator = FakeEstimator::returning(Some(pose_at(1.0, 1.0, 0.9))).with_latency(LATENCY);
    let pose_loop = PoseLoop::new(
        FakeCamera(Ok(FakeSource::steady(frame(
            Resolution::new(0, 480),
            Resolution::VGA,
        )))),
        FakeLoader::ok(estimator),
        renderer(),
        surface.clone(),
        options(),
    );
    let stop = pose_loop.stop_handle();
    let mut monitor = pose_loop.monitor();

    let observe = async {
        let fps = monitor.next_fps().await;
        stop.stop();
        fps
    };
    let (result, fps) = tokio::join!(pose_loop.run(), observe);
    result.unwrap();

    // Frames still count towards throughput, but nothing is drawn.
    assert_eq!(fps, Some(FpsEstimate { value: 20 }));
    assert!(surface.ops().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_while_estimating_discards_result() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let surface = RecordingSurface::default();
    let estimator = FakeEstimator::returning(Some(pose_at(10.0, 10.0, 0.9)))
        .with_latency(LATENCY)
        .with_gate(Gate {
            call: 2,
            started: started.clone(),
            release: release.clone(),
        });
    let calls = estimator.calls();
    let pose_loop = PoseLoop::new(
        FakeCamera(Ok(vga_source())),
        FakeLoader::ok(estimator),
        renderer(),
        surface.clone(),
        options(),
    );
    let stop = pose_loop.stop_handle();
    let monitor = pose_loop.monitor();

    let teardown = async {
        started.notified().await;
        let presents = surface.presents();
        stop.stop();
        release.notify_one();
        presents
    };
    let (result, presents_at_stop) = tokio::join!(pose_loop.run(), teardown);
    result.unwrap();

    assert_eq!(presents_at_stop, 2);
    assert_eq!(surface.presents(), presents_at_stop);
    assert_eq!(*calls.lock().unwrap(), 3);
    assert_eq!(monitor.state(), LoopState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn detached_source_stops_loop() {
    let native = Resolution::VGA;
    let source = FakeSource::scripted(
        [Ok(frame(native, native)), Ok(frame(native, native))],
        Err(Unavailable::Detached),
    );
    let surface = RecordingSurface::default();
    let pose_loop = PoseLoop::new(
        FakeCamera(Ok(source)),
        FakeLoader::ok(FakeEstimator::returning(None)),
        renderer(),
        surface.clone(),
        options(),
    );
    let monitor = pose_loop.monitor();

    pose_loop.run().await.unwrap();
    assert_eq!(monitor.state(), LoopState::Stopped);
    assert_eq!(surface.presents(), 2);
}

#[tokio::test(start_paused = true)]
async fn stop_during_initialization() {
    let surface = RecordingSurface::default();
    let pose_loop = PoseLoop::new(
        FakeCamera(Ok(vga_source())),
        FakeLoader::ok(FakeEstimator::returning(None)).with_delay(Duration::from_secs(5)),
        renderer(),
        surface.clone(),
        options(),
    );
    let stop = pose_loop.stop_handle();
    let mut monitor = pose_loop.monitor();

    let teardown = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop.stop();
    };
    let (result, ()) = tokio::join!(pose_loop.run(), teardown);
    result.unwrap();

    assert_eq!(monitor.wait_for_state(LoopState::Running).await, LoopState::Stopped);
    assert!(surface.ops().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_requested_before_run() {
    let surface = RecordingSurface::default();
    let pose_loop = PoseLoop::new(
        FakeCamera(Ok(vga_source())),
        FakeLoader::ok(FakeEstimator::returning(None)),
        renderer(),
        surface.clone(),
        options(),
    );
    pose_loop.stop_handle().stop();
    let monitor = pose_loop.monitor();

    pose_loop.run().await.unwrap();
    assert_eq!(monitor.state(), LoopState::Stopped);
    assert!(surface.ops().is_empty());
}
