//! The pose loop: capture, estimate, map, render, count.
//!
//! A [`PoseLoop`] moves through the states of [`LoopState`] exactly once:
//!
//! ```text
//! Uninitialized -> Initializing -> Running -> Stopped
//!                        \____________________/
//! ```
//!
//! While `Initializing`, the camera is acquired and the estimator is loaded concurrently. Either
//! failing ends the loop in `Stopped` with a [`StartupError`]. While `Running`, every refresh tick
//! performs one iteration; iterations never overlap, so at most one estimate is ever in flight.
//!
//! Stopping is cooperative. A [`StopHandle`] request is observed while waiting for the next tick,
//! or right after an in-flight estimate completes. In the latter case the estimate is discarded
//! and nothing is drawn.

use std::{sync::Arc, time::Duration};

use itertools::Itertools;
use tokio::{
    sync::watch,
    time::{self, Instant, MissedTickBehavior},
};

use crate::{
    error::{NotReady, StartupError, Unavailable},
    estimator::{ModelLoader, PoseEstimator},
    frame::{Camera, FrameSource},
    mapper::map_to_display,
    overlay::{OverlayRenderer, Surface},
    throughput::{FpsEstimate, ThroughputTracker},
    timer::Timer,
};

/// Lifecycle state of a [`PoseLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoopState {
    Uninitialized,
    Initializing,
    Running,
    Stopped,
}

/// Requests a [`PoseLoop`] to stop.
///
/// Stopping is idempotent, and a stop requested before the loop runs makes it stop as soon as it
/// starts.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }
}

/// Observes the state and published frame rate of a [`PoseLoop`].
#[derive(Debug, Clone)]
pub struct LoopMonitor {
    state: watch::Receiver<LoopState>,
    fps: watch::Receiver<Option<FpsEstimate>>,
}

impl LoopMonitor {
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// The last published frame rate, or `None` before the first throughput window completed.
    pub fn fps(&self) -> Option<FpsEstimate> {
        *self.fps.borrow()
    }

    /// Waits until the loop is in `target` state or has stopped, and returns the state reached.
    pub async fn wait_for_state(&mut self, target: LoopState) -> LoopState {
        match self
            .state
            .wait_for(|s| *s == target || *s == LoopState::Stopped)
            .await
        {
            Ok(state) => *state,
            Err(_) => *self.state.borrow(),
        }
    }

    /// Waits for the next frame rate publication.
    ///
    /// Returns `None` once the loop is gone.
    pub async fn next_fps(&mut self) -> Option<FpsEstimate> {
        self.fps.changed().await.ok()?;
        *self.fps.borrow_and_update()
    }
}

/// Configuration of a [`PoseLoop`].
#[derive(Debug, Clone)]
pub struct LoopOptions {
    refresh_rate: u32,
    throughput_window: u64,
    name: String,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            refresh_rate: 60,
            throughput_window: ThroughputTracker::DEFAULT_WINDOW,
            name: "pose loop".into(),
        }
    }
}

impl LoopOptions {
    /// Sets the display refresh rate in Hz. The loop runs at most one iteration per refresh.
    ///
    /// # Panics
    ///
    /// Panics if `hz` is zero.
    pub fn with_refresh_rate(mut self, hz: u32) -> Self {
        assert!(hz > 0, "refresh rate must be positive");
        self.refresh_rate = hz;
        self
    }

    /// Sets the number of frames between frame rate publications.
    ///
    /// # Panics
    ///
    /// Panics if `frames` is zero.
    pub fn with_throughput_window(mut self, frames: u64) -> Self {
        assert!(frames > 0, "throughput window must be at least one frame");
        self.throughput_window = frames;
        self
    }

    /// Sets the name used in log messages.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns the time between two refreshes, never less than one nanosecond.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.refresh_rate)).max(Duration::from_nanos(1))
    }

    pub fn throughput_window(&self) -> u64 {
        self.throughput_window
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Drives camera frames through a pose estimator onto an overlay surface.
pub struct PoseLoop<C, L, S> {
    camera: C,
    loader: L,
    renderer: OverlayRenderer,
    surface: S,
    options: LoopOptions,
    state: watch::Sender<LoopState>,
    fps: watch::Sender<Option<FpsEstimate>>,
    stop: Arc<watch::Sender<bool>>,
}

impl<C, L, S> PoseLoop<C, L, S>
where
    C: Camera,
    L: ModelLoader,
    S: Surface,
{
    pub fn new(
        camera: C,
        loader: L,
        renderer: OverlayRenderer,
        surface: S,
        options: LoopOptions,
    ) -> Self {
        Self {
            camera,
            loader,
            renderer,
            surface,
            options,
            state: watch::channel(LoopState::Uninitialized).0,
            fps: watch::channel(None).0,
            stop: Arc::new(watch::channel(false).0),
        }
    }

    pub fn monitor(&self) -> LoopMonitor {
        LoopMonitor {
            state: self.state.subscribe(),
            fps: self.fps.subscribe(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    /// Runs the loop until it is stopped or its frame source detaches.
    ///
    /// Startup failures are logged and returned; every later per-frame failure is absorbed.
    pub async fn run(self) -> Result<(), StartupError> {
        let Self {
            camera,
            loader,
            renderer,
            mut surface,
            options,
            state,
            fps,
            stop,
        } = self;
        let name = options.name();
        let mut stop_rx = stop.subscribe();

        state.send_replace(LoopState::Initializing);
        log::debug!("{name}: initializing");

        let startup = async {
            tokio::try_join!(
                async { camera.acquire().await.map_err(StartupError::from) },
                async { loader.load().await.map_err(StartupError::from) },
            )
        };
        let (source, mut estimator) = tokio::select! {
            biased;
            _ = stop_requested(&mut stop_rx) => {
                log::debug!("{name}: stopped during initialization");
                state.send_replace(LoopState::Stopped);
                return Ok(());
            }
            res = startup => match res {
                Ok(ready) => ready,
                Err(e) => {
                    log::error!("{name}: startup failed: {e}");
                    state.send_replace(LoopState::Stopped);
                    return Err(e);
                }
            },
        };

        state.send_replace(LoopState::Running);
        log::info!("{name}: running");

        let t_frame = Timer::new("frame");
        let t_estimate = Timer::new("estimate");
        let t_render = Timer::new("render");
        let mut tracker = ThroughputTracker::new(options.throughput_window(), Instant::now());
        let mut ticks = time::interval(options.refresh_interval());
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop_rx) => break,
                _ = ticks.tick() => {}
            }

            let frame = match t_frame.time(|| source.current_frame()) {
                Ok(frame) => frame,
                Err(Unavailable::NotAttached) => {
                    log::trace!("{name}: no frame yet");
                    continue;
                }
                Err(Unavailable::Detached) => {
                    log::info!("{name}: frame source detached");
                    break;
                }
            };

            let started = Instant::now();
            let pose = match estimator.estimate(&frame).await {
                Ok(pose) => pose,
                Err(e) => {
                    log::debug!("{name}: estimation failed, treating as no pose: {e:#}");
                    None
                }
            };
            t_estimate.record(started.elapsed());

            if *stop_rx.borrow() {
                log::debug!("{name}: stopped while estimating, discarding result");
                break;
            }

            let mapped = pose
                .map(|pose| map_to_display(&pose, frame.native(), frame.display()))
                .transpose();
            match mapped {
                Ok(display_pose) => t_render.time(|| {
                    renderer.render(display_pose.as_ref(), frame.display(), &mut surface)
                }),
                Err(NotReady) => log::trace!("{name}: frame has no size yet, skipping render"),
            }

            if let Some(estimate) = tracker.record_frame(Instant::now()) {
                fps.send_replace(Some(estimate));
                let timers = [&t_frame, &t_estimate]
                    .into_iter()
                    .chain(estimator.timers())
                    .chain([&t_render])
                    .join(", ");
                log::debug!("{name}: {estimate} ({timers})");
            }
        }

        state.send_replace(LoopState::Stopped);
        log::info!("{name}: stopped after {} frames", tracker.frame_count());
        Ok(())
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        // No sender left, so no stop can ever be requested.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = LoopOptions::default();
        assert_eq!(options.throughput_window(), 10);
        assert_eq!(options.refresh_interval(), Duration::from_secs_f64(1.0 / 60.0));
    }

    #[test]
    #[should_panic]
    fn zero_refresh_rate() {
        LoopOptions::default().with_refresh_rate(0);
    }

    #[tokio::test(start_paused = true)]
    async fn extreme_refresh_rate_keeps_interval_nonzero() {
        let options = LoopOptions::default().with_refresh_rate(u32::MAX);
        assert_eq!(options.refresh_interval(), Duration::from_nanos(1));

        let mut ticks = time::interval(options.refresh_interval());
        ticks.tick().await;
        ticks.tick().await;
    }

    #[test]
    fn stop_handle_is_shared() {
        let tx = Arc::new(watch::channel(false).0);
        let a = StopHandle(tx.clone());
        let b = a.clone();
        assert!(!b.is_stopped());
        a.stop();
        assert!(b.is_stopped());
        a.stop();
        assert!(b.is_stopped());
    }

    #[test]
    fn states_are_ordered() {
        assert!(LoopState::Uninitialized < LoopState::Initializing);
        assert!(LoopState::Initializing < LoopState::Running);
        assert!(LoopState::Running < LoopState::Stopped);
    }
}
