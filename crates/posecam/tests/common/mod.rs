//! Scripted stand-ins for the pose loop's collaborators.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::anyhow;
use posecam::{
    error::{AssetLoadError, CameraError, Unavailable},
    estimator::{ModelLoader, PoseEstimator},
    frame::{Camera, Frame, FrameSource},
    image::{Color, Image},
    overlay::Surface,
    pose::{BodyPart, Keypoint, Pose},
    resolution::Resolution,
};
use tokio::{sync::Notify, time};

pub fn frame(native: Resolution, display: Resolution) -> Frame {
    Frame::new(
        Arc::new(Image::new(native.width(), native.height())),
        display,
    )
}

pub fn pose_at(x: f32, y: f32, confidence: f32) -> Pose {
    Pose::new(vec![Keypoint::new(BodyPart::Nose, x, y, confidence)])
}

/// Hands out scripted results first, then `fallback` forever.
pub struct FakeSource {
    script: Mutex<VecDeque<Result<Frame, Unavailable>>>,
    fallback: Result<Frame, Unavailable>,
}

impl FakeSource {
    pub fn steady(frame: Frame) -> Self {
        Self::scripted([], Ok(frame))
    }

    pub fn scripted(
        script: impl IntoIterator<Item = Result<Frame, Unavailable>>,
        fallback: Result<Frame, Unavailable>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
        }
    }
}

impl FrameSource for FakeSource {
    fn current_frame(&self) -> Result<Frame, Unavailable> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

pub struct FakeCamera(pub Result<FakeSource, CameraError>);

impl Camera for FakeCamera {
    type Source = FakeSource;

    async fn acquire(self) -> Result<FakeSource, CameraError> {
        self.0
    }
}

/// Blocks one estimate until released.
pub struct Gate {
    /// Index of the estimate call to hold, starting at 0.
    pub call: usize,
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

pub struct FakeEstimator {
    pose: Option<Pose>,
    fail: bool,
    latency: Duration,
    gate: Option<Gate>,
    calls: Arc<Mutex<usize>>,
}

impl FakeEstimator {
    pub fn returning(pose: Option<Pose>) -> Self {
        Self {
            pose,
            fail: false,
            latency: Duration::ZERO,
            gate: None,
            calls: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::returning(None)
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Arc<Mutex<usize>> {
        self.calls.clone()
    }
}

impl PoseEstimator for FakeEstimator {
    async fn estimate(&mut self, _frame: &Frame) -> anyhow::Result<Option<Pose>> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls - 1
        };
        if let Some(gate) = self.gate.as_ref().filter(|gate| gate.call == call) {
            gate.started.notify_one();
            gate.release.notified().await;
        }
        if !self.latency.is_zero() {
            time::sleep(self.latency).await;
        }
        if self.fail {
            return Err(anyhow!("inference exploded"));
        }
        Ok(self.pose.clone())
    }
}

pub struct FakeLoader {
    result: Result<FakeEstimator, String>,
    delay: Duration,
}

impl FakeLoader {
    pub fn ok(estimator: FakeEstimator) -> Self {
        Self {
            result: Ok(estimator),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            result: Err(reason.to_string()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl ModelLoader for FakeLoader {
    type Estimator = FakeEstimator;

    async fn load(self) -> Result<FakeEstimator, AssetLoadError> {
        time::sleep(self.delay).await;
        self.result
            .map_err(|reason| AssetLoadError::new("memory://fake-model", anyhow!(reason)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Clear(Resolution),
    Circle { x: f32, y: f32 },
    Line,
    Present,
}

/// A [`Surface`] that records what is drawn on it, observable while the loop owns it.
#[derive(Clone, Default)]
pub struct RecordingSurface {
    ops: Arc<Mutex<Vec<Op>>>,
}

impl RecordingSurface {
    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn presents(&self) -> usize {
        self.count(|op| matches!(op, Op::Present))
    }

    pub fn circles(&self) -> usize {
        self.count(|op| matches!(op, Op::Circle { .. }))
    }

    fn count(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.ops.lock().unwrap().iter().filter(|op| pred(op)).count()
    }

    /// Returns the operations of the last completed render.
    pub fn last_render(&self) -> Vec<Op> {
        let ops = self.ops();
        let start = ops
            .iter()
            .rposition(|op| matches!(op, Op::Clear(_)))
            .unwrap_or(0);
        ops[start..].to_vec()
    }
}

impl Surface for RecordingSurface {
    fn clear(&mut self, size: Resolution) {
        self.ops.lock().unwrap().push(Op::Clear(size));
    }

    fn fill_circle(&mut self, x: f32, y: f32, _radius: f32, _color: Color) {
        self.ops.lock().unwrap().push(Op::Circle { x, y });
    }

    fn line(&mut self, _start: (f32, f32), _end: (f32, f32), _width: u32, _color: Color) {
        self.ops.lock().unwrap().push(Op::Line);
    }

    fn present(&mut self) {
        self.ops.lock().unwrap().push(Op::Present);
    }
}
