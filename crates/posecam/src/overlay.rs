//! Drawing of estimated poses on a transparent overlay.
//!
//! Every call to [`OverlayRenderer::render`] erases the whole surface before drawing, so the
//! overlay never shows keypoints from an earlier frame, even when the current frame produced no
//! pose at all.
//!
//! Estimators that produce world-space keypoints can have them shown in a [`WorldInset`], a small
//! panel in the corner of the overlay.

use crate::{
    estimator::ModelKind,
    image::Color,
    mapper::DisplayPose,
    pose::{Keypoint, BODY_CONNECTIONS},
    resolution::Resolution,
};

/// A 2D drawable region placed exactly over the displayed video.
///
/// Coordinates are in display pixels. Drawing outside of the surface is clipped.
pub trait Surface {
    /// Resizes the surface to `size` (if needed) and erases everything on it, making it fully
    /// transparent.
    fn clear(&mut self, size: Resolution);

    /// Draws a filled circle centered at `(x, y)`.
    fn fill_circle(&mut self, x: f32, y: f32, radius: f32, color: Color);

    /// Draws a straight line.
    fn line(&mut self, start: (f32, f32), end: (f32, f32), width: u32, color: Color);

    /// Makes everything drawn since the last [`Surface::clear`] visible.
    fn present(&mut self);
}

impl<S: Surface + ?Sized> Surface for &mut S {
    fn clear(&mut self, size: Resolution) {
        (**self).clear(size)
    }

    fn fill_circle(&mut self, x: f32, y: f32, radius: f32, color: Color) {
        (**self).fill_circle(x, y, radius, color)
    }

    fn line(&mut self, start: (f32, f32), end: (f32, f32), width: u32, color: Color) {
        (**self).line(start, end, width, color)
    }

    fn present(&mut self) {
        (**self).present()
    }
}

/// Visual parameters of the overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayStyle {
    min_confidence: f32,
    radius: f32,
    color: Color,
    skeleton: Option<(Color, u32)>,
    world: Option<WorldInset>,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self::posenet()
    }
}

impl OverlayStyle {
    /// Small markers for the dense 33-point landmark tracker, with its world-space keypoints in
    /// an inset.
    pub fn landmark() -> Self {
        Self {
            min_confidence: 0.5,
            radius: 1.0,
            color: Color::RED,
            skeleton: None,
            world: Some(WorldInset::default()),
        }
    }

    pub fn posenet() -> Self {
        Self {
            min_confidence: 0.5,
            radius: 5.0,
            color: Color::RED,
            skeleton: None,
            world: None,
        }
    }

    pub fn movenet() -> Self {
        Self {
            min_confidence: 0.3,
            radius: 5.0,
            color: Color::RED,
            skeleton: None,
            world: None,
        }
    }

    /// Returns the preset matching the keypoint density and confidence scale of `model`.
    pub fn for_model(model: ModelKind) -> Self {
        match model {
            ModelKind::Landmark(_) => Self::landmark(),
            ModelKind::PoseNet => Self::posenet(),
            ModelKind::MoveNet(_) => Self::movenet(),
        }
    }

    /// Sets the minimum confidence a keypoint needs to be drawn.
    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn with_radius(mut self, radius: f32) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_color(mut self, color: Color) -> Self {
        self.color = color;
        self
    }

    /// Also draws bones between connected keypoints whose confidences both pass the threshold.
    pub fn with_skeleton(mut self, color: Color, width: u32) -> Self {
        self.skeleton = Some((color, width));
        self
    }

    /// Shows world-space keypoints in `inset`, or hides them when `None`.
    pub fn with_world_inset(mut self, inset: Option<WorldInset>) -> Self {
        self.world = inset;
        self
    }

    pub fn world_inset(&self) -> Option<&WorldInset> {
        self.world.as_ref()
    }

    fn is_visible(&self, kp: &Keypoint) -> bool {
        kp.confidence >= self.min_confidence
    }
}

/// A square panel in the bottom right corner of the overlay showing world-space keypoints from
/// the front, centered on the hips.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldInset {
    /// Side length of the panel, as a fraction of the shorter display dimension.
    pub fraction: f32,
    /// Distance from the hip center, in meters, that reaches the panel's edge.
    pub extent: f32,
    pub radius: f32,
    pub color: Color,
}

impl Default for WorldInset {
    fn default() -> Self {
        Self {
            fraction: 0.25,
            extent: 1.0,
            radius: 1.0,
            color: Color::GREEN,
        }
    }
}

impl WorldInset {
    /// Returns the top left corner and side length of the panel on a `display`-sized surface.
    pub fn panel(&self, display: Resolution) -> ((f32, f32), f32) {
        let side = display.width().min(display.height()) as f32 * self.fraction;
        let origin = (display.width() as f32 - side, display.height() as f32 - side);
        (origin, side)
    }

    /// Places a world-space keypoint on the panel, or returns `None` if it lies outside.
    pub fn project(&self, display: Resolution, kp: &Keypoint) -> Option<(f32, f32)> {
        if kp.x.abs() > self.extent || kp.y.abs() > self.extent {
            return None;
        }
        let ((left, top), side) = self.panel(display);
        let half = side / 2.0;
        Some((
            left + half + kp.x / self.extent * half,
            top + half + kp.y / self.extent * half,
        ))
    }
}

/// Draws [`DisplayPose`]s onto a [`Surface`].
#[derive(Debug, Clone, Default)]
pub struct OverlayRenderer {
    style: OverlayStyle,
}

impl OverlayRenderer {
    pub fn new(style: OverlayStyle) -> Self {
        Self { style }
    }

    /// Replaces the surface contents with `pose`.
    ///
    /// The surface is cleared to `display` size first. With no pose, it is left cleared.
    pub fn render<S: Surface + ?Sized>(
        &self,
        pose: Option<&DisplayPose>,
        display: Resolution,
        surface: &mut S,
    ) {
        surface.clear(display);

        if let Some(pose) = pose {
            if let Some((color, width)) = self.style.skeleton {
                self.draw_skeleton(pose.keypoints(), color, width, surface);
            }

            for kp in pose.keypoints() {
                if self.style.is_visible(kp) {
                    surface.fill_circle(kp.x, kp.y, self.style.radius, self.style.color);
                }
            }

            if let (Some(inset), Some(world)) = (&self.style.world, pose.world()) {
                self.draw_world(inset, world, display, surface);
            }
        }

        surface.present();
    }

    fn draw_world<S: Surface + ?Sized>(
        &self,
        inset: &WorldInset,
        world: &[Keypoint],
        display: Resolution,
        surface: &mut S,
    ) {
        for kp in world.iter().filter(|kp| self.style.is_visible(kp)) {
            if let Some((x, y)) = inset.project(display, kp) {
                surface.fill_circle(x, y, inset.radius, inset.color);
            }
        }
    }

    fn draw_skeleton<S: Surface + ?Sized>(
        &self,
        keypoints: &[Keypoint],
        color: Color,
        width: u32,
        surface: &mut S,
    ) {
        let find = |part| keypoints.iter().find(|kp| kp.label == part);
        for &(a, b) in BODY_CONNECTIONS {
            let (Some(a), Some(b)) = (find(a), find(b)) else {
                continue;
            };
            if self.style.is_visible(a) && self.style.is_visible(b) {
                surface.line((a.x, a.y), (b.x, b.y), width, color);
            }
        }
    }
}
