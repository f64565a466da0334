//! Conversion of keypoints from native frame coordinates to display coordinates.
//!
//! The camera delivers frames at its native resolution, but the frame may be shown at any size
//! (the window can be resized freely, and its aspect ratio does not have to match). Horizontal
//! and vertical scale factors are therefore independent, and must be recomputed from the current
//! sizes for every frame.

use nalgebra::Vector2;

use crate::{
    error::NotReady,
    pose::{Keypoint, Pose},
    resolution::Resolution,
};

/// Per-axis scale factors from native frame pixels to display pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayScale {
    factors: Vector2<f32>,
}

impl DisplayScale {
    /// Computes the scale factors that map `native` coordinates onto `display` coordinates.
    ///
    /// Fails with [`NotReady`] if `native` has a zero dimension, without dividing by it.
    pub fn between(native: Resolution, display: Resolution) -> Result<Self, NotReady> {
        if native.is_empty() {
            return Err(NotReady);
        }

        Ok(Self {
            factors: Vector2::new(
                display.width() as f32 / native.width() as f32,
                display.height() as f32 / native.height() as f32,
            ),
        })
    }

    #[inline]
    pub fn x(&self) -> f32 {
        self.factors.x
    }

    #[inline]
    pub fn y(&self) -> f32 {
        self.factors.y
    }

    /// Maps a native position to display space.
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let p = Vector2::new(x, y).component_mul(&self.factors);
        (p.x, p.y)
    }

    /// Maps a display position back to native space.
    ///
    /// If the display has a zero dimension, the result along that axis is not finite.
    pub fn invert(&self, x: f32, y: f32) -> (f32, f32) {
        let p = Vector2::new(x, y).component_div(&self.factors);
        (p.x, p.y)
    }

    fn map(&self, kp: &Keypoint) -> Keypoint {
        let (x, y) = self.apply(kp.x, kp.y);
        Keypoint { x, y, ..*kp }
    }
}

/// A [`Pose`] whose image-space keypoints are in display pixel coordinates.
///
/// World keypoints, depth values and confidences are passed through unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayPose {
    pose: Pose,
    display: Resolution,
}

impl DisplayPose {
    #[inline]
    pub fn keypoints(&self) -> &[Keypoint] {
        &self.pose.keypoints
    }

    #[inline]
    pub fn world(&self) -> Option<&[Keypoint]> {
        self.pose.world.as_deref()
    }

    #[inline]
    pub fn score(&self) -> Option<f32> {
        self.pose.score
    }

    /// The display size the keypoints were mapped to.
    #[inline]
    pub fn display(&self) -> Resolution {
        self.display
    }
}

/// Rewrites `pose`'s keypoints from `native` frame coordinates into `display` coordinates.
pub fn map_to_display(
    pose: &Pose,
    native: Resolution,
    display: Resolution,
) -> Result<DisplayPose, NotReady> {
    let scale = DisplayScale::between(native, display)?;
    Ok(DisplayPose {
        pose: Pose {
            keypoints: pose.keypoints.iter().map(|kp| scale.map(kp)).collect(),
            world: pose.world.clone(),
            score: pose.score,
        },
        display,
    })
}
