//! Dense 33-point body landmark tracker (BlazePose landmark network).

use itertools::Itertools;

use crate::{
    nn::{CnnInputShape, ColorMapper, Letterbox, Outputs},
    pose::{BodyPart, Keypoint, Pose},
    resolution::Resolution,
};

use super::{sigmoid, PoseNetwork};

/// 33 pose landmarks ([`BodyPart`]s) followed by 6 auxiliary landmarks used for ROI tracking.
const NUM_LANDMARKS: usize = 33 + 6;

/// Network capacity. Higher capacity is more accurate, but slower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Lite,
    Full,
}

pub struct LandmarkNetwork {
    complexity: Complexity,
}

impl LandmarkNetwork {
    pub fn new(complexity: Complexity) -> Self {
        Self { complexity }
    }
}

impl PoseNetwork for LandmarkNetwork {
    fn name(&self) -> &'static str {
        match self.complexity {
            Complexity::Lite => "pose_landmark_lite",
            Complexity::Full => "pose_landmark_full",
        }
    }

    fn input_shape(&self) -> CnnInputShape {
        CnnInputShape::NCHW
    }

    fn color_mapper(&self) -> ColorMapper {
        ColorMapper::linear(0.0..=1.0)
    }

    fn output_selection(&self) -> Option<&'static [usize]> {
        // screen landmarks, pose flag, world landmarks. Segmentation and heatmap are unused.
        Some(&[0, 1, 4])
    }

    fn decode(
        &self,
        outputs: &Outputs,
        _input: Resolution,
        letterbox: &Letterbox,
    ) -> anyhow::Result<Pose> {
        let screen = outputs.f32_with_shape(0, &[1, NUM_LANDMARKS * 5])?;
        let flag = outputs.f32_with_shape(1, &[1, 1])?;
        let world = outputs.f32_with_shape(2, &[1, NUM_LANDMARKS * 3])?;
        Ok(decode(screen, flag[0], world, letterbox))
    }
}

/// Decodes raw landmark outputs into a [`Pose`] in frame coordinates.
///
/// `screen` holds `(x, y, z, visibility, presence)` per landmark, in input pixels. `world` holds
/// `(x, y, z)` per landmark, in meters.
pub(crate) fn decode(
    screen: &[f32],
    pose_flag: f32,
    world: &[f32],
    letterbox: &Letterbox,
) -> Pose {
    let keypoints = screen
        .iter()
        .tuples()
        .zip(BodyPart::ALL)
        .map(|((&x, &y, &z, &visibility, _presence), part)| {
            let (fx, fy) = letterbox.to_frame(x, y);
            // Depth uses the same scale as X.
            Keypoint::new(part, fx, fy, sigmoid(visibility)).with_z(z / letterbox.scale())
        })
        .collect::<Vec<_>>();

    let world = world
        .iter()
        .tuples()
        .zip(keypoints.iter())
        .map(|((&x, &y, &z), kp)| Keypoint::new(kp.label, x, y, kp.confidence).with_z(z))
        .collect();

    Pose::new(keypoints)
        .with_world(world)
        .with_score(pose_flag)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn decodes_pose_landmarks_only() {
        let input = Resolution::new(256, 256);
        // Square 512x512 frame: scale 0.5, no padding.
        let letterbox = Letterbox::new(Resolution::new(512, 512), input);

        let mut screen = vec![0.0; NUM_LANDMARKS * 5];
        let mut world = vec![0.0; NUM_LANDMARKS * 3];
        // Nose at input (100, 50), visible.
        screen[..5].copy_from_slice(&[100.0, 50.0, -8.0, 10.0, 10.0]);
        // Left hip in world space.
        world[23 * 3..24 * 3].copy_from_slice(&[0.1, 0.0, -0.05]);

        let pose = decode(&screen, 0.9, &world, &letterbox);
        assert_eq!(pose.keypoints.len(), 33);
        assert_eq!(pose.score, Some(0.9));

        let nose = pose.get(BodyPart::Nose).unwrap();
        assert_relative_eq!(nose.x, 200.0);
        assert_relative_eq!(nose.y, 100.0);
        assert_eq!(nose.z, Some(-16.0));
        assert!(nose.confidence > 0.99);

        let heel = pose.get(BodyPart::RightHeel).unwrap();
        assert_relative_eq!(heel.confidence, 0.5);

        let world = pose.world.unwrap();
        assert_eq!(world.len(), 33);
        assert_eq!(world[23].label, BodyPart::LeftHip);
        assert_eq!(world[23].x, 0.1);
        assert_eq!(world[23].z, Some(-0.05));
    }
}
