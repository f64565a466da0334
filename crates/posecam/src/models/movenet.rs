//! MoveNet single pose detector.

use crate::{
    nn::{CnnInputShape, ColorMapper, Letterbox, Outputs},
    pose::{Keypoint, Pose, COCO_PARTS},
    resolution::Resolution,
};

use super::PoseNetwork;

const NUM_KEYPOINTS: usize = COCO_PARTS.len();

/// MoveNet variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveNetType {
    /// 192x192 input. Fast.
    Lightning,
    /// 256x256 input. More accurate.
    Thunder,
}

impl MoveNetType {
    pub fn input_resolution(self) -> Resolution {
        match self {
            Self::Lightning => Resolution::new(192, 192),
            Self::Thunder => Resolution::new(256, 256),
        }
    }
}

pub struct MoveNet {
    ty: MoveNetType,
}

impl MoveNet {
    pub fn new(ty: MoveNetType) -> Self {
        Self { ty }
    }
}

impl PoseNetwork for MoveNet {
    fn name(&self) -> &'static str {
        match self.ty {
            MoveNetType::Lightning => "movenet_singlepose_lightning",
            MoveNetType::Thunder => "movenet_singlepose_thunder",
        }
    }

    fn input_shape(&self) -> CnnInputShape {
        CnnInputShape::NHWC
    }

    fn color_mapper(&self) -> ColorMapper {
        ColorMapper::Raw
    }

    fn decode(
        &self,
        outputs: &Outputs,
        input: Resolution,
        letterbox: &Letterbox,
    ) -> anyhow::Result<Pose> {
        let raw = outputs.f32_with_shape(0, &[1, 1, NUM_KEYPOINTS, 3])?;
        Ok(decode(raw, input, letterbox))
    }
}

/// Decodes `(y, x, score)` triples, with coordinates normalized to the network input.
pub(crate) fn decode(raw: &[f32], input: Resolution, letterbox: &Letterbox) -> Pose {
    let keypoints = raw
        .chunks_exact(3)
        .zip(COCO_PARTS)
        .map(|(kp, part)| {
            let (y, x, score) = (kp[0], kp[1], kp[2]);
            let (x, y) =
                letterbox.to_frame(x * input.width() as f32, y * input.height() as f32);
            Keypoint::new(part, x, y, score)
        })
        .collect();

    let pose = Pose::new(keypoints);
    let score = pose.mean_confidence();
    pose.with_score(score)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::pose::BodyPart;

    use super::*;

    #[test]
    fn normalized_to_frame() {
        let input = MoveNetType::Lightning.input_resolution();
        // 640x480 -> scale 0.3, 24 px of padding on top and bottom.
        let letterbox = Letterbox::new(Resolution::VGA, input);

        let mut raw = vec![0.0; NUM_KEYPOINTS * 3];
        raw[..3].copy_from_slice(&[0.5, 0.5, 0.8]);
        // Left wrist (keypoint 9) at the top left corner of the content area.
        raw[27..30].copy_from_slice(&[24.0 / 192.0, 0.0, 0.4]);

        let pose = decode(&raw, input, &letterbox);
        assert_eq!(pose.keypoints.len(), NUM_KEYPOINTS);

        let nose = pose.get(BodyPart::Nose).unwrap();
        assert_relative_eq!(nose.x, 320.0, epsilon = 1e-3);
        assert_relative_eq!(nose.y, 240.0, epsilon = 1e-3);
        assert_eq!(nose.confidence, 0.8);

        let wrist = pose.get(BodyPart::LeftWrist).unwrap();
        assert_relative_eq!(wrist.x, 0.0, epsilon = 1e-3);
        assert_relative_eq!(wrist.y, 0.0, epsilon = 1e-3);

        assert_relative_eq!(pose.score.unwrap(), 1.2 / 17.0, epsilon = 1e-6);
    }
}
