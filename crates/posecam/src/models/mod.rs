//! The pose estimation networks supported by posecam.
//!
//! Each network knows how its input tensor has to look and how to decode its outputs into a
//! [`Pose`] in frame coordinates. Everything else (running the network, thresholds, threading)
//! is handled by [`NetworkEstimator`][crate::estimator::NetworkEstimator].

pub mod landmark;
pub mod movenet;
pub mod posenet;

use crate::{
    nn::{CnnInputShape, ColorMapper, Letterbox, Outputs},
    pose::Pose,
    resolution::Resolution,
};

/// Trait implemented by wrapper types around neural networks that estimate a single pose.
pub trait PoseNetwork: Send + Sync + 'static {
    /// Human-readable network name, used in logs.
    fn name(&self) -> &'static str;

    fn input_shape(&self) -> CnnInputShape;

    fn color_mapper(&self) -> ColorMapper;

    /// Network outputs to compute, in the order [`PoseNetwork::decode`] expects them.
    ///
    /// `None` computes all outputs.
    fn output_selection(&self) -> Option<&'static [usize]> {
        None
    }

    /// Extracts the pose from the network outputs.
    ///
    /// `input` is the network's input resolution. Positions have to be mapped back to the frame
    /// using `letterbox`. The returned pose must carry a score.
    fn decode(
        &self,
        outputs: &Outputs,
        input: Resolution,
        letterbox: &Letterbox,
    ) -> anyhow::Result<Pose>;
}

pub(crate) fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_sigmoid() {
        assert_relative_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(10.0) > 0.999);
        assert!(sigmoid(-10.0) < 0.001);
    }
}
