//! PoseNet (MobileNet) single pose detector.
//!
//! The network outputs a coarse heatmap per keypoint, plus a 2D offset per heatmap cell that
//! refines the position within that cell.

use anyhow::bail;

use crate::{
    nn::{CnnInputShape, ColorMapper, Letterbox, Outputs},
    pose::{Keypoint, Pose, COCO_PARTS},
    resolution::Resolution,
};

use super::{sigmoid, PoseNetwork};

const NUM_KEYPOINTS: usize = COCO_PARTS.len();

pub struct PoseNet;

impl PoseNetwork for PoseNet {
    fn name(&self) -> &'static str {
        "posenet"
    }

    fn input_shape(&self) -> CnnInputShape {
        CnnInputShape::NHWC
    }

    fn color_mapper(&self) -> ColorMapper {
        ColorMapper::linear(-1.0..=1.0)
    }

    fn output_selection(&self) -> Option<&'static [usize]> {
        // heatmaps, offsets
        Some(&[0, 1])
    }

    fn decode(
        &self,
        outputs: &Outputs,
        input: Resolution,
        letterbox: &Letterbox,
    ) -> anyhow::Result<Pose> {
        let shape = outputs.shape(0)?;
        let &[1, rows, cols, NUM_KEYPOINTS] = shape else {
            bail!("unexpected PoseNet heatmap shape {shape:?}");
        };
        let heatmaps = outputs.f32_with_shape(0, &[1, rows, cols, NUM_KEYPOINTS])?;
        let offsets = outputs.f32_with_shape(1, &[1, rows, cols, NUM_KEYPOINTS * 2])?;
        let grid = Grid {
            rows,
            cols,
            stride: output_stride(input, rows, cols)?,
        };
        Ok(decode(heatmaps, offsets, grid, letterbox))
    }
}

/// Heatmap geometry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Grid {
    pub rows: usize,
    pub cols: usize,
    /// Input pixels per heatmap cell.
    pub stride: f32,
}

/// Derives the output stride from the input size and the heatmap size.
///
/// PoseNet inputs are `stride * n + 1` pixels wide, and the heatmap has `n + 1` cells.
fn output_stride(input: Resolution, rows: usize, cols: usize) -> anyhow::Result<f32> {
    if rows < 2 || cols < 2 {
        bail!("PoseNet heatmap of {cols}x{rows} cells is too small");
    }
    Ok((input.width() - 1) as f32 / (cols - 1) as f32)
}

/// Picks the highest-scoring heatmap cell for every keypoint and refines it with its offset.
///
/// `offsets` holds all Y offsets first, followed by all X offsets.
pub(crate) fn decode(heatmaps: &[f32], offsets: &[f32], grid: Grid, letterbox: &Letterbox) -> Pose {
    let keypoints = COCO_PARTS
        .iter()
        .enumerate()
        .map(|(k, &part)| {
            let mut best = (0, 0, f32::NEG_INFINITY);
            for row in 0..grid.rows {
                for col in 0..grid.cols {
                    let score = heatmaps[(row * grid.cols + col) * NUM_KEYPOINTS + k];
                    if score > best.2 {
                        best = (row, col, score);
                    }
                }
            }

            let (row, col, score) = best;
            let cell = (row * grid.cols + col) * NUM_KEYPOINTS * 2;
            let y = row as f32 * grid.stride + offsets[cell + k];
            let x = col as f32 * grid.stride + offsets[cell + NUM_KEYPOINTS + k];
            let (x, y) = letterbox.to_frame(x, y);
            Keypoint::new(part, x, y, sigmoid(score))
        })
        .collect();

    let pose = Pose::new(keypoints);
    let score = pose.mean_confidence();
    pose.with_score(score)
}
