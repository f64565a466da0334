//! Runs the pose loop headlessly on a still image and writes the result with the overlay drawn
//! on top.
//!
//! Usage: `still_image <MODEL> <IMAGE> [OUTPUT]`

use std::env;

use anyhow::bail;
use posecam::{
    driver::{LoopOptions, PoseLoop},
    estimator::{EstimatorOptions, ModelKind},
    frame::StillCamera,
    image::{Color, Image},
    overlay::{OverlayRenderer, OverlayStyle},
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    posecam::init_logger!();

    let mut args = env::args().skip(1);
    let (Some(model), Some(input)) = (args.next(), args.next()) else {
        bail!("usage: still_image <MODEL> <IMAGE> [OUTPUT]");
    };
    let output = args.next().unwrap_or_else(|| "overlay.png".into());
    let model: ModelKind = model.parse()?;

    let mut overlay = Image::new(0, 0);
    let pose_loop = PoseLoop::new(
        StillCamera::open(&input),
        EstimatorOptions::new(model),
        OverlayRenderer::new(OverlayStyle::for_model(model).with_skeleton(Color::BLUE, 2)),
        &mut overlay,
        LoopOptions::default().with_name("still image"),
    );

    // One throughput window is plenty for a picture that never changes.
    let stop = pose_loop.stop_handle();
    let mut monitor = pose_loop.monitor();
    let stop_after_first_window = async {
        if let Some(fps) = monitor.next_fps().await {
            log::info!("{model}: {fps}");
        }
        stop.stop();
    };
    let (result, ()) = tokio::join!(pose_loop.run(), stop_after_first_window);
    result?;

    let mut image = Image::load(&input)?;
    for y in 0..overlay.height().min(image.height()) {
        for x in 0..overlay.width().min(image.width()) {
            let color = overlay.get(x, y);
            if color.a() != 0 {
                image.set(x, y, color);
            }
        }
    }
    image.save(&output)?;
    log::info!("wrote '{output}'");

    Ok(())
}
