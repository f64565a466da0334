//! Shows the webcam (or a still image) with the estimated pose drawn on top.
//!
//! Usage: `posecam [MODEL] [IMAGE]`, where `MODEL` is one of `landmark-lite`, `landmark-full`,
//! `posenet`, `movenet-lightning` (the default) and `movenet-thunder`.

use std::{env, sync::Arc};

use anyhow::Context;
use posecam::{
    driver::{LoopOptions, PoseLoop},
    estimator::{EstimatorOptions, ModelKind},
    frame::{Camera, StillCamera},
    gui::Viewer,
    image::Image,
    models::movenet::MoveNetType,
    overlay::{OverlayRenderer, OverlayStyle},
    video::webcam::{WebcamCamera, WebcamOptions},
};

#[posecam::main]
fn main() -> anyhow::Result<()> {
    let mut args = env::args().skip(1);
    let model = match args.next() {
        Some(arg) => arg.parse()?,
        None => ModelKind::MoveNet(MoveNetType::Lightning),
    };

    let viewer = Viewer::new("posecam");
    viewer.set_title(format!("posecam: {model}"));

    match args.next() {
        Some(path) => {
            let image = Image::load(&path).with_context(|| format!("failed to load '{path}'"))?;
            viewer.show_video(&Arc::new(image.clone()));
            let camera = StillCamera::from_image(image).with_display_size(viewer.display_size());
            run(&viewer, camera, model)
        }
        None => {
            let camera = WebcamCamera::new(WebcamOptions::default())
                .with_display_size(viewer.display_size())
                .on_frame(viewer.video_sink());
            run(&viewer, camera, model)
        }
    }
}

fn run<C: Camera>(viewer: &Viewer, camera: C, model: ModelKind) -> anyhow::Result<()> {
    let pose_loop = PoseLoop::new(
        camera,
        EstimatorOptions::new(model),
        OverlayRenderer::new(OverlayStyle::for_model(model)),
        viewer.overlay(),
        LoopOptions::default().with_name(model.to_string()),
    );

    let stop = pose_loop.stop_handle();
    viewer.on_close(move || stop.stop());
    let mut monitor = pose_loop.monitor();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    runtime.block_on(async {
        let title = async {
            while let Some(fps) = monitor.next_fps().await {
                viewer.set_title(format!("posecam: {model} ({fps})"));
            }
        };
        let (result, ()) = tokio::join!(pose_loop.run(), title);
        result
    })?;
    Ok(())
}
