use std::{
    env::{self, VarError},
    panic::catch_unwind,
    sync::OnceLock,
};

use anyhow::{anyhow, bail};
use image::ImageBuffer;

use super::Image;

/// Webcams hand us MJPG frames, and decoder performance varies wildly between machines, so the
/// backend is selectable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JpegBackend {
    /// Uses the `jpeg-decoder` crate (via `image`), a robust but slow pure-Rust JPEG decoder.
    JpegDecoder,
    /// Uses the `mozjpeg` crate, a wrapper around Mozilla's libjpeg fork. Robust and fast-ish, but
    /// C.
    MozJpeg,
    /// Uses the `zune-jpeg` crate, a pure-Rust JPEG decoder somewhat faster than `jpeg-decoder`.
    ZuneJpeg,
}

const DEFAULT_BACKEND: JpegBackend = JpegBackend::MozJpeg;

const BACKEND_VAR: &str = "POSECAM_JPEG_BACKEND";

fn parse_backend(value: &str) -> Option<JpegBackend> {
    match value {
        "mozjpeg" => Some(JpegBackend::MozJpeg),
        "zune-jpeg" => Some(JpegBackend::ZuneJpeg),
        "jpeg-decoder" => Some(JpegBackend::JpegDecoder),
        _ => None,
    }
}

fn backend() -> JpegBackend {
    static JPEG_BACKEND: OnceLock<JpegBackend> = OnceLock::new();

    *JPEG_BACKEND.get_or_init(|| {
        let backend = match env::var(BACKEND_VAR) {
            Ok(v) => parse_backend(&v).unwrap_or_else(|| {
                log::error!(
                    "invalid value set for `{BACKEND_VAR}` variable: '{v}'; using {DEFAULT_BACKEND:?}"
                );
                DEFAULT_BACKEND
            }),
            Err(VarError::NotPresent) => DEFAULT_BACKEND,
            Err(VarError::NotUnicode(s)) => {
                log::error!(
                    "invalid value set for `{BACKEND_VAR}` variable: {}; using {DEFAULT_BACKEND:?}",
                    s.to_string_lossy()
                );
                DEFAULT_BACKEND
            }
        };
        log::debug!("using JPEG decode backend: {:?}", backend);
        backend
    })
}

pub(super) fn decode_jpeg(data: &[u8]) -> anyhow::Result<Image> {
    decode_with(backend(), data)
}

fn decode_with(backend: JpegBackend, data: &[u8]) -> anyhow::Result<Image> {
    let buf = match backend {
        JpegBackend::JpegDecoder => {
            image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)?.to_rgba8()
        }
        JpegBackend::MozJpeg => {
            // mozjpeg crate unfortunately reports errors only via unwinding
            let (buf, width, height) = catch_unwind(|| -> anyhow::Result<_> {
                let mut decompress = mozjpeg::Decompress::new_mem(data)?;

                // Tune settings for decode performance.
                decompress.do_fancy_upsampling(false);
                decompress.dct_method(mozjpeg::DctMethod::IntegerFast);

                let mut decompress = decompress.rgba()?;
                let buf = decompress
                    .read_scanlines_flat()
                    .ok_or_else(|| anyhow!("failed to decode image"))?;
                Ok((buf, decompress.width(), decompress.height()))
            })
            .map_err(|payload| match payload.downcast::<String>() {
                Ok(string) => anyhow::Error::msg(string),
                Err(_) => anyhow!("<unknown panic message>"),
            })??;

            ImageBuffer::from_raw(width.try_into()?, height.try_into()?, buf)
                .ok_or_else(|| anyhow!("decoded buffer does not match {width}x{height} image"))?
        }
        JpegBackend::ZuneJpeg => {
            use zune_jpeg::zune_core::colorspace::ColorSpace;
            use zune_jpeg::zune_core::options::DecoderOptions;

            let mut decomp = zune_jpeg::JpegDecoder::new_with_options(
                DecoderOptions::new_fast().jpeg_set_out_colorspace(ColorSpace::RGBA),
                data,
            );
            decomp.decode_headers()?;
            match decomp.get_output_colorspace() {
                Some(ColorSpace::RGBA) => {}
                other => bail!("unsupported colorspace {other:?} (expected RGBA)"),
            }

            let size = decomp
                .output_buffer_size()
                .ok_or_else(|| anyhow!("JPEG headers did not specify an image size"))?;
            let mut buf = vec![0; size];
            decomp.decode_into(&mut buf)?;
            let (width, height) = decomp
                .dimensions()
                .ok_or_else(|| anyhow!("JPEG headers did not specify an image size"))?;
            ImageBuffer::from_raw(width.into(), height.into(), buf)
                .ok_or_else(|| anyhow!("decoded buffer does not match {width}x{height} image"))?
        }
    };

    Ok(Image { buf })
}
