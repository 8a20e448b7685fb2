//! RasterizeImages: converts images the output format cannot display into
//! PNG and keeps raster images inside the output bounds.
//!
//! Decoding and resizing run in parallel with rayon; resizing goes through
//! fast_image_resize (SIMD Lanczos3) with the image crate as fallback.

use std::ffi::OsString;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageFormat};
use rayon::prelude::*;
use thiserror::Error;

use convert_core::book::BookDocument;
use convert_core::error::Result;
use convert_core::href;
use convert_core::options::ConversionOptions;
use convert_core::plugin::{Context, Transform};
use convert_utils::mime::{self, PNG_MIME, SVG_MIME};

use crate::external::{self, HelperError};

#[derive(Debug, Error)]
pub enum RasterizeError {
    #[error(transparent)]
    Helper(#[from] HelperError),

    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("no rasterizer for {0}")]
    Unsupported(String),
}

/// Turns image data of any type into PNG bytes no larger than `bounds`.
pub trait Rasterizer: Send + Sync {
    fn rasterize(
        &self,
        data: &[u8],
        media_type: &str,
        bounds: (u32, u32),
    ) -> std::result::Result<Vec<u8>, RasterizeError>;
}

/// Bitmap formats are decoded in process; SVG goes through an
/// `rsvg-convert` style helper and other vector formats (WMF, EMF) through
/// an ImageMagick style helper.
pub struct ExternalRasterizer {
    pub svg_command: String,
    pub vector_command: String,
    pub timeout: Duration,
}

impl ExternalRasterizer {
    pub fn from_options(opts: &ConversionOptions) -> Self {
        Self {
            svg_command: opts.svg_rasterizer_command.clone(),
            vector_command: opts.vector_rasterizer_command.clone(),
            timeout: Duration::from_secs(opts.helper_timeout_secs.max(1)),
        }
    }

    fn run_helper(
        &self,
        data: &[u8],
        media_type: &str,
        bounds: (u32, u32),
    ) -> std::result::Result<Vec<u8>, RasterizeError> {
        let dir = tempfile::tempdir()?;
        let input = dir
            .path()
            .join(format!("input.{}", mime::extension_from_mime(media_type)));
        let output = dir.path().join("output.png");
        std::fs::write(&input, data)?;

        let (w, h) = bounds;
        if media_type == SVG_MIME {
            let args: Vec<OsString> = vec![
                "-w".into(),
                w.to_string().into(),
                "-h".into(),
                h.to_string().into(),
                "-a".into(),
                "-f".into(),
                "png".into(),
                "-o".into(),
                output.clone().into_os_string(),
                input.into_os_string(),
            ];
            external::run(&self.svg_command, args, self.timeout)?;
        } else {
            let args: Vec<OsString> = vec![
                input.into_os_string(),
                "-resize".into(),
                format!("{}x{}>", w, h).into(),
                output.clone().into_os_string(),
            ];
            external::run(&self.vector_command, args, self.timeout)?;
        }

        let img = image::load_from_memory(&std::fs::read(&output)?)?;
        encode(&fit_within(img, bounds), ImageFormat::Png)
    }
}

impl Rasterizer for ExternalRasterizer {
    fn rasterize(
        &self,
        data: &[u8],
        media_type: &str,
        bounds: (u32, u32),
    ) -> std::result::Result<Vec<u8>, RasterizeError> {
        if ImageFormat::from_mime_type(media_type).is_some() {
            let img = image::load_from_memory(data)?;
            return encode(&fit_within(img, bounds), ImageFormat::Png);
        }
        if media_type.starts_with("image/") {
            return self.run_helper(data, media_type, bounds);
        }
        Err(RasterizeError::Unsupported(media_type.to_string()))
    }
}

/// Rasterizes unsupported images (renaming them to `.png` and updating
/// every reference) and, when `max_image_size` is set, downscales oversized
/// JPEG and PNG images in place.
#[derive(Default)]
pub struct RasterizeImages {
    rasterizer: Option<Arc<dyn Rasterizer>>,
}

impl RasterizeImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rasterizer(rasterizer: Arc<dyn Rasterizer>) -> Self {
        Self {
            rasterizer: Some(rasterizer),
        }
    }
}

enum Job {
    Rasterize,
    Downscale(ImageFormat),
}

impl Transform for RasterizeImages {
    fn name(&self) -> &str {
        "RasterizeImages"
    }

    fn priority(&self) -> i32 {
        60
    }

    fn options_consumed(&self) -> &[&str] {
        &[
            "max_image_size",
            "svg_rasterizer_command",
            "vector_rasterizer_command",
            "helper_timeout_secs",
        ]
    }

    fn apply(&self, book: &mut BookDocument, ctx: &Context<'_>) -> Result<()> {
        let bounds = ctx.options.image_bounds();
        let downscale_limit = ctx.options.max_image_size;

        let mut jobs: Vec<(String, String, Job)> = Vec::new();
        for item in book.iter_manifest().filter(|i| i.is_image()) {
            if !ctx.output.supports_image(&item.media_type) {
                jobs.push((item.href.clone(), item.media_type.clone(), Job::Rasterize));
            } else if downscale_limit.is_some() {
                match ImageFormat::from_mime_type(&item.media_type) {
                    Some(format @ (ImageFormat::Jpeg | ImageFormat::Png)) => {
                        jobs.push((item.href.clone(), item.media_type.clone(), Job::Downscale(format)))
                    }
                    _ => {}
                }
            }
        }
        if jobs.is_empty() {
            return Ok(());
        }
        let payloads = jobs
            .iter()
            .map(|(href, _, _)| book.bytes(href))
            .collect::<Result<Vec<_>>>()?;
        ctx.check_cancelled()?;

        let rasterizer: Arc<dyn Rasterizer> = match &self.rasterizer {
            Some(r) => r.clone(),
            None => Arc::new(ExternalRasterizer::from_options(ctx.options)),
        };
        log::info!("Processing {} images (bounds {}x{})", jobs.len(), bounds.0, bounds.1);

        let results: Vec<Option<std::result::Result<Vec<u8>, RasterizeError>>> = jobs
            .par_iter()
            .zip(payloads.par_iter())
            .map(|((_, media_type, job), data)| match job {
                Job::Rasterize => Some(rasterizer.rasterize(data, media_type, bounds)),
                Job::Downscale(format) => {
                    downscale_in_format(data, *format, downscale_limit.unwrap_or(bounds)).transpose()
                }
            })
            .collect();
        ctx.check_cancelled()?;

        let mut rasterized = 0usize;
        let mut resized = 0usize;
        for ((item_href, _, job), result) in jobs.into_iter().zip(results) {
            match job {
                Job::Rasterize => {
                    let bytes = match result {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(e)) => {
                            log::warn!("Could not rasterize {}: {}; using a placeholder", item_href, e);
                            placeholder_png()
                        }
                        None => placeholder_png(),
                    };
                    let base = format!(
                        "{}{}",
                        href::dirname(&item_href),
                        href::stem_and_extension(&item_href).0
                    );
                    let new_href = book.manifest.generate_href(&base, "png");
                    book.rename_item(&item_href, &new_href)?;
                    book.set_bytes(&new_href, bytes)?;
                    if let Some(item) = book.manifest.by_href_mut(&new_href) {
                        item.media_type = PNG_MIME.to_string();
                    }
                    log::debug!("Rasterized {} to {}", item_href, new_href);
                    rasterized += 1;
                }
                Job::Downscale(_) => match result {
                    Some(Ok(bytes)) => {
                        book.set_bytes(&item_href, bytes)?;
                        resized += 1;
                    }
                    Some(Err(e)) => log::warn!("Could not resize {}: {}", item_href, e),
                    None => {}
                },
            }
        }
        log::info!("Rasterized {} images, resized {}", rasterized, resized);
        Ok(())
    }
}

/// Re-encoded image when it exceeds `bounds`, `None` when it already fits.
fn downscale_in_format(
    data: &[u8],
    format: ImageFormat,
    bounds: (u32, u32),
) -> std::result::Result<Option<Vec<u8>>, RasterizeError> {
    let img = image::load_from_memory(data)?;
    if img.width() <= bounds.0 && img.height() <= bounds.1 {
        return Ok(None);
    }
    encode(&fit_within(img, bounds), format).map(Some)
}

/// Dimensions that fit within `max_w` x `max_h` preserving aspect ratio.
pub fn fit_dimensions(w: u32, h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    let ratio = (max_w as f64 / w as f64).min(max_h as f64 / h as f64);
    let new_w = (w as f64 * ratio).round() as u32;
    let new_h = (h as f64 * ratio).round() as u32;
    (new_w.max(1), new_h.max(1))
}

/// Downscale `img` to fit `bounds`; smaller images come back unchanged.
fn fit_within(img: DynamicImage, bounds: (u32, u32)) -> DynamicImage {
    use fast_image_resize::images::Image;
    use fast_image_resize::{PixelType, Resizer};

    let (w, h) = (img.width(), img.height());
    if (w <= bounds.0 && h <= bounds.1) || w == 0 || h == 0 {
        return img;
    }
    let (new_w, new_h) = fit_dimensions(w, h, bounds.0.max(1), bounds.1.max(1));

    let src = DynamicImage::ImageRgba8(img.to_rgba8());
    let mut dst = Image::new(new_w, new_h, PixelType::U8x4);
    let mut resizer = Resizer::new();
    if let Err(e) = resizer.resize(&src, &mut dst, None) {
        log::debug!("fast_image_resize failed ({}), falling back to image crate", e);
        return img.resize(new_w, new_h, image::imageops::FilterType::Lanczos3);
    }
    match image::RgbaImage::from_raw(new_w, new_h, dst.into_vec()) {
        Some(rgba) => DynamicImage::ImageRgba8(rgba),
        None => img.resize(new_w, new_h, image::imageops::FilterType::Lanczos3),
    }
}

fn encode(img: &DynamicImage, format: ImageFormat) -> std::result::Result<Vec<u8>, RasterizeError> {
    let mut buf = Vec::new();
    if format == ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(img.to_rgb8()).write_to(&mut Cursor::new(&mut buf), format)?;
    } else {
        img.write_to(&mut Cursor::new(&mut buf), format)?;
    }
    Ok(buf)
}

/// Light grey square standing in for an image that could not be converted.
pub fn placeholder_png() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(64, 64, image::Rgb([224, 224, 224]));
    let mut buf = Vec::new();
    match DynamicImage::ImageRgb8(img).write_to(&mut Cursor::new(&mut buf), ImageFormat::Png) {
        Ok(()) => buf,
        Err(e) => {
            log::error!("Could not encode placeholder image: {}", e);
            Vec::new()
        }
    }
}
