//! Fixed-width PNG previews of rendered artifacts.

use std::io::Cursor;
use std::path::Path;

use anyhow::Context;
use image::{DynamicImage, ImageFormat, ImageReader, imageops::FilterType};

pub(crate) const THUMBNAIL_WIDTH: u32 = 256;

/// Scale to [`THUMBNAIL_WIDTH`] preserving aspect ratio and encode as PNG.
pub(crate) fn thumbnail_png_from_image(image: &DynamicImage) -> anyhow::Result<Vec<u8>> {
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        anyhow::bail!("source image has a zero dimension");
    }

    let new_height = ((THUMBNAIL_WIDTH as u64 * height as u64) / width as u64).max(1) as u32;
    let thumb = image.resize_exact(THUMBNAIL_WIDTH, new_height, FilterType::Lanczos3);

    let mut buf = Cursor::new(Vec::new());
    thumb
        .write_to(&mut buf, ImageFormat::Png)
        .context("encoding thumbnail")?;
    Ok(buf.into_inner())
}

pub(crate) fn thumbnail_png_from_path(path: &Path) -> anyhow::Result<Vec<u8>> {
    let image = ImageReader::open(path)
        .with_context(|| format!("opening {}", path.display()))?
        .decode()
        .with_context(|| format!("decoding {}", path.display()))?;
    thumbnail_png_from_image(&image)
}
