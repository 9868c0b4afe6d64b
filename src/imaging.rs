//! Image decode/encode primitives shared by the blur and watermark pipelines
//!
//! Every transform decodes into an RGBA buffer, works in the pixel domain
//! and re-encodes in the source container format. The alpha flag is kept
//! so opaque sources are not re-encoded with an alpha channel.

use std::io::{Cursor, Write};
use std::path::Path;

use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ImageFormat, ImageOutputFormat, RgbaImage};

use crate::core::error::{Result, ShieldError, TransformStage};

/// Quality used when re-encoding JPEG sources
pub const JPEG_QUALITY: u8 = 90;

/// A decoded image with the container it came from
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub pixels: RgbaImage,
    pub format: ImageFormat,
    pub has_alpha: bool,
}

/// Formats the pipelines can both decode and re-encode
pub fn is_supported(format: ImageFormat) -> bool {
    matches!(
        format,
        ImageFormat::Png
            | ImageFormat::Jpeg
            | ImageFormat::Gif
            | ImageFormat::Bmp
            | ImageFormat::Tiff
            | ImageFormat::WebP
    )
}

/// Formats that store every pixel bit exactly
///
/// WebP is excluded: sources may be lossy even though derivatives are
/// written with the lossless encoder.
pub fn is_lossless(format: ImageFormat) -> bool {
    matches!(format, ImageFormat::Png | ImageFormat::Bmp | ImageFormat::Tiff)
}

fn keeps_alpha(format: ImageFormat) -> bool {
    !matches!(format, ImageFormat::Jpeg)
}

pub fn format_name(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "png",
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::Gif => "gif",
        ImageFormat::Bmp => "bmp",
        ImageFormat::Tiff => "tiff",
        ImageFormat::WebP => "webp",
        _ => "other",
    }
}

pub fn mime_type(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "image/png",
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Gif => "image/gif",
        ImageFormat::Bmp => "image/bmp",
        ImageFormat::Tiff => "image/tiff",
        ImageFormat::WebP => "image/webp",
        _ => "application/octet-stream",
    }
}

/// File extension for cached derivatives
pub fn extension(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpg",
        other => format_name(other),
    }
}

/// Sniff the container format from the leading bytes
pub fn sniff(bytes: &[u8]) -> Result<ImageFormat> {
    let format = image::guess_format(bytes).map_err(|_| ShieldError::unsupported("unknown"))?;
    if !is_supported(format) {
        return Err(ShieldError::unsupported(format_name(format)));
    }
    Ok(format)
}

pub fn decode(bytes: &[u8]) -> Result<DecodedImage> {
    let format = sniff(bytes)?;
    let image = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| ShieldError::transform(TransformStage::Decode, e.to_string()))?;

    Ok(DecodedImage {
        has_alpha: image.color().has_alpha(),
        pixels: image.to_rgba8(),
        format,
    })
}

pub fn encode(pixels: &RgbaImage, format: ImageFormat, has_alpha: bool) -> Result<Vec<u8>> {
    if !is_supported(format) {
        return Err(ShieldError::unsupported(format_name(format)));
    }

    let rgba = DynamicImage::ImageRgba8(pixels.clone());
    let image = if has_alpha && keeps_alpha(format) {
        rgba
    } else {
        DynamicImage::ImageRgb8(rgba.to_rgb8())
    };

    let mut buffer = Cursor::new(Vec::new());
    let written = match format {
        ImageFormat::WebP => WebPEncoder::new_lossless(&mut buffer).encode(
            image.as_bytes(),
            image.width(),
            image.height(),
            image.color(),
        ),
        ImageFormat::Jpeg => image.write_to(&mut buffer, ImageOutputFormat::Jpeg(JPEG_QUALITY)),
        other => image.write_to(&mut buffer, ImageOutputFormat::from(other)),
    };
    written.map_err(|e| ShieldError::transform(TransformStage::Encode, e.to_string()))?;
    Ok(buffer.into_inner())
}

/// Write `bytes` to `path` through a temp file in the same directory
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| ShieldError::transform(TransformStage::Persist, "target has no parent directory"))?;
    std::fs::create_dir_all(dir)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".partial-")
        .tempfile_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|e| ShieldError::transform(TransformStage::Persist, e.to_string()))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use image::{ImageFormat, Rgba, RgbaImage};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Deterministic noise image
    pub fn noise(width: u32, height: u32, seed: u64) -> RgbaImage {
        let mut rng = StdRng::seed_from_u64(seed);
        RgbaImage::from_fn(width, height, |_, _| {
            Rgba([rng.gen(), rng.gen(), rng.gen(), 255])
        })
    }

    /// Horizontal gradient with a varying alpha channel
    pub fn gradient_with_alpha(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            let v = ((x * 255) / width.max(1)) as u8;
            Rgba([v, 255 - v, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    pub fn encoded(pixels: &RgbaImage, format: ImageFormat) -> Vec<u8> {
        super::encode(pixels, format, format != ImageFormat::Jpeg).unwrap()
    }

    pub fn png(width: u32, height: u32, seed: u64) -> Vec<u8> {
        encoded(&noise(width, height, seed), ImageFormat::Png)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_png_roundtrip_keeps_pixels_and_alpha() {
        let pixels = fixtures::gradient_with_alpha(17, 9);
        let bytes = encode(&pixels, ImageFormat::Png, true).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.format, ImageFormat::Png);
        assert!(decoded.has_alpha);
        assert_eq!(decoded.pixels, pixels);
    }

    #[test]
    fn test_opaque_png_stays_opaque() {
        let bytes = fixtures::encoded(&fixtures::noise(8, 8, 1), ImageFormat::Png);
        let bytes = encode(&decode(&bytes).unwrap().pixels, ImageFormat::Png, false).unwrap();
        assert!(!decode(&bytes).unwrap().has_alpha);
    }

    #[test]
    fn test_jpeg_encodes_without_alpha() {
        let bytes = encode(&fixtures::noise(16, 16, 2), ImageFormat::Jpeg, true).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.format, ImageFormat::Jpeg);
        assert_eq!(decoded.pixels.dimensions(), (16, 16));
    }

    #[test]
    fn test_webp_roundtrip_is_supported() {
        let pixels = fixtures::gradient_with_alpha(13, 7);
        let bytes = encode(&pixels, ImageFormat::WebP, true).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.format, ImageFormat::WebP);
        assert!(decoded.has_alpha);
        assert_eq!(decoded.pixels, pixels);
        assert!(!is_lossless(ImageFormat::WebP));
        assert_eq!(extension(ImageFormat::WebP), "webp");
    }

    #[test]
    fn test_unknown_bytes_unsupported() {
        match decode(b"definitely not an image") {
            Err(ShieldError::UnsupportedFormat { .. }) => {}
            other => panic!("unexpected {:?}", other.map(|d| d.format)),
        }
    }

    #[test]
    fn test_truncated_png_is_decode_failure() {
        let bytes = fixtures::png(32, 32, 3);
        match decode(&bytes[..bytes.len() / 2]) {
            Err(ShieldError::TransformFailure { stage, .. }) => assert_eq!(stage, TransformStage::Decode),
            other => panic!("unexpected {:?}", other.map(|d| d.format)),
        }
    }

    #[test]
    fn test_write_atomic_leaves_no_partials() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested").join("out.bin");
        write_atomic(&target, b"one").unwrap();
        write_atomic(&target, b"two").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"two");

        let names: Vec<_> = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }
}
