//! PNG text-chunk watermarking
//!
//! The payload travels base64-encoded in a `Comment` chunk, with readable
//! `Author`, `Copyright` and `Software` chunks alongside. Only PNG
//! containers carry these chunks; other formats fail the method.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::RgbaImage;

use super::payload::WatermarkPayload;

pub const COMMENT_KEY: &str = "Comment";
pub const AUTHOR_KEY: &str = "Author";
pub const COPYRIGHT_KEY: &str = "Copyright";
pub const SOFTWARE_KEY: &str = "Software";

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1A, b'\n'];

fn text_chunks(payload: &WatermarkPayload, payload_bytes: &[u8]) -> Vec<(String, String)> {
    vec![
        (COMMENT_KEY.to_string(), STANDARD.encode(payload_bytes)),
        (AUTHOR_KEY.to_string(), format!("viewer-{}", payload.viewer_id)),
        (COPYRIGHT_KEY.to_string(), format!("item-{}", payload.item_id)),
        (
            SOFTWARE_KEY.to_string(),
            format!("content-shield/{}", env!("CARGO_PKG_VERSION")),
        ),
    ]
}

/// Encode `pixels` as PNG with the payload in text chunks
pub fn encode_png(
    pixels: &RgbaImage,
    has_alpha: bool,
    payload: &WatermarkPayload,
    payload_bytes: &[u8],
) -> Result<Vec<u8>, png::EncodingError> {
    let (width, height) = pixels.dimensions();
    let data: Vec<u8> = if has_alpha {
        pixels.as_raw().clone()
    } else {
        pixels
            .as_raw()
            .chunks_exact(4)
            .flat_map(|px| px.iter().take(3).copied())
            .collect()
    };

    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_color(if has_alpha {
            png::ColorType::Rgba
        } else {
            png::ColorType::Rgb
        });
        encoder.set_depth(png::BitDepth::Eight);
        for (keyword, text) in text_chunks(payload, payload_bytes) {
            encoder.add_text_chunk(keyword, text)?;
        }

        let mut writer = encoder.write_header()?;
        writer.write_image_data(&data)?;
        writer.finish()?;
    }
    Ok(out)
}

/// Read the payload back from a PNG's text chunks
pub fn read_payload(bytes: &[u8]) -> Option<WatermarkPayload> {
    if !bytes.starts_with(&PNG_SIGNATURE) {
        return None;
    }

    let reader = png::Decoder::new(Cursor::new(bytes)).read_info().ok()?;
    let comment = reader
        .info()
        .uncompressed_latin1_text
        .iter()
        .find(|chunk| chunk.keyword == COMMENT_KEY)?;

    let raw = STANDARD.decode(comment.text.trim()).ok()?;
    WatermarkPayload::from_bytes(&raw)
}
