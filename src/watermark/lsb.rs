//! Least-significant-bit framing over the RGB channels
//!
//! Frame layout: `b"FW"`, payload length as big-endian u16, payload bytes.
//! Bits are written MSB first into the LSB of R, G and B of each pixel in
//! row-major order. Alpha is never touched.

use image::RgbaImage;

const MAGIC: [u8; 2] = *b"FW";
const HEADER_LEN: usize = 4;

/// Bytes of frame the image can hold
pub fn capacity(pixels: &RgbaImage) -> usize {
    let (w, h) = pixels.dimensions();
    (w as usize * h as usize * 3) / 8
}

/// Frame bytes needed for a payload
pub fn frame_len(payload: &[u8]) -> usize {
    HEADER_LEN + payload.len()
}

pub fn embed(pixels: &mut RgbaImage, payload: &[u8]) -> Result<(), String> {
    let length = u16::try_from(payload.len())
        .map_err(|_| format!("payload of {} bytes exceeds frame limit", payload.len()))?;
    let needed = frame_len(payload);
    let available = capacity(pixels);
    if needed > available {
        return Err(format!("needs {} bytes, image holds {}", needed, available));
    }

    let mut frame = Vec::with_capacity(needed);
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(payload);

    let bits = frame
        .iter()
        .flat_map(|byte| (0..8).rev().map(move |shift| (byte >> shift) & 1));

    let data: &mut [u8] = pixels;
    let slots = data
        .chunks_exact_mut(4)
        .flat_map(|pixel| pixel.iter_mut().take(3));

    for (slot, bit) in slots.zip(bits) {
        *slot = (*slot & 0xFE) | bit;
    }
    Ok(())
}

/// Read a frame back; `None` when no valid frame is present
pub fn extract(pixels: &RgbaImage) -> Option<Vec<u8>> {
    let mut bits = pixels
        .as_raw()
        .chunks_exact(4)
        .flat_map(|pixel| pixel.iter().take(3))
        .map(|value| value & 1);

    let mut next_byte = || -> Option<u8> {
        let mut byte = 0u8;
        for _ in 0..8 {
            byte = (byte << 1) | bits.next()?;
        }
        Some(byte)
    };

    let magic = [next_byte()?, next_byte()?];
    if magic != MAGIC {
        return None;
    }
    let length = u16::from_be_bytes([next_byte()?, next_byte()?]) as usize;
    if HEADER_LEN + length > capacity(pixels) {
        return None;
    }

    (0..length).map(|_| next_byte()).collect()
}
