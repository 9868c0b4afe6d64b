//! Seeded pattern methods: pixel perturbation and frequency blocks
//!
//! Neither carries the payload. Both leave a pattern derived from the
//! watermark id that can be scored against the unmarked original when a
//! candidate id is known.

use image::RgbaImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Edge length of a frequency block
pub const BLOCK_SIZE: u32 = 8;
/// One block in this many carries the checkerboard
const BLOCK_SELECTION_RATIO: u32 = 8;

/// Score at or above which a pattern counts as present
pub const MATCH_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Point {
    x: u32,
    y: u32,
    delta: i16,
}

fn perturbation_points(seed: u64, width: u32, height: u32, count: usize) -> Vec<Point> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| Point {
            x: rng.gen_range(0..width),
            y: rng.gen_range(0..height),
            delta: if rng.gen::<bool>() { 1 } else { -1 },
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct Block {
    x: u32,
    y: u32,
    /// Checkerboard phase: `true` starts with a positive cell
    positive_first: bool,
}

fn selected_blocks(seed: u64, width: u32, height: u32) -> Vec<Block> {
    let mut rng = StdRng::seed_from_u64(seed.rotate_left(17) ^ 0x9E37_79B9_7F4A_7C15);
    let mut blocks = Vec::new();
    for by in 0..height / BLOCK_SIZE {
        for bx in 0..width / BLOCK_SIZE {
            let selected = rng.gen_ratio(1, BLOCK_SELECTION_RATIO);
            let positive_first = rng.gen::<bool>();
            if selected {
                blocks.push(Block {
                    x: bx * BLOCK_SIZE,
                    y: by * BLOCK_SIZE,
                    positive_first,
                });
            }
        }
    }
    blocks
}

fn cell_sign(block: &Block, dx: u32, dy: u32) -> i16 {
    let even = (dx + dy) % 2 == 0;
    if even == block.positive_first {
        1
    } else {
        -1
    }
}

fn adjust(value: u8, delta: i16) -> u8 {
    (i16::from(value) + delta).clamp(0, 255) as u8
}

fn rgb_diff(suspect: &RgbaImage, reference: &RgbaImage, x: u32, y: u32) -> [i16; 3] {
    let s = suspect.get_pixel(x, y).0;
    let r = reference.get_pixel(x, y).0;
    [
        i16::from(s[0]) - i16::from(r[0]),
        i16::from(s[1]) - i16::from(r[1]),
        i16::from(s[2]) - i16::from(r[2]),
    ]
}

/// Net agreement of `signs` over `total` samples, in [-1, 1]
fn agreement(signs: impl Iterator<Item = i32>, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let net: i64 = signs.map(|s| i64::from(s.signum())).sum();
    net as f64 / total as f64
}

pub fn apply_pixels(pixels: &mut RgbaImage, seed: u64, count: usize) -> Result<(), String> {
    let (width, height) = pixels.dimensions();
    if width == 0 || height == 0 {
        return Err("empty image".to_string());
    }
    for point in perturbation_points(seed, width, height, count) {
        let pixel = pixels.get_pixel_mut(point.x, point.y);
        for channel in &mut pixel.0[..3] {
            *channel = adjust(*channel, point.delta);
        }
    }
    Ok(())
}

pub fn apply_frequency(pixels: &mut RgbaImage, seed: u64, amplitude: u8) -> Result<(), String> {
    let (width, height) = pixels.dimensions();
    let blocks = selected_blocks(seed, width, height);
    if blocks.is_empty() {
        return Err(format!("{}x{} image has no selectable {}px blocks", width, height, BLOCK_SIZE));
    }
    let amplitude = i16::from(amplitude);
    for block in &blocks {
        for dy in 0..BLOCK_SIZE {
            for dx in 0..BLOCK_SIZE {
                let delta = cell_sign(block, dx, dy) * amplitude;
                let pixel = pixels.get_pixel_mut(block.x + dx, block.y + dy);
                for channel in &mut pixel.0[..3] {
                    *channel = adjust(*channel, delta);
                }
            }
        }
    }
    Ok(())
}

/// Agreement between the pixel pattern of `seed` and `suspect - reference`
pub fn score_pixels(suspect: &RgbaImage, reference: &RgbaImage, seed: u64, count: usize) -> Option<f64> {
    let (width, height) = reference.dimensions();
    if suspect.dimensions() != (width, height) || width == 0 || height == 0 {
        return None;
    }
    let points = perturbation_points(seed, width, height, count);
    let signs = points.iter().map(|p| {
        let diff = rgb_diff(suspect, reference, p.x, p.y);
        diff.iter().map(|d| i32::from(*d) * i32::from(p.delta)).sum::<i32>()
    });
    Some(agreement(signs, points.len()))
}

/// Agreement between the block checkerboard of `seed` and `suspect - reference`
pub fn score_frequency(suspect: &RgbaImage, reference: &RgbaImage, seed: u64) -> Option<f64> {
    let (width, height) = reference.dimensions();
    if suspect.dimensions() != (width, height) {
        return None;
    }
    let blocks = selected_blocks(seed, width, height);
    if blocks.is_empty() {
        return None;
    }
    let cells = blocks.iter().flat_map(|block| {
        (0..BLOCK_SIZE).flat_map(move |dy| (0..BLOCK_SIZE).map(move |dx| (*block, dx, dy)))
    });
    let signs = cells.map(|(block, dx, dy)| {
        let diff = rgb_diff(suspect, reference, block.x + dx, block.y + dy);
        let sign = i32::from(cell_sign(&block, dx, dy));
        diff.iter().map(|d| i32::from(*d) * sign).sum::<i32>()
    });
    let total = blocks.len() * (BLOCK_SIZE * BLOCK_SIZE) as usize;
    Some(agreement(signs, total))
}
