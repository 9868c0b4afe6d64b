//! Blur engine and intensity presets

use std::path::Path;

use image::{ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::imaging;

/// Brightness offset of the extreme tone reduction
const EXTREME_BRIGHTNESS: f32 = -30.0;
/// Contrast scale around mid-grey of the extreme tone reduction
const EXTREME_CONTRAST: f32 = 0.8;
/// Blur passes run after the tone reduction
const EXTREME_SETTLE_PASSES: u32 = 10;

/// Named blur strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BlurIntensity {
    Light,
    Medium,
    Heavy,
    #[default]
    Extreme,
}

impl BlurIntensity {
    pub const ALL: [BlurIntensity; 4] = [
        BlurIntensity::Light,
        BlurIntensity::Medium,
        BlurIntensity::Heavy,
        BlurIntensity::Extreme,
    ];

    pub fn profile(self) -> BlurProfile {
        match self {
            BlurIntensity::Light => BlurProfile::new(10, 0.005),
            BlurIntensity::Medium => BlurProfile::new(15, 0.01),
            BlurIntensity::Heavy => BlurProfile::new(25, 0.015),
            BlurIntensity::Extreme => BlurProfile {
                tone_reduction: true,
                ..BlurProfile::new(35, 0.02)
            },
        }
    }
}

/// Concrete blur parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlurProfile {
    /// Number of box passes
    pub iterations: u32,
    /// Kernel radius as a fraction of the shorter image side
    pub factor: f32,
    /// Darken and flatten after blurring
    pub tone_reduction: bool,
}

impl BlurProfile {
    pub fn new(iterations: u32, factor: f32) -> Self {
        Self {
            iterations,
            factor,
            tone_reduction: false,
        }
    }

    /// Kernel radius in pixels, at least 1
    pub fn radius_for(&self, width: u32, height: u32) -> u32 {
        let shorter = width.min(height) as f32;
        ((shorter * self.factor).round() as u32).max(1)
    }
}

/// A re-encoded derivative
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

impl EncodedImage {
    pub fn mime_type(&self) -> &'static str {
        imaging::mime_type(self.format)
    }

    pub fn extension(&self) -> &'static str {
        imaging::extension(self.format)
    }
}

/// Produces blurred derivatives at a fixed profile
#[derive(Debug, Clone, Copy)]
pub struct BlurEngine {
    profile: BlurProfile,
}

impl BlurEngine {
    pub fn new(intensity: BlurIntensity) -> Self {
        Self {
            profile: intensity.profile(),
        }
    }

    pub fn with_profile(profile: BlurProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> BlurProfile {
        self.profile
    }

    pub fn blur(&self, pixels: &RgbaImage) -> RgbaImage {
        blur_pixels(pixels, &self.profile)
    }

    /// Decode, blur and re-encode in the source container format
    pub fn blur_bytes(&self, source: &[u8]) -> Result<EncodedImage> {
        let decoded = imaging::decode(source)?;
        let blurred = self.blur(&decoded.pixels);
        let bytes = imaging::encode(&blurred, decoded.format, decoded.has_alpha)?;
        Ok(EncodedImage {
            bytes,
            format: decoded.format,
        })
    }

    /// Blur `source` and atomically write the result to `target`
    pub fn blur_to_path(&self, source: &[u8], target: &Path) -> Result<ImageFormat> {
        let encoded = self.blur_bytes(source)?;
        imaging::write_atomic(target, &encoded.bytes)?;
        Ok(encoded.format)
    }
}

/// Blur the RGB channels of `source`; dimensions and alpha are preserved
pub fn blur_pixels(source: &RgbaImage, profile: &BlurProfile) -> RgbaImage {
    let (width, height) = source.dimensions();
    let mut output = source.clone();
    if width == 0 || height == 0 {
        return output;
    }

    let radius = profile.radius_for(width, height) as usize;
    let (w, h) = (width as usize, height as usize);
    let data: &mut [u8] = &mut output;

    for _ in 0..profile.iterations {
        box_pass(data, w, h, radius);
    }

    if profile.tone_reduction {
        reduce_tone(data);
        for _ in 0..EXTREME_SETTLE_PASSES {
            box_pass(data, w, h, radius);
        }
    }

    output
}

fn box_pass(data: &mut [u8], width: usize, height: usize, radius: usize) {
    let mut prefix = vec![0u32; width.max(height) + 1];

    for y in 0..height {
        let row = y * width;
        for channel in 0..3 {
            blur_line(data, width, radius, &mut prefix, |x| (row + x) * 4 + channel);
        }
    }

    for x in 0..width {
        for channel in 0..3 {
            blur_line(data, height, radius, &mut prefix, |y| (y * width + x) * 4 + channel);
        }
    }
}

/// Replace each sample of one line with the mean of its clamped window
fn blur_line<F>(data: &mut [u8], len: usize, radius: usize, prefix: &mut [u32], index: F)
where
    F: Fn(usize) -> usize,
{
    prefix[0] = 0;
    for i in 0..len {
        prefix[i + 1] = prefix[i] + u32::from(data[index(i)]);
    }

    for i in 0..len {
        let lo = i.saturating_sub(radius);
        let hi = (i + radius).min(len - 1);
        let count = (hi - lo + 1) as u32;
        let sum = prefix[hi + 1] - prefix[lo];
        data[index(i)] = ((sum + count / 2) / count) as u8;
    }
}

fn reduce_tone(data: &mut [u8]) {
    for pixel in data.chunks_exact_mut(4) {
        for value in &mut pixel[..3] {
            let adjusted = (f32::from(*value) - 128.0) * EXTREME_CONTRAST + 128.0 + EXTREME_BRIGHTNESS;
            *value = adjusted.round().clamp(0.0, 255.0) as u8;
        }
    }
}
