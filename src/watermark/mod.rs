//! Forensic Watermarking
//!
//! Marks images served to authenticated viewers so a leaked copy can be
//! traced back to its recipient. Methods, in priority order:
//! - Steganographic: payload framed into RGB least-significant bits (lossless containers)
//! - Metadata: payload in PNG text chunks
//! - Pixel perturbation: seeded ±1 adjustments at scattered coordinates
//! - Frequency blocks: seeded checkerboard in a subset of 8x8 blocks
//!
//! Embedding stacks every configured method that can apply. Extraction
//! reads the payload-carrying methods; the pattern methods are scored
//! against the unmarked original with [`WatermarkCodec::trace`].

mod ledger;
mod lsb;
mod metadata;
mod payload;
mod perturb;

pub use ledger::{LedgerResult, MemoryLedger, SqliteLedger, WatermarkLedger, WatermarkRecord};
pub use payload::{WatermarkId, WatermarkPayload, PAYLOAD_VERSION};
pub use perturb::MATCH_THRESHOLD;

use std::fmt;

use image::{ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::core::config::WatermarkConfig;
use crate::core::error::{Result, ShieldError, TransformStage};
use crate::imaging;

/// Default number of perturbed coordinates
pub const DEFAULT_PIXEL_POINTS: usize = 100;

/// A watermarking technique
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkMethod {
    Steganographic,
    Metadata,
    PixelPerturbation,
    FrequencyBlocks,
}

impl WatermarkMethod {
    /// All methods, highest priority first
    pub const PRIORITY: [WatermarkMethod; 4] = [
        WatermarkMethod::Steganographic,
        WatermarkMethod::Metadata,
        WatermarkMethod::PixelPerturbation,
        WatermarkMethod::FrequencyBlocks,
    ];

    /// Whether the full payload can be read back from a marked image
    pub fn carries_payload(self) -> bool {
        matches!(self, WatermarkMethod::Steganographic | WatermarkMethod::Metadata)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WatermarkMethod::Steganographic => "steganographic",
            WatermarkMethod::Metadata => "metadata",
            WatermarkMethod::PixelPerturbation => "pixel_perturbation",
            WatermarkMethod::FrequencyBlocks => "frequency_blocks",
        }
    }

    fn priority(self) -> usize {
        Self::PRIORITY.iter().position(|m| *m == self).unwrap_or(usize::MAX)
    }
}

impl fmt::Display for WatermarkMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WatermarkMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::PRIORITY
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown watermark method '{}'", s))
    }
}

/// Amplitude of the frequency-block pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkStrength {
    Light,
    #[default]
    Medium,
    Strong,
}

impl WatermarkStrength {
    pub fn amplitude(self) -> u8 {
        match self {
            WatermarkStrength::Light => 1,
            WatermarkStrength::Medium => 2,
            WatermarkStrength::Strong => 3,
        }
    }
}

/// Result of a successful embedding
#[derive(Debug, Clone)]
pub struct EmbeddedImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    /// Methods present in `bytes`, in priority order
    pub applied: Vec<WatermarkMethod>,
    /// Configured methods that could not apply, with the reason
    pub skipped: Vec<(WatermarkMethod, String)>,
}

impl EmbeddedImage {
    pub fn mime_type(&self) -> &'static str {
        imaging::mime_type(self.format)
    }

    pub fn extension(&self) -> &'static str {
        imaging::extension(self.format)
    }
}

/// A payload recovered from an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub method: WatermarkMethod,
    pub payload: WatermarkPayload,
}

/// Pattern scores of one candidate id against a suspect image
#[derive(Debug, Clone, PartialEq)]
pub struct TraceMatch {
    pub watermark_id: WatermarkId,
    pub pixel_score: Option<f64>,
    pub frequency_score: Option<f64>,
}

impl TraceMatch {
    pub fn best_score(&self) -> f64 {
        self.pixel_score
            .into_iter()
            .chain(self.frequency_score)
            .fold(f64::MIN, f64::max)
    }

    pub fn is_match(&self) -> bool {
        self.best_score() >= MATCH_THRESHOLD
    }
}

/// Multi-method watermark embedder and extractor
#[derive(Debug, Clone)]
pub struct WatermarkCodec {
    methods: Vec<WatermarkMethod>,
    strength: WatermarkStrength,
    pixel_points: usize,
}

impl Default for WatermarkCodec {
    fn default() -> Self {
        Self::new(WatermarkMethod::PRIORITY.to_vec())
    }
}

impl WatermarkCodec {
    /// Codec using `methods` in the given order; duplicates are dropped
    pub fn new(methods: Vec<WatermarkMethod>) -> Self {
        let mut unique = Vec::with_capacity(methods.len());
        for method in methods {
            if !unique.contains(&method) {
                unique.push(method);
            }
        }
        Self {
            methods: unique,
            strength: WatermarkStrength::default(),
            pixel_points: DEFAULT_PIXEL_POINTS,
        }
    }

    pub fn from_config(config: &WatermarkConfig) -> Self {
        Self::new(config.methods.clone())
            .with_strength(config.strength)
            .with_pixel_points(config.pixel_points)
    }

    pub fn with_strength(mut self, strength: WatermarkStrength) -> Self {
        self.strength = strength;
        self
    }

    pub fn with_pixel_points(mut self, points: usize) -> Self {
        self.pixel_points = points.max(1);
        self
    }

    pub fn methods(&self) -> &[WatermarkMethod] {
        &self.methods
    }

    fn enabled(&self, method: WatermarkMethod) -> bool {
        self.methods.contains(&method)
    }

    /// Embed `payload` into `source` with every applicable configured method
    pub fn embed(&self, source: &[u8], payload: &WatermarkPayload) -> Result<EmbeddedImage> {
        let decoded = imaging::decode(source)?;
        let payload_bytes = payload.to_bytes()?;
        let seed = payload.watermark_id.seed();

        let mut working = decoded.pixels;
        let mut applied = Vec::new();
        let mut skipped = Vec::new();

        // Lowest priority first so the LSB frame is written last
        let pixel_stages = [
            WatermarkMethod::FrequencyBlocks,
            WatermarkMethod::PixelPerturbation,
            WatermarkMethod::Steganographic,
        ];
        for method in pixel_stages.into_iter().filter(|m| self.enabled(*m)) {
            let mut candidate = working.clone();
            match self.apply_pixel_stage(method, &mut candidate, decoded.format, seed, &payload_bytes) {
                Ok(()) => {
                    working = candidate;
                    applied.push(method);
                }
                Err(reason) => skipped.push((method, reason)),
            }
        }

        let mut bytes = None;
        if self.enabled(WatermarkMethod::Metadata) {
            if decoded.format == ImageFormat::Png {
                match metadata::encode_png(&working, decoded.has_alpha, payload, &payload_bytes) {
                    Ok(encoded) => {
                        bytes = Some(encoded);
                        applied.push(WatermarkMethod::Metadata);
                    }
                    Err(e) => skipped.push((WatermarkMethod::Metadata, e.to_string())),
                }
            } else {
                skipped.push((
                    WatermarkMethod::Metadata,
                    format!("{} containers carry no text chunks", imaging::format_name(decoded.format)),
                ));
            }
        }
        let bytes = match bytes {
            Some(bytes) => bytes,
            None => imaging::encode(&working, decoded.format, decoded.has_alpha)?,
        };

        if applied.contains(&WatermarkMethod::Steganographic) && !Self::frame_survived(&bytes, payload) {
            applied.retain(|m| *m != WatermarkMethod::Steganographic);
            skipped.push((
                WatermarkMethod::Steganographic,
                "frame did not survive encoding".to_string(),
            ));
        }

        if applied.is_empty() {
            let reasons: Vec<String> = skipped.iter().map(|(m, r)| format!("{}: {}", m, r)).collect();
            return Err(ShieldError::transform(
                TransformStage::Watermark,
                format!("no method applied ({})", reasons.join("; ")),
            ));
        }

        applied.sort_by_key(|m| m.priority());
        Ok(EmbeddedImage {
            bytes,
            format: decoded.format,
            applied,
            skipped,
        })
    }

    fn apply_pixel_stage(
        &self,
        method: WatermarkMethod,
        pixels: &mut RgbaImage,
        format: ImageFormat,
        seed: u64,
        payload_bytes: &[u8],
    ) -> std::result::Result<(), String> {
        match method {
            WatermarkMethod::Steganographic => {
                if !imaging::is_lossless(format) {
                    return Err(format!("{} is a lossy container", imaging::format_name(format)));
                }
                lsb::embed(pixels, payload_bytes)
            }
            WatermarkMethod::PixelPerturbation => perturb::apply_pixels(pixels, seed, self.pixel_points),
            WatermarkMethod::FrequencyBlocks => {
                perturb::apply_frequency(pixels, seed, self.strength.amplitude())
            }
            WatermarkMethod::Metadata => Err("not a pixel-domain method".to_string()),
        }
    }

    fn frame_survived(bytes: &[u8], payload: &WatermarkPayload) -> bool {
        imaging::decode(bytes)
            .ok()
            .and_then(|decoded| lsb::extract(&decoded.pixels))
            .and_then(|frame| WatermarkPayload::from_bytes(&frame))
            .map_or(false, |found| &found == payload)
    }

    /// Recover a payload, trying payload-carrying methods in configured order
    pub fn extract(&self, bytes: &[u8]) -> Result<Option<Extraction>> {
        imaging::sniff(bytes)?;

        let mut pixels: Option<Option<RgbaImage>> = None;
        for method in self.methods.iter().copied().filter(|m| m.carries_payload()) {
            let payload = match method {
                WatermarkMethod::Steganographic => pixels
                    .get_or_insert_with(|| match imaging::decode(bytes) {
                        Ok(decoded) => Some(decoded.pixels),
                        Err(e) => {
                            tracing::debug!("Undecodable image during extraction: {}", e);
                            None
                        }
                    })
                    .as_ref()
                    .and_then(lsb::extract)
                    .and_then(|frame| WatermarkPayload::from_bytes(&frame)),
                WatermarkMethod::Metadata => metadata::read_payload(bytes),
                _ => None,
            };

            if let Some(payload) = payload {
                return Ok(Some(Extraction { method, payload }));
            }
        }
        Ok(None)
    }

    /// Score the pattern methods of each candidate id
    ///
    /// `reference` is the unmarked original the suspect was derived from.
    /// Candidates usually come from the ledger records of the item.
    pub fn trace(&self, suspect: &[u8], reference: &[u8], candidates: &[WatermarkId]) -> Result<Vec<TraceMatch>> {
        let suspect = imaging::decode(suspect)?.pixels;
        let reference = imaging::decode(reference)?.pixels;
        if suspect.dimensions() != reference.dimensions() {
            return Err(ShieldError::transform(
                TransformStage::Watermark,
                "suspect and reference dimensions differ",
            ));
        }

        let mut matches: Vec<TraceMatch> = candidates
            .iter()
            .map(|id| {
                let seed = id.seed();
                TraceMatch {
                    watermark_id: *id,
                    pixel_score: self
                        .enabled(WatermarkMethod::PixelPerturbation)
                        .then(|| perturb::score_pixels(&suspect, &reference, seed, self.pixel_points))
                        .flatten(),
                    frequency_score: self
                        .enabled(WatermarkMethod::FrequencyBlocks)
                        .then(|| perturb::score_frequency(&suspect, &reference, seed))
                        .flatten(),
                }
            })
            .collect();

        matches.sort_by(|a, b| b.best_score().total_cmp(&a.best_score()));
        Ok(matches)
    }
}
