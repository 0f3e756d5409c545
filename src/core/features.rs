use image::imageops::{self, FilterType};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::core::ocr::{contains_placeholder_phrase, TextRecognizer};

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("Image decode failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Image has no pixels")]
    EmptyImage,
}

/// Side length of the grid used for the average colour.
pub const HSV_GRID: u32 = 60;
/// Side length of the grid used for the texture score.
pub const EDGE_GRID: u32 = 80;
/// Rows of the difference hash; the grid is one column wider.
pub const HASH_SIZE: u32 = 8;
/// Side length of the greyscale sample compared pixel-by-pixel.
pub const SAMPLE_GRID: u32 = 32;

const PLACEHOLDER_COLOR_GRID: u32 = 120;
const PLACEHOLDER_TONE_GRID: u32 = 100;
const COLOR_BUCKET: u8 = 20;

/// Per-image statistics everything downstream works from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageFingerprint {
    /// Degrees, `[0, 360)`.
    pub average_hue: f64,
    pub average_saturation: f64,
    pub average_value: f64,
    /// Population standard deviation of grey intensity.
    pub edge_score: f64,
    /// Difference hash; only meaningful through [`hamming_distance`].
    pub perceptual_hash: u64,
    pub is_placeholder: bool,
}

/// Small greyscale thumbnail used for pixel similarity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreySample {
    pub size: u32,
    pub pixels: Vec<u8>,
}

/// The four independent blank-image heuristics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaceholderSignals {
    /// One quantised colour covers more than half the image.
    pub dominant_color: bool,
    /// Edge score below 14.
    pub flat: bool,
    /// Plain background with a lightly textured overlay.
    pub plain_textured: bool,
    /// Plain, mostly white background with a little dark ink.
    pub sparse_ink: bool,
}

impl PlaceholderSignals {
    pub fn count(&self) -> usize {
        [self.dominant_color, self.flat, self.plain_textured, self.sparse_ink]
            .iter()
            .filter(|s| **s)
            .count()
    }

    pub fn is_placeholder(&self) -> bool {
        self.count() >= 2
    }
}

/// Everything extracted from one decoded image.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub fingerprint: ImageFingerprint,
    pub sample: GreySample,
    pub aspect_ratio: f64,
}

/// Computes fingerprints from decoded images. Pure apart from the optional
/// text-recognition pass.
#[derive(Clone, Default)]
pub struct FeatureExtractor {
    recognizer: Option<Arc<dyn TextRecognizer>>,
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self { recognizer: None }
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn TextRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn has_recognizer(&self) -> bool {
        self.recognizer.is_some()
    }

    /// Fingerprint, grey sample and aspect ratio. `use_text` enables the
    /// text-recognition fallback when the pixel heuristics say "not a placeholder".
    pub fn analyze(&self, img: &DynamicImage, use_text: bool) -> Analysis {
        Analysis {
            fingerprint: self.fingerprint(img, use_text),
            sample: self.grey_sample(img),
            aspect_ratio: crate::core::image::aspect_ratio(img),
        }
    }

    pub fn fingerprint(&self, img: &DynamicImage, use_text: bool) -> ImageFingerprint {
        let (average_hue, average_saturation, average_value) = self.average_hsv(img);
        let edge_score = self.edge_score(img);
        let perceptual_hash = self.difference_hash(img);

        let mut is_placeholder = self.placeholder_signals(img, edge_score).is_placeholder();
        if !is_placeholder && use_text {
            is_placeholder = self.recognizes_placeholder_text(img);
        }

        ImageFingerprint {
            average_hue,
            average_saturation,
            average_value,
            edge_score,
            perceptual_hash,
            is_placeholder,
        }
    }

    /// Mean hue (degrees), saturation and value over a Lanczos-downsampled grid.
    pub fn average_hsv(&self, img: &DynamicImage) -> (f64, f64, f64) {
        let small = imageops::resize(&img.to_rgb8(), HSV_GRID, HSV_GRID, FilterType::Lanczos3);
        let n = (HSV_GRID * HSV_GRID) as f64;

        let (mut h_sum, mut s_sum, mut v_sum) = (0.0, 0.0, 0.0);
        for pixel in small.pixels() {
            let (h, s, v) = rgb_to_hsv(pixel[0], pixel[1], pixel[2]);
            h_sum += h;
            s_sum += s;
            v_sum += v;
        }

        (h_sum / n, s_sum / n, v_sum / n)
    }

    /// Standard deviation of grey intensity: flat images score low, busy ones high.
    pub fn edge_score(&self, img: &DynamicImage) -> f64 {
        let grey = imageops::resize(&img.to_luma8(), EDGE_GRID, EDGE_GRID, FilterType::Lanczos3);
        population_std(grey.as_raw())
    }

    /// 64-bit difference hash: bit `i` is set when the `i`-th horizontal
    /// neighbour pair of a 9x8 grey grid is ascending.
    pub fn difference_hash(&self, img: &DynamicImage) -> u64 {
        let grey = imageops::resize(
            &img.to_luma8(),
            HASH_SIZE + 1,
            HASH_SIZE,
            FilterType::Lanczos3,
        );

        let mut hash = 0u64;
        let mut bit = 0u32;
        for y in 0..HASH_SIZE {
            for x in 0..HASH_SIZE {
                let left = grey.get_pixel(x, y)[0];
                let right = grey.get_pixel(x + 1, y)[0];
                if left < right {
                    hash |= 1u64 << bit;
                }
                bit += 1;
            }
        }
        hash
    }

    pub fn grey_sample(&self, img: &DynamicImage) -> GreySample {
        let grey = imageops::resize(&img.to_luma8(), SAMPLE_GRID, SAMPLE_GRID, FilterType::Lanczos3);
        GreySample {
            size: SAMPLE_GRID,
            pixels: grey.into_raw(),
        }
    }

    pub fn placeholder_signals(&self, img: &DynamicImage, edge_score: f64) -> PlaceholderSignals {
        let rgb = imageops::resize(
            &img.to_rgb8(),
            PLACEHOLDER_COLOR_GRID,
            PLACEHOLDER_COLOR_GRID,
            FilterType::CatmullRom,
        );
        let n = (PLACEHOLDER_COLOR_GRID * PLACEHOLDER_COLOR_GRID) as f64;

        let (mut r_sum, mut g_sum, mut b_sum) = (0.0, 0.0, 0.0);
        let mut buckets: HashMap<[u8; 3], usize> = HashMap::new();
        for pixel in rgb.pixels() {
            r_sum += pixel[0] as f64;
            g_sum += pixel[1] as f64;
            b_sum += pixel[2] as f64;
            let bucket = [
                pixel[0] / COLOR_BUCKET * COLOR_BUCKET,
                pixel[1] / COLOR_BUCKET * COLOR_BUCKET,
                pixel[2] / COLOR_BUCKET * COLOR_BUCKET,
            ];
            *buckets.entry(bucket).or_insert(0) += 1;
        }
        let (avg_r, avg_g, avg_b) = (r_sum / n, g_sum / n, b_sum / n);

        let light_bg = avg_r > 190.0 && avg_g > 190.0 && avg_b > 190.0;
        let grey_bg =
            (avg_r - avg_g).abs() < 25.0 && (avg_g - avg_b).abs() < 25.0 && avg_r > 150.0;
        let plain_bg = light_bg || grey_bg;

        let top = buckets.values().copied().max().unwrap_or(0) as f64;

        let tones = imageops::resize(
            &img.to_luma8(),
            PLACEHOLDER_TONE_GRID,
            PLACEHOLDER_TONE_GRID,
            FilterType::Lanczos3,
        );
        let total = tones.as_raw().len() as f64;
        let light_ratio = tones.as_raw().iter().filter(|v| **v > 220).count() as f64 / total;
        let dark_ratio = tones.as_raw().iter().filter(|v| **v < 60).count() as f64 / total;

        PlaceholderSignals {
            dominant_color: top / n > 0.50,
            flat: edge_score < 14.0,
            plain_textured: plain_bg && (10.0..=40.0).contains(&edge_score),
            sparse_ink: plain_bg && light_ratio > 0.55 && (0.01..=0.35).contains(&dark_ratio),
        }
    }

    fn recognizes_placeholder_text(&self, img: &DynamicImage) -> bool {
        let Some(recognizer) = &self.recognizer else {
            return false;
        };
        match recognizer.recognize(img) {
            Ok(text) => contains_placeholder_phrase(&text),
            Err(e) => {
                log::debug!("Text recognition skipped: {}", e);
                false
            }
        }
    }
}

/// Number of differing bits between two hashes.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// `1 - mean|a - b| / 255` over two samples of the same grid size.
pub fn pixel_similarity(a: &GreySample, b: &GreySample) -> f64 {
    if a.size != b.size || a.pixels.is_empty() || a.pixels.len() != b.pixels.len() {
        return 0.0;
    }
    let total: u64 = a
        .pixels
        .iter()
        .zip(&b.pixels)
        .map(|(x, y)| (*x as i32 - *y as i32).unsigned_abs() as u64)
        .sum();
    1.0 - total as f64 / (255.0 * a.pixels.len() as f64)
}

/// Hue in degrees `[0, 360)`, saturation and value in `[0, 1]`.
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f64, f64, f64) {
    let (r, g, b) = (r as f64 / 255.0, g as f64 / 255.0, b as f64 / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let saturation = if max == 0.0 { 0.0 } else { delta / max };

    (hue % 360.0, saturation, max)
}

fn population_std(values: &[u8]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|v| *v as f64).sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|v| {
            let d = *v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    variance.sqrt()
}
