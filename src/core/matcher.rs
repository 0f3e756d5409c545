use serde::{Deserialize, Serialize};

use crate::core::features::{hamming_distance, pixel_similarity, Analysis};

/// Hash distance recorded for candidates that could not be read.
pub const UNREADABLE_HASH_DISTANCE: u32 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPair {
    /// Maximum Hamming distance counted as a hash match.
    pub hash: u32,
    /// Minimum pixel similarity counted as a pixel match.
    pub pixel: f64,
}

/// Cut-offs for both reference kinds. Placeholders are homogeneous, so their
/// pair is stricter on pixels and looser on hash noise.
///
/// Deserialising fills any missing field from that side's default, so
/// `[thresholds.real] hash = 6` keeps the stock real pixel cut-off.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "ThresholdOverrides")]
pub struct Thresholds {
    pub placeholder: ThresholdPair,
    pub real: ThresholdPair,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            placeholder: ThresholdPair {
                hash: 12,
                pixel: 0.82,
            },
            real: ThresholdPair {
                hash: 8,
                pixel: 0.88,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PairOverride {
    hash: Option<u32>,
    pixel: Option<f64>,
}

impl PairOverride {
    fn over(self, base: ThresholdPair) -> ThresholdPair {
        ThresholdPair {
            hash: self.hash.unwrap_or(base.hash),
            pixel: self.pixel.unwrap_or(base.pixel),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ThresholdOverrides {
    placeholder: PairOverride,
    real: PairOverride,
}

impl From<ThresholdOverrides> for Thresholds {
    fn from(overrides: ThresholdOverrides) -> Self {
        let base = Thresholds::default();
        Self {
            placeholder: overrides.placeholder.over(base.placeholder),
            real: overrides.real.over(base.real),
        }
    }
}

impl Thresholds {
    pub fn for_reference(&self, reference_is_placeholder: bool) -> ThresholdPair {
        if reference_is_placeholder {
            self.placeholder
        } else {
            self.real
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    PlaceholderVisual,
    HashMatch,
    PixelMatch,
}

impl MatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchReason::PlaceholderVisual => "placeholder_visual",
            MatchReason::HashMatch => "hash_match",
            MatchReason::PixelMatch => "pixel_match",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOutcome {
    pub hash_distance: u32,
    pub pixel_similarity: f64,
    pub matched: bool,
    pub reason: Option<MatchReason>,
}

impl MatchOutcome {
    /// Outcome for a candidate that failed to download or decode: never a match.
    pub fn unreadable() -> Self {
        Self {
            hash_distance: UNREADABLE_HASH_DISTANCE,
            pixel_similarity: 0.0,
            matched: false,
            reason: None,
        }
    }
}

/// One scanned candidate as it appears in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub key: String,
    pub filename: String,
    /// 1-based position in the scan; used to disambiguate destination names.
    #[serde(default)]
    pub index: usize,
    #[serde(rename = "hash_dist")]
    pub hash_distance: u32,
    #[serde(rename = "pixel_sim")]
    pub pixel_similarity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<MatchReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MatchRecord {
    pub fn new(key: &str, index: usize, outcome: &MatchOutcome) -> Self {
        Self {
            key: key.to_string(),
            filename: crate::core::image::file_name(key).to_string(),
            index,
            hash_distance: outcome.hash_distance,
            pixel_similarity: (outcome.pixel_similarity * 10_000.0).round() / 10_000.0,
            reason: outcome.reason,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn matched(&self) -> bool {
        self.reason.is_some()
    }
}

/// Decide whether `candidate` belongs with `reference`.
///
/// A match is any of: hash distance within the cut-off, pixel similarity at or
/// above the cut-off, or both images being placeholders. The reason reports the
/// first of placeholder, hash, pixel that holds.
pub fn compare(
    reference: &Analysis,
    candidate: &Analysis,
    thresholds: &Thresholds,
) -> MatchOutcome {
    let reference_is_placeholder = reference.fingerprint.is_placeholder;
    let pair = thresholds.for_reference(reference_is_placeholder);

    let hash_distance = hamming_distance(
        reference.fingerprint.perceptual_hash,
        candidate.fingerprint.perceptual_hash,
    );
    let pixel_similarity = pixel_similarity(&reference.sample, &candidate.sample);

    let placeholder_pair = reference_is_placeholder && candidate.fingerprint.is_placeholder;
    let reason = if placeholder_pair {
        Some(MatchReason::PlaceholderVisual)
    } else if hash_distance <= pair.hash {
        Some(MatchReason::HashMatch)
    } else if pixel_similarity >= pair.pixel {
        Some(MatchReason::PixelMatch)
    } else {
        None
    };

    MatchOutcome {
        hash_distance,
        pixel_similarity,
        matched: reason.is_some(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::{GreySample, ImageFingerprint};

    fn analysis(hash: u64, grey: u8, placeholder: bool) -> Analysis {
        Analysis {
            fingerprint: ImageFingerprint {
                average_hue: 0.0,
                average_saturation: 0.0,
                average_value: 0.0,
                edge_score: 0.0,
                perceptual_hash: hash,
                is_placeholder: placeholder,
            },
            sample: GreySample {
                size: 2,
                pixels: vec![grey; 4],
            },
            aspect_ratio: 1.0,
        }
    }

    #[test]
    fn test_hash_match_within_threshold() {
        let reference = analysis(0, 0, false);
        let candidate = analysis(0xFF, 255, false); // 8 bits apart

        let outcome = compare(&reference, &candidate, &Thresholds::default());
        assert!(outcome.matched);
        assert_eq!(outcome.hash_distance, 8);
        assert_eq!(outcome.reason, Some(MatchReason::HashMatch));
    }

    #[test]
    fn test_pixel_match_when_hash_differs() {
        let reference = analysis(0, 100, false);
        let candidate = analysis(u64::MAX, 110, false);

        let outcome = compare(&reference, &candidate, &Thresholds::default());
        assert!(outcome.matched);
        assert_eq!(outcome.reason, Some(MatchReason::PixelMatch));
        assert!(outcome.pixel_similarity > 0.95);
    }

    #[test]
    fn test_no_match() {
        let reference = analysis(0, 0, false);
        let candidate = analysis(0x1FF, 255, false); // 9 bits apart

        let outcome = compare(&reference, &candidate, &Thresholds::default());
        assert!(!outcome.matched);
        assert_eq!(outcome.reason, None);
    }

    #[test]
    fn test_placeholder_reference_uses_looser_hash_cutoff() {
        let candidate = analysis(0xFFF, 255, false); // 12 bits apart

        let real = compare(&analysis(0, 0, false), &candidate, &Thresholds::default());
        assert!(!real.matched);

        let placeholder = compare(&analysis(0, 0, true), &candidate, &Thresholds::default());
        assert_eq!(placeholder.reason, Some(MatchReason::HashMatch));
    }

    #[test]
    fn test_two_placeholders_match_first() {
        // Unrelated flat images still pair up when both are placeholders.
        let reference = analysis(0, 0, true);
        let candidate = analysis(0, 255, true);

        let outcome = compare(&reference, &candidate, &Thresholds::default());
        assert_eq!(outcome.reason, Some(MatchReason::PlaceholderVisual));
    }

    #[test]
    fn test_placeholder_candidate_ignored_for_real_reference() {
        let reference = analysis(0, 0, false);
        let candidate = analysis(u64::MAX, 255, true);

        assert!(!compare(&reference, &candidate, &Thresholds::default()).matched);
    }

    #[test]
    fn test_unreadable_outcome() {
        let outcome = MatchOutcome::unreadable();
        assert!(!outcome.matched);
        assert_eq!(outcome.hash_distance, UNREADABLE_HASH_DISTANCE);
    }

    #[test]
    fn test_partial_thresholds_keep_defaults() {
        let thresholds: Thresholds = serde_json::from_str(r#"{"real": {"hash": 6}}"#).unwrap();
        assert_eq!(thresholds.real, ThresholdPair { hash: 6, pixel: 0.88 });
        assert_eq!(thresholds.placeholder, Thresholds::default().placeholder);

        let empty: Thresholds = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, Thresholds::default());

        let text = serde_json::to_string(&Thresholds::default()).unwrap();
        assert_eq!(serde_json::from_str::<Thresholds>(&text).unwrap(), Thresholds::default());
    }

    #[test]
    fn test_record_wire_names() {
        let outcome = MatchOutcome {
            hash_distance: 3,
            pixel_similarity: 0.912345,
            matched: true,
            reason: Some(MatchReason::HashMatch),
        };
        let record = MatchRecord::new("src/a.jpg", 2, &outcome);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["key"], "src/a.jpg");
        assert_eq!(json["filename"], "a.jpg");
        assert_eq!(json["hash_dist"], 3);
        assert_eq!(json["pixel_sim"], 0.9123);
        assert_eq!(json["reason"], "hash_match");
        assert!(json.get("error").is_none());
    }
}
