use serde::{Deserialize, Serialize};

use crate::core::features::ImageFingerprint;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    pub subcategory: String,
    pub tags: Vec<String>,
    pub description: String,
}

impl Classification {
    /// Result for an image that could not be read.
    pub fn unclassified(reason: impl Into<String>) -> Self {
        Self {
            category: "Unclassified".to_string(),
            subcategory: "Unknown".to_string(),
            tags: Vec::new(),
            description: reason.into(),
        }
    }
}

/// Bucketed view of a fingerprint that the rules are written against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Traits {
    pub hue: f64,
    pub saturation: f64,
    pub value: f64,
    pub green: bool,
    pub blue: bool,
    pub red: bool,
    pub brown: bool,
    pub grey: bool,
    pub bright: bool,
    pub dark: bool,
    pub colorful: bool,
    pub portrait: bool,
    pub square: bool,
    pub landscape: bool,
    pub complex: bool,
    pub simple: bool,
}

impl Traits {
    pub fn new(hue: f64, saturation: f64, value: f64, edge_score: f64, aspect_ratio: f64) -> Self {
        let hue_in = |lo: f64, hi: f64| lo <= hue && hue < hi;
        Self {
            hue,
            saturation,
            value,
            green: hue_in(70.0, 160.0),
            blue: hue_in(190.0, 260.0),
            red: hue_in(0.0, 20.0) || hue_in(340.0, 360.0),
            brown: hue_in(20.0, 40.0) && saturation < 0.5,
            grey: saturation < 0.12,
            bright: value > 0.55,
            dark: value < 0.35,
            colorful: saturation > 0.40,
            portrait: aspect_ratio < 0.80,
            square: (0.80..=1.35).contains(&aspect_ratio),
            landscape: aspect_ratio > 1.35,
            complex: edge_score > 38.0,
            simple: edge_score < 20.0,
        }
    }

    pub fn from_fingerprint(fingerprint: &ImageFingerprint, aspect_ratio: f64) -> Self {
        Self::new(
            fingerprint.average_hue,
            fingerprint.average_saturation,
            fingerprint.average_value,
            fingerprint.edge_score,
            aspect_ratio,
        )
    }
}

pub struct Rule {
    pub when: fn(&Traits) -> bool,
    pub category: &'static str,
    pub subcategory: &'static str,
    pub tags: &'static [&'static str],
}

/// Evaluated top to bottom; the first rule whose predicate holds wins.
pub const RULES: &[Rule] = &[
    Rule {
        when: |t| t.green && t.bright && t.landscape,
        category: "Nature",
        subcategory: "Forest",
        tags: &["green", "trees", "outdoor"],
    },
    Rule {
        when: |t| t.blue && t.bright && t.landscape && t.value > 0.6,
        category: "Nature",
        subcategory: "Sky",
        tags: &["blue", "sky", "outdoor"],
    },
    Rule {
        when: |t| t.blue && t.landscape && t.saturation > 0.3,
        category: "Nature",
        subcategory: "Beach",
        tags: &["water", "blue", "outdoor"],
    },
    Rule {
        when: |t| t.green && t.landscape,
        category: "Nature",
        subcategory: "Landscape",
        tags: &["green", "nature", "outdoor"],
    },
    Rule {
        when: |t| t.portrait && t.complex && !t.dark,
        category: "People",
        subcategory: "Portrait",
        tags: &["person", "portrait", "face"],
    },
    Rule {
        when: |t| t.square && t.complex && t.saturation < 0.3 && t.bright,
        category: "People",
        subcategory: "Portrait",
        tags: &["person", "monochrome"],
    },
    Rule {
        when: |t| (t.red || t.brown) && t.complex && t.square,
        category: "Food",
        subcategory: "Meal",
        tags: &["food", "plate", "colorful"],
    },
    Rule {
        when: |t| t.colorful && t.complex && t.square && !t.blue,
        category: "Food",
        subcategory: "Dish",
        tags: &["food", "colorful"],
    },
    Rule {
        when: |t| t.brown && t.complex && t.landscape,
        category: "Animals",
        subcategory: "Wildlife",
        tags: &["animal", "brown"],
    },
    Rule {
        when: |t| t.green && t.complex && t.square,
        category: "Animals",
        subcategory: "Wildlife",
        tags: &["animal", "nature"],
    },
    Rule {
        when: |t| t.grey && t.complex && t.portrait,
        category: "Architecture",
        subcategory: "Building",
        tags: &["building", "urban"],
    },
    Rule {
        when: |t| t.grey && t.complex && t.landscape,
        category: "Architecture",
        subcategory: "Cityscape",
        tags: &["city", "urban"],
    },
    Rule {
        when: |t| t.bright && t.complex && t.portrait,
        category: "Architecture",
        subcategory: "Structure",
        tags: &["building", "outdoor"],
    },
    Rule {
        when: |t| t.grey && t.landscape && t.simple,
        category: "Vehicles",
        subcategory: "Car",
        tags: &["vehicle", "grey"],
    },
    Rule {
        when: |t| t.dark && t.landscape && t.complex,
        category: "Vehicles",
        subcategory: "Transport",
        tags: &["vehicle", "dark"],
    },
    Rule {
        when: |t| t.dark && t.complex && t.blue,
        category: "Technology",
        subcategory: "Electronics",
        tags: &["tech", "screen"],
    },
    // Same predicate as Vehicles/Car above, so never reached; kept so the
    // table stays in step with existing outputs.
    Rule {
        when: |t| t.grey && t.simple && t.landscape,
        category: "Technology",
        subcategory: "Device",
        tags: &["device", "minimal"],
    },
    Rule {
        when: |t| t.colorful && t.complex && !t.bright,
        category: "Art",
        subcategory: "Painting",
        tags: &["art", "colorful"],
    },
    Rule {
        when: |t| t.colorful && t.simple,
        category: "Art",
        subcategory: "Abstract",
        tags: &["art", "abstract"],
    },
    // Shadowed by Nature/Landscape.
    Rule {
        when: |t| t.green && t.landscape && t.complex,
        category: "Sports",
        subcategory: "Outdoor",
        tags: &["sports", "field"],
    },
    Rule {
        when: |t| t.simple,
        category: "Abstract",
        subcategory: "Minimal",
        tags: &["minimal", "pattern"],
    },
];

pub const FALLBACK_CATEGORY: &str = "Abstract";
pub const FALLBACK_SUBCATEGORY: &str = "Pattern";
pub const FALLBACK_TAGS: &[&str] = &["pattern", "texture"];

/// Index into [`RULES`] of the first matching rule, `None` for the fallback.
pub fn matching_rule(traits: &Traits) -> Option<usize> {
    RULES.iter().position(|rule| (rule.when)(traits))
}

pub fn classify_traits(traits: &Traits) -> Classification {
    let (category, subcategory, tags) = match matching_rule(traits) {
        Some(i) => (RULES[i].category, RULES[i].subcategory, RULES[i].tags),
        None => (FALLBACK_CATEGORY, FALLBACK_SUBCATEGORY, FALLBACK_TAGS),
    };

    let description = format!(
        "{}, {} {}.",
        if traits.bright { "Bright" } else { "Dark" },
        if traits.colorful { "colorful" } else { "muted" },
        subcategory.to_lowercase()
    );

    Classification {
        category: category.to_string(),
        subcategory: subcategory.to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        description,
    }
}

pub fn classify(fingerprint: &ImageFingerprint, aspect_ratio: f64) -> Classification {
    classify_traits(&Traits::from_fingerprint(fingerprint, aspect_ratio))
}
