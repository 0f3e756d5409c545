use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::core::classifier::{classify, Classification};
use crate::core::features::{Analysis, FeatureError};
use crate::core::grouping::{destination_prefix, reference_group, scope_prefix};
use crate::core::image::{decode, is_supported};
use crate::core::matcher::{compare, MatchOutcome, MatchRecord};
use crate::services::context::{Phase, RunContext};
use crate::services::store::{key_from_input, ObjectStore, StoreError};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("No bucket configured")]
    MissingBucket,

    #[error("No direct images found in {folder:?}")]
    EmptyCorpus { folder: String },

    #[error("Reference image could not be decoded: {0}")]
    ReferenceDecode(#[source] FeatureError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Inconsistent plan: {0}")]
    Inconsistent(String),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Reference image bytes plus a label for the audit trail.
#[derive(Debug, Clone)]
pub struct Reference {
    pub bytes: Vec<u8>,
    pub label: String,
}

impl Reference {
    pub fn from_bytes(bytes: Vec<u8>, label: impl Into<String>) -> Self {
        Self {
            bytes,
            label: label.into(),
        }
    }

    /// Fetch a reference named by key, `/key` or a URL into `bucket`.
    pub fn from_store(store: &dyn ObjectStore, bucket: &str, input: &str) -> Result<Self, PlanError> {
        let key = key_from_input(input, bucket)?;
        let bytes = store.get(bucket, &key)?;
        Ok(Self { bytes, label: key })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    Placeholder,
    Real,
}

/// Preview result: which direct members of `folder` move to `dest_folder`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub bucket: String,
    pub folder: String,
    pub dest_folder: String,
    pub reference_type: ReferenceKind,
    /// Destination sub-folder name, e.g. `nature_forest` or `no_image`.
    pub reference_class: String,
    #[serde(default)]
    pub reference_image: Option<String>,
    pub total_scanned: usize,
    pub to_move_count: usize,
    pub to_stay_count: usize,
    pub to_move: Vec<MatchRecord>,
    pub to_stay: Vec<MatchRecord>,
}

impl Plan {
    pub fn reference_is_placeholder(&self) -> bool {
        self.reference_type == ReferenceKind::Placeholder
    }

    /// Check a plan (typically one read back from disk) before anything acts on it.
    pub fn validate(&self) -> Result<(), PlanError> {
        let fail = |msg: String| Err(PlanError::Inconsistent(msg));

        if self.bucket.trim().is_empty() {
            return Err(PlanError::MissingBucket);
        }
        if self.to_move_count != self.to_move.len() {
            return fail(format!(
                "to_move_count is {} but {} records are listed",
                self.to_move_count,
                self.to_move.len()
            ));
        }
        if self.to_stay_count != self.to_stay.len() {
            return fail(format!(
                "to_stay_count is {} but {} records are listed",
                self.to_stay_count,
                self.to_stay.len()
            ));
        }
        if self.to_move.len() + self.to_stay.len() != self.total_scanned {
            return fail(format!(
                "{} + {} records do not cover {} scanned",
                self.to_move.len(),
                self.to_stay.len(),
                self.total_scanned
            ));
        }
        let scope = scope_prefix(&self.folder);
        if self.dest_folder != destination_prefix(&scope, &self.reference_class)
            || self.reference_class.trim_matches('/').is_empty()
        {
            return fail(format!(
                "destination {:?} does not match folder {:?} and class {:?}",
                self.dest_folder, self.folder, self.reference_class
            ));
        }

        let mut keys = HashSet::new();
        let mut filenames = HashSet::new();
        for record in self.to_move.iter().chain(&self.to_stay) {
            // Only direct members of the folder; never anything nested or elsewhere.
            match record.key.strip_prefix(scope.as_str()) {
                Some(name) if !name.is_empty() && !name.contains('/') && name == record.filename => {}
                _ => {
                    return fail(format!(
                        "{} is not a direct member of {:?}",
                        record.key, self.folder
                    ));
                }
            }
            if !keys.insert(record.key.as_str()) {
                return fail(format!("{} listed twice", record.key));
            }
            if !filenames.insert(record.filename.as_str()) {
                return fail(format!("filename {} listed twice", record.filename));
            }
        }
        if let Some(record) = self.to_move.iter().find(|r| !r.matched()) {
            return fail(format!("{} is scheduled to move without a match reason", record.key));
        }
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        serde_json::from_str(json).map_err(|e| PlanError::Inconsistent(e.to_string()))
    }
}

/// Image keys exactly one segment below `folder`, sorted.
pub fn direct_members(
    store: &dyn ObjectStore,
    bucket: &str,
    folder: &str,
) -> Result<Vec<String>, StoreError> {
    let base = scope_prefix(folder);
    let mut keys: Vec<String> = store
        .list(bucket, &base)?
        .into_iter()
        .filter(|key| {
            key.strip_prefix(base.as_str())
                .map(|rest| !rest.is_empty() && !rest.contains('/'))
                .unwrap_or(false)
        })
        .filter(|key| is_supported(key))
        .collect();
    keys.sort();
    keys.dedup();
    Ok(keys)
}

/// Reference analysis shared by preview and the CLI summary.
pub struct ReferenceProfile {
    pub analysis: Analysis,
    pub classification: Classification,
}

pub fn profile_reference(ctx: &RunContext, reference: &Reference) -> Result<ReferenceProfile, PlanError> {
    let img = decode(&reference.bytes).map_err(PlanError::ReferenceDecode)?;
    let analysis = ctx.extractor.analyze(&img, ctx.extractor.has_recognizer());
    let classification = classify(&analysis.fingerprint, analysis.aspect_ratio);
    Ok(ReferenceProfile {
        analysis,
        classification,
    })
}

fn score_candidate(
    ctx: &RunContext,
    bucket: &str,
    key: &str,
    index: usize,
    reference: &Analysis,
) -> MatchRecord {
    let bytes = match ctx.store.get(bucket, key) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("Download {} failed: {}", key, e);
            return MatchRecord::new(key, index, &MatchOutcome::unreadable())
                .with_error(format!("download: {}", e));
        }
    };
    let img = match decode(&bytes) {
        Ok(img) => img,
        Err(e) => {
            log::warn!("Decode {} failed: {}", key, e);
            return MatchRecord::new(key, index, &MatchOutcome::unreadable())
                .with_error(format!("decode: {}", e));
        }
    };

    // Text recognition on candidates only pays off against a placeholder reference.
    let use_text = reference.fingerprint.is_placeholder && ctx.extractor.has_recognizer();
    let candidate = ctx.extractor.analyze(&img, use_text);
    let outcome = compare(reference, &candidate, &ctx.thresholds);
    MatchRecord::new(key, index, &outcome)
}

/// Preview: score every direct member of `folder` against `reference`.
/// Reads from the store only.
pub fn build_plan(
    ctx: &RunContext,
    bucket: &str,
    folder: &str,
    reference: &Reference,
) -> Result<Plan, PlanError> {
    if bucket.trim().is_empty() {
        return Err(PlanError::MissingBucket);
    }
    if ctx.is_cancelled() {
        return Err(PlanError::Cancelled);
    }

    let profile = profile_reference(ctx, reference)?;
    let is_placeholder = profile.analysis.fingerprint.is_placeholder;
    let reference_class = reference_group(&profile.classification, is_placeholder);
    let base = scope_prefix(folder);
    let dest_folder = destination_prefix(&base, &reference_class);

    let keys = direct_members(ctx.store.as_ref(), bucket, &base)?;
    if keys.is_empty() {
        return Err(PlanError::EmptyCorpus { folder: base });
    }
    log::info!(
        "Analysing {} images in {:?} against a {} reference ({})",
        keys.len(),
        base,
        if is_placeholder { "placeholder" } else { "real" },
        reference_class
    );

    let indexed: Vec<(usize, &String)> = keys.iter().enumerate().map(|(i, k)| (i + 1, k)).collect();
    let tracker = ctx.tracker(Phase::Analysing, keys.len());
    let scored: Vec<Option<MatchRecord>> = ctx.run_parallel(&indexed, |(index, key)| {
        if ctx.is_cancelled() {
            return None;
        }
        let record = score_candidate(ctx, bucket, key, *index, &profile.analysis);
        tracker.item_done(&record.filename);
        Some(record)
    });

    let Some(records) = scored.into_iter().collect::<Option<Vec<_>>>() else {
        log::warn!("Preview of {:?} cancelled", base);
        return Err(PlanError::Cancelled);
    };
    let (to_move, to_stay): (Vec<_>, Vec<_>) = records.into_iter().partition(|r| r.matched());
    log::info!(
        "Preview of {:?}: {} to move to {}, {} to stay",
        base,
        to_move.len(),
        dest_folder,
        to_stay.len()
    );

    Ok(Plan {
        bucket: bucket.to_string(),
        folder: base,
        dest_folder,
        reference_type: if is_placeholder {
            ReferenceKind::Placeholder
        } else {
            ReferenceKind::Real
        },
        reference_class,
        reference_image: Some(reference.label.clone()),
        total_scanned: keys.len(),
        to_move_count: to_move.len(),
        to_stay_count: to_stay.len(),
        to_move,
        to_stay,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::matcher::{MatchReason, UNREADABLE_HASH_DISTANCE};
    use crate::services::fixtures::{reference_png, seed_corpus, solid, png_bytes, BUCKET};
    use crate::services::store::MemoryStore;
    use std::sync::Arc;

    fn seeded() -> (Arc<MemoryStore>, RunContext) {
        let store = Arc::new(MemoryStore::new());
        seed_corpus(store.as_ref());
        let ctx = RunContext::new(store.clone()).unwrap().with_workers(4).unwrap();
        (store, ctx)
    }

    fn reference() -> Reference {
        Reference::from_bytes(reference_png(), "<uploaded>")
    }

    #[test]
    fn test_direct_members_excludes_nested_and_non_images() {
        let (store, _) = seeded();
        let keys = direct_members(store.as_ref(), BUCKET, "/src/").unwrap();

        assert_eq!(keys.len(), 10);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert!(!keys.iter().any(|k| k.contains("archive/")));
        assert!(!keys.iter().any(|k| k.ends_with(".txt")));
    }

    #[test]
    fn test_direct_members_at_root() {
        let store = MemoryStore::new();
        store.put(BUCKET, "top.jpg", b"x", "image/jpeg").unwrap();
        store.put(BUCKET, "sub/inner.jpg", b"x", "image/jpeg").unwrap();

        assert_eq!(direct_members(&store, BUCKET, "").unwrap(), vec!["top.jpg"]);
    }

    #[test]
    fn test_plan_partitions_corpus() {
        let (store, ctx) = seeded();
        let before = store.list(BUCKET, "").unwrap();

        let plan = build_plan(&ctx, BUCKET, "src", &reference()).unwrap();

        assert_eq!(plan.folder, "src/");
        assert_eq!(plan.dest_folder, "src/nature_forest/");
        assert_eq!(plan.reference_type, ReferenceKind::Real);
        assert_eq!(plan.reference_class, "nature_forest");
        assert_eq!(plan.total_scanned, 10);
        assert_eq!(plan.to_move_count, 4);
        assert_eq!(plan.to_stay_count, 6);
        plan.validate().unwrap();

        let hash_matches = plan
            .to_move
            .iter()
            .filter(|r| r.reason == Some(MatchReason::HashMatch))
            .count();
        assert_eq!(hash_matches, 3);
        let ripple = plan.to_move.iter().find(|r| r.filename == "ripple.png").unwrap();
        assert_eq!(ripple.reason, Some(MatchReason::PixelMatch));
        assert!(ripple.hash_distance > 8);
        assert!(ripple.pixel_similarity >= 0.88);

        // Preview never writes.
        assert_eq!(store.list(BUCKET, "").unwrap(), before);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let (_, ctx) = seeded();
        let first = build_plan(&ctx, BUCKET, "src/", &reference()).unwrap();
        let second = build_plan(&ctx, BUCKET, "src/", &reference()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_undecodable_candidate_stays() {
        let (store, ctx) = seeded();
        store.put(BUCKET, "src/broken.jpg", b"not really a jpeg", "image/jpeg").unwrap();

        let plan = build_plan(&ctx, BUCKET, "src", &reference()).unwrap();
        let broken = plan.to_stay.iter().find(|r| r.filename == "broken.jpg").unwrap();

        assert_eq!(plan.total_scanned, 11);
        assert_eq!(broken.hash_distance, UNREADABLE_HASH_DISTANCE);
        assert_eq!(broken.pixel_similarity, 0.0);
        assert!(broken.error.as_deref().unwrap().starts_with("decode"));
        plan.validate().unwrap();
    }

    #[test]
    fn test_preflight_errors() {
        let (_, ctx) = seeded();

        assert!(matches!(
            build_plan(&ctx, "", "src", &reference()),
            Err(PlanError::MissingBucket)
        ));
        assert!(matches!(
            build_plan(&ctx, BUCKET, "empty", &reference()),
            Err(PlanError::EmptyCorpus { .. })
        ));
        let garbage = Reference::from_bytes(b"garbage".to_vec(), "garbage");
        assert!(matches!(
            build_plan(&ctx, BUCKET, "src", &garbage),
            Err(PlanError::ReferenceDecode(_))
        ));
    }

    #[test]
    fn test_cancelled_preview() {
        let (_, ctx) = seeded();
        ctx.cancel();
        assert!(matches!(
            build_plan(&ctx, BUCKET, "src", &reference()),
            Err(PlanError::Cancelled)
        ));
    }

    #[test]
    fn test_placeholder_reference_goes_to_no_image() {
        let (store, ctx) = seeded();
        store
            .put(BUCKET, "src/blank.png", &png_bytes(&solid(200, 200, [245, 245, 245])), "image/png")
            .unwrap();
        let blank = Reference::from_bytes(png_bytes(&solid(300, 300, [250, 250, 250])), "blank");

        let plan = build_plan(&ctx, BUCKET, "src", &blank).unwrap();

        assert!(plan.reference_is_placeholder());
        assert_eq!(plan.dest_folder, "src/no_image/");
        // Every flat candidate is itself a placeholder.
        let blank_record = plan.to_move.iter().find(|r| r.filename == "blank.png").unwrap();
        assert_eq!(blank_record.reason, Some(MatchReason::PlaceholderVisual));
        plan.validate().unwrap();
    }

    #[test]
    fn test_reference_from_store_url() {
        let (_, ctx) = seeded();
        let reference = Reference::from_store(
            ctx.store.as_ref(),
            BUCKET,
            "https://cdn.example.com/photos/src/copy_a.png",
        )
        .unwrap();
        assert_eq!(reference.label, "src/copy_a.png");
    }

    #[test]
    fn test_validate_rejects_inconsistent_documents() {
        let (_, ctx) = seeded();
        let plan = build_plan(&ctx, BUCKET, "src", &reference()).unwrap();

        let mut miscounted = plan.clone();
        miscounted.to_move_count += 1;
        assert!(matches!(miscounted.validate(), Err(PlanError::Inconsistent(_))));

        let mut overlapping = plan.clone();
        overlapping.to_stay.push(plan.to_move[0].clone());
        overlapping.to_stay_count += 1;
        overlapping.total_scanned += 1;
        assert!(matches!(overlapping.validate(), Err(PlanError::Inconsistent(_))));

        let mut unmatched = plan.clone();
        unmatched.to_move[0].reason = None;
        assert!(matches!(unmatched.validate(), Err(PlanError::Inconsistent(_))));
    }

    #[test]
    fn test_validate_keeps_records_inside_the_folder() {
        let (_, ctx) = seeded();
        let plan = build_plan(&ctx, BUCKET, "src", &reference()).unwrap();
        assert!(plan.validate().is_ok());

        let mut outside = plan.clone();
        outside.to_move[0].key = "elsewhere/deep/secret.jpg".to_string();
        outside.to_move[0].filename = "secret.jpg".to_string();
        assert!(matches!(outside.validate(), Err(PlanError::Inconsistent(_))));

        let mut nested = plan.clone();
        nested.to_move[0].key = format!("src/archive/{}", nested.to_move[0].filename);
        assert!(matches!(nested.validate(), Err(PlanError::Inconsistent(_))));

        let mut renamed = plan.clone();
        renamed.to_move[0].filename = "other.png".to_string();
        assert!(matches!(renamed.validate(), Err(PlanError::Inconsistent(_))));

        let mut redirected = plan.clone();
        redirected.dest_folder = "src/d/".to_string();
        assert!(matches!(redirected.validate(), Err(PlanError::Inconsistent(_))));

        let mut reclassed = plan.clone();
        reclassed.reference_class = "no_image".to_string();
        assert!(matches!(reclassed.validate(), Err(PlanError::Inconsistent(_))));
    }

    #[test]
    fn test_validate_root_scope() {
        let store = Arc::new(MemoryStore::new());
        store.put(BUCKET, "a.png", &reference_png(), "image/png").unwrap();
        store.put(BUCKET, "b.png", &reference_png(), "image/png").unwrap();
        let ctx = RunContext::new(store).unwrap();
        let plan = build_plan(&ctx, BUCKET, "", &reference()).unwrap();

        assert_eq!(plan.folder, "");
        assert_eq!(plan.dest_folder, "nature_forest/");
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_plan_json_wire_names() {
        let (_, ctx) = seeded();
        let plan = build_plan(&ctx, BUCKET, "src", &reference()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&plan.to_json().unwrap()).unwrap();

        assert_eq!(value["reference_type"], "real");
        assert_eq!(value["to_move_count"], 4);
        assert!(value["to_move"][0]["hash_dist"].is_u64());
        assert!(value["to_move"][0]["pixel_sim"].is_f64());

        let parsed = Plan::from_json(&plan.to_json().unwrap()).unwrap();
        assert_eq!(parsed, plan);
    }
}
