use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::core::classifier::classify;
use crate::core::grouping::{destination_prefix, group_for, scope_prefix, GroupingMode};
use crate::core::image::{aspect_ratio, decode, file_name};
use crate::services::context::{Phase, RunContext};
use crate::services::executor::{relocate, FileRef, ItemFailure, ItemOutcome, KeyReservations, MovedFile, Stage};
use crate::services::history::{EventSink, SessionEvent, CLASSIFICATION_GROUPING_EVENT};
use crate::services::planner::{direct_members, PlanError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAssignment {
    pub key: String,
    pub filename: String,
    pub index: usize,
    pub category: String,
    pub subcategory: String,
    pub group: String,
    pub dest_folder: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnreadableItem {
    pub key: String,
    pub filename: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingPlan {
    pub bucket: String,
    pub folder: String,
    pub output_prefix: String,
    pub mode: GroupingMode,
    pub total_scanned: usize,
    pub assignments: Vec<GroupAssignment>,
    /// Items that could not be fetched or decoded; they stay where they are.
    pub unreadable: Vec<UnreadableItem>,
}

impl GroupingPlan {
    /// Group name -> number of images assigned to it.
    pub fn group_counts(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for a in &self.assignments {
            *counts.entry(a.group.as_str()).or_insert(0) += 1;
        }
        counts
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if self.bucket.trim().is_empty() {
            return Err(PlanError::MissingBucket);
        }
        if self.assignments.len() + self.unreadable.len() != self.total_scanned {
            return Err(PlanError::Inconsistent(format!(
                "{} assigned + {} unreadable do not cover {} scanned",
                self.assignments.len(),
                self.unreadable.len(),
                self.total_scanned
            )));
        }
        let scope = scope_prefix(&self.folder);
        let mut keys = HashSet::new();
        let all_keys = self
            .assignments
            .iter()
            .map(|a| &a.key)
            .chain(self.unreadable.iter().map(|u| &u.key));
        for key in all_keys {
            if !keys.insert(key) {
                return Err(PlanError::Inconsistent(format!("{} listed twice", key)));
            }
            if !matches!(key.strip_prefix(scope.as_str()), Some(name) if !name.is_empty() && !name.contains('/')) {
                return Err(PlanError::Inconsistent(format!(
                    "{} is not a direct member of {:?}",
                    key, self.folder
                )));
            }
        }
        if let Some(a) = self
            .assignments
            .iter()
            .find(|a| a.dest_folder != destination_prefix(&self.output_prefix, &a.group))
        {
            return Err(PlanError::Inconsistent(format!(
                "bad destination {:?} for {}",
                a.dest_folder, a.key
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingResult {
    pub event: String,
    pub timestamp: String,
    pub bucket: String,
    pub source_folder: String,
    pub output_prefix: String,
    pub mode: GroupingMode,
    pub total_scanned: usize,
    pub moved_count: usize,
    pub unchanged_count: usize,
    pub failed_count: usize,
    pub cancelled: bool,
    /// Destination folder -> filenames moved into it.
    pub groups: BTreeMap<String, Vec<String>>,
    pub moved_files: Vec<MovedFile>,
    pub unchanged_files: Vec<FileRef>,
    pub failures: Vec<ItemFailure>,
}

impl GroupingResult {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

enum Scored {
    Assigned(GroupAssignment),
    Unreadable(UnreadableItem),
}

/// Classify every direct member of `folder` and decide its group folder
/// under `output_prefix` (the source folder when `None`). Reads only.
pub fn build_grouping_plan(
    ctx: &RunContext,
    bucket: &str,
    folder: &str,
    output_prefix: Option<&str>,
    mode: GroupingMode,
) -> Result<GroupingPlan, PlanError> {
    if bucket.trim().is_empty() {
        return Err(PlanError::MissingBucket);
    }
    if ctx.is_cancelled() {
        return Err(PlanError::Cancelled);
    }

    let base = scope_prefix(folder);
    let output_base = scope_prefix(output_prefix.unwrap_or(&base));
    let keys = direct_members(ctx.store.as_ref(), bucket, &base)?;
    if keys.is_empty() {
        return Err(PlanError::EmptyCorpus { folder: base });
    }
    log::info!("Classifying {} images in {:?} by {}", keys.len(), base, mode);

    let indexed: Vec<(usize, &String)> = keys.iter().enumerate().map(|(i, k)| (i + 1, k)).collect();
    let tracker = ctx.tracker(Phase::Grouping, keys.len());
    let scored: Vec<Option<Scored>> = ctx.run_parallel(&indexed, |(index, key)| {
        if ctx.is_cancelled() {
            return None;
        }
        let filename = file_name(key).to_string();
        let unreadable = |error: String| {
            log::warn!("Skipping {}: {}", key, error);
            Scored::Unreadable(UnreadableItem {
                key: key.to_string(),
                filename: filename.clone(),
                error,
            })
        };

        let scored = match ctx.store.get(bucket, key) {
            Err(e) => unreadable(format!("download: {}", e)),
            Ok(bytes) => match decode(&bytes) {
                Err(e) => unreadable(format!("decode: {}", e)),
                Ok(img) => {
                    let fingerprint = ctx.extractor.fingerprint(&img, false);
                    let classification = classify(&fingerprint, aspect_ratio(&img));
                    let group = group_for(&classification, mode);
                    Scored::Assigned(GroupAssignment {
                        key: key.to_string(),
                        filename: filename.clone(),
                        index: *index,
                        dest_folder: destination_prefix(&output_base, &group),
                        category: classification.category,
                        subcategory: classification.subcategory,
                        group,
                    })
                }
            },
        };
        tracker.item_done(&filename);
        Some(scored)
    });

    let Some(scored) = scored.into_iter().collect::<Option<Vec<_>>>() else {
        log::warn!("Grouping preview of {:?} cancelled", base);
        return Err(PlanError::Cancelled);
    };
    let mut assignments = Vec::new();
    let mut unreadable = Vec::new();
    for item in scored {
        match item {
            Scored::Assigned(a) => assignments.push(a),
            Scored::Unreadable(u) => unreadable.push(u),
        }
    }

    Ok(GroupingPlan {
        bucket: bucket.to_string(),
        folder: base,
        output_prefix: output_base,
        mode,
        total_scanned: keys.len(),
        assignments,
        unreadable,
    })
}

/// Move every assignment into its group folder, upload before delete, and
/// record one `classification_grouping` event.
pub fn execute_grouping_plan(
    ctx: &RunContext,
    plan: &GroupingPlan,
    sink: &dyn EventSink,
) -> Result<GroupingResult, PlanError> {
    plan.validate()?;

    let reservations = KeyReservations::default();
    let tracker = ctx.tracker(Phase::Moving, plan.assignments.len());
    let outcomes: Vec<ItemOutcome> = ctx.run_parallel(&plan.assignments, |assignment| {
        if ctx.is_cancelled() {
            return ItemOutcome::Failed(ItemFailure::new(
                &assignment.key,
                Stage::Cancelled,
                "run cancelled before this item started",
            ));
        }
        let outcome = match relocate(
            ctx,
            &reservations,
            &plan.bucket,
            &assignment.key,
            &assignment.dest_folder,
            assignment.index,
        ) {
            Ok(dest_key) => ItemOutcome::Moved(MovedFile {
                key: assignment.key.clone(),
                filename: assignment.filename.clone(),
                dest_key,
            }),
            Err(failure) => {
                log::warn!(
                    "Grouping move failed for {} at {}: {}",
                    failure.key,
                    failure.stage,
                    failure.error
                );
                ItemOutcome::Failed(failure)
            }
        };
        tracker.item_done(&assignment.filename);
        outcome
    });

    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut moved_files = Vec::new();
    let mut failures = Vec::new();
    for (assignment, outcome) in plan.assignments.iter().zip(outcomes) {
        match outcome {
            ItemOutcome::Moved(file) => {
                groups
                    .entry(assignment.group.clone())
                    .or_default()
                    .push(file.filename.clone());
                moved_files.push(file);
            }
            ItemOutcome::Failed(failure) => failures.push(failure),
        }
    }
    let cancelled = failures.iter().any(|f| f.stage == Stage::Cancelled);

    let mut unchanged_files: Vec<FileRef> = plan.unreadable.iter().map(|u| FileRef::new(&u.key)).collect();
    unchanged_files.extend(failures.iter().map(|f| FileRef::new(&f.key)));

    let mut event = SessionEvent::new(CLASSIFICATION_GROUPING_EVENT);
    event.bucket = plan.bucket.clone();
    event.source_prefix = plan.folder.clone();
    event.output_prefix = plan.output_prefix.clone();
    event.mode = plan.mode.to_string();
    event.results.total_processed = plan.total_scanned;
    event.results.groups = groups.clone();
    event.results.moved_count = moved_files.len();
    event.results.unchanged_count = unchanged_files.len();
    event.extra.moved = moved_files.len();
    event.extra.unchanged_count = unchanged_files.len();
    event.extra.total_processed = plan.total_scanned;
    event.extra.failed = failures.len() + plan.unreadable.len();
    sink.record(&event);

    log::info!(
        "Grouped {} of {} into {} folders; {} unchanged",
        moved_files.len(),
        plan.total_scanned,
        groups.len(),
        unchanged_files.len()
    );

    Ok(GroupingResult {
        event: CLASSIFICATION_GROUPING_EVENT.to_string(),
        timestamp: event.timestamp,
        bucket: plan.bucket.clone(),
        source_folder: plan.folder.clone(),
        output_prefix: plan.output_prefix.clone(),
        mode: plan.mode,
        total_scanned: plan.total_scanned,
        moved_count: moved_files.len(),
        unchanged_count: unchanged_files.len(),
        failed_count: failures.len(),
        cancelled,
        groups,
        moved_files,
        unchanged_files,
        failures,
    })
}
