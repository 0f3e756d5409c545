use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::core::image::{content_type_for, file_name, split_extension};
use crate::services::context::{Phase, RunContext};
use crate::services::history::{EventSink, SessionEvent, FOLDER_REFERENCE_EVENT};
use crate::services::planner::{Plan, PlanError, ReferenceKind};
use crate::services::store::{ObjectStore, StoreError};

/// Where in the move sequence an item gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Probe,
    Upload,
    Verify,
    Delete,
    Cancelled,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Download => "download",
            Stage::Probe => "probe",
            Stage::Upload => "upload",
            Stage::Verify => "verify",
            Stage::Delete => "delete",
            Stage::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub key: String,
    pub filename: String,
}

impl FileRef {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            filename: file_name(key).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovedFile {
    pub key: String,
    pub filename: String,
    pub dest_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub key: String,
    pub filename: String,
    pub stage: Stage,
    pub error: String,
}

impl ItemFailure {
    pub(crate) fn new(key: &str, stage: Stage, error: impl fmt::Display) -> Self {
        Self {
            key: key.to_string(),
            filename: file_name(key).to_string(),
            stage,
            error: error.to_string(),
        }
    }
}

/// Tally of one execution. `moved_count + unchanged_count == total_scanned`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub event: String,
    pub timestamp: String,
    pub bucket: String,
    pub source_folder: String,
    pub dest_folder: String,
    pub reference_type: ReferenceKind,
    pub reference_class: String,
    pub moved_count: usize,
    pub unchanged_count: usize,
    pub failed_count: usize,
    pub total_scanned: usize,
    pub cancelled: bool,
    pub moved_files: Vec<MovedFile>,
    pub unchanged_files: Vec<FileRef>,
    pub failures: Vec<ItemFailure>,
}

impl ExecutionResult {
    pub fn moved(&self) -> Vec<&str> {
        self.moved_files.iter().map(|f| f.filename.as_str()).collect()
    }

    pub fn unchanged(&self) -> Vec<&str> {
        self.unchanged_files.iter().map(|f| f.filename.as_str()).collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn join_key(folder: &str, name: &str) -> String {
    let folder = folder.trim_end_matches('/');
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", folder, name)
    }
}

/// First free key for `filename` in `dest_folder`: the plain name, then
/// `<stem>_<index><ext>`, then `<stem>_<index>_<n><ext>` for n = 2, 3, ...
///
/// A failed probe is returned as an error; a key is never assumed free.
pub fn allocate_destination_key<F>(
    dest_folder: &str,
    filename: &str,
    index: usize,
    mut is_taken: F,
) -> Result<String, StoreError>
where
    F: FnMut(&str) -> Result<bool, StoreError>,
{
    let plain = join_key(dest_folder, filename);
    if !is_taken(&plain)? {
        return Ok(plain);
    }

    let (stem, ext) = split_extension(filename);
    let indexed = join_key(dest_folder, &format!("{}_{}{}", stem, index, ext));
    if !is_taken(&indexed)? {
        return Ok(indexed);
    }

    let mut n = 2usize;
    loop {
        let candidate = join_key(dest_folder, &format!("{}_{}_{}{}", stem, index, n, ext));
        if !is_taken(&candidate)? {
            return Ok(candidate);
        }
        n += 1;
    }
}

/// Destination keys handed out during one run, so parallel workers never
/// pick the same free name.
#[derive(Debug, Default)]
pub(crate) struct KeyReservations {
    taken: Mutex<HashSet<String>>,
}

impl KeyReservations {
    fn lock(&self) -> Result<MutexGuard<'_, HashSet<String>>, StoreError> {
        self.taken
            .lock()
            .map_err(|_| StoreError::Transient("reservation lock poisoned".to_string()))
    }

    /// The lock covers only the check and the claim; the store lookup runs
    /// outside it. A candidate claimed by another worker meanwhile counts as taken.
    fn reserve(
        &self,
        store: &dyn ObjectStore,
        bucket: &str,
        dest_folder: &str,
        filename: &str,
        index: usize,
    ) -> Result<String, StoreError> {
        allocate_destination_key(dest_folder, filename, index, |candidate| {
            let claimed = self.lock()?.contains(candidate);
            if claimed || store.exists(bucket, candidate)? {
                return Ok(true);
            }
            let inserted = self.lock()?.insert(candidate.to_string());
            Ok(!inserted)
        })
    }
}

/// Move one object: download, pick a free destination, upload, optionally
/// verify, and only then delete the source. Returns the destination key.
pub(crate) fn relocate(
    ctx: &RunContext,
    reservations: &KeyReservations,
    bucket: &str,
    key: &str,
    dest_folder: &str,
    index: usize,
) -> Result<String, ItemFailure> {
    let store = ctx.store.as_ref();
    let filename = file_name(key);

    let bytes = store
        .get(bucket, key)
        .map_err(|e| ItemFailure::new(key, Stage::Download, e))?;

    let dest_key = reservations
        .reserve(store, bucket, dest_folder, filename, index)
        .map_err(|e| ItemFailure::new(key, Stage::Probe, e))?;

    store
        .put(bucket, &dest_key, &bytes, content_type_for(filename))
        .map_err(|e| ItemFailure::new(key, Stage::Upload, e))?;

    if ctx.verify_uploads {
        let expected = blake3::hash(&bytes);
        let verified = store
            .get(bucket, &dest_key)
            .map_err(|e| ItemFailure::new(key, Stage::Verify, e))?;
        if blake3::hash(&verified) != expected {
            if let Err(e) = store.delete(bucket, &dest_key) {
                log::warn!("Failed to remove unverified copy {}: {}", dest_key, e);
            }
            return Err(ItemFailure::new(
                key,
                Stage::Verify,
                format!("{} does not match the source after upload", dest_key),
            ));
        }
    }

    store.delete(bucket, key).map_err(|e| {
        ItemFailure::new(
            key,
            Stage::Delete,
            format!("copied to {} but source not removed: {}", dest_key, e),
        )
    })?;

    log::debug!("Moved {} -> {}", key, dest_key);
    Ok(dest_key)
}

pub(crate) enum ItemOutcome {
    Moved(MovedFile),
    Failed(ItemFailure),
}

/// Execute: relocate every `to_move` record of a validated plan and record
/// one `folder_reference` event. `to_stay` records are never touched.
pub fn execute_plan(
    ctx: &RunContext,
    plan: &Plan,
    sink: &dyn EventSink,
) -> Result<ExecutionResult, PlanError> {
    plan.validate()?;
    log::info!(
        "Moving {} images from {:?} to {}",
        plan.to_move.len(),
        plan.folder,
        plan.dest_folder
    );

    let reservations = KeyReservations::default();
    let tracker = ctx.tracker(Phase::Moving, plan.to_move.len());
    let indexed: Vec<(usize, _)> = plan.to_move.iter().enumerate().collect();

    let outcomes: Vec<ItemOutcome> = ctx.run_parallel(&indexed, |(position, record)| {
        if ctx.is_cancelled() {
            return ItemOutcome::Failed(ItemFailure::new(
                &record.key,
                Stage::Cancelled,
                "run cancelled before this item started",
            ));
        }
        let index = if record.index > 0 { record.index } else { position + 1 };
        let outcome = match relocate(
            ctx,
            &reservations,
            &plan.bucket,
            &record.key,
            &plan.dest_folder,
            index,
        ) {
            Ok(dest_key) => ItemOutcome::Moved(MovedFile {
                key: record.key.clone(),
                filename: record.filename.clone(),
                dest_key,
            }),
            Err(failure) => {
                log::warn!(
                    "Move failed for {} at {}: {}",
                    failure.key,
                    failure.stage,
                    failure.error
                );
                ItemOutcome::Failed(failure)
            }
        };
        tracker.item_done(&record.filename);
        outcome
    });

    let mut moved_files = Vec::new();
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            ItemOutcome::Moved(file) => moved_files.push(file),
            ItemOutcome::Failed(failure) => failures.push(failure),
        }
    }
    let cancelled = failures.iter().any(|f| f.stage == Stage::Cancelled);
    if cancelled {
        log::warn!("Execution cancelled; unstarted items left in place");
    }

    let mut unchanged_files: Vec<FileRef> = plan.to_stay.iter().map(|r| FileRef::new(&r.key)).collect();
    unchanged_files.extend(failures.iter().map(|f| FileRef::new(&f.key)));

    let mut event = SessionEvent::new(FOLDER_REFERENCE_EVENT);
    event.bucket = plan.bucket.clone();
    event.source_prefix = plan.folder.clone();
    event.output_prefix = plan.dest_folder.clone();
    event.mode = "reference".to_string();
    event.reference_image = plan.reference_image.clone();
    event.results.total_processed = plan.total_scanned;
    event.results.groups.insert(
        plan.reference_class.clone(),
        moved_files.iter().map(|f| f.filename.clone()).collect(),
    );
    event.results.moved_count = moved_files.len();
    event.results.unchanged_count = unchanged_files.len();
    event.extra.is_placeholder = plan.reference_is_placeholder();
    event.extra.dest_sub = plan.reference_class.clone();
    event.extra.moved = moved_files.len();
    event.extra.unchanged_count = unchanged_files.len();
    event.extra.total_processed = plan.total_scanned;
    event.extra.failed = failures.len();
    sink.record(&event);

    log::info!(
        "Moved {}, unchanged {}, failed {} of {} scanned",
        moved_files.len(),
        unchanged_files.len(),
        failures.len(),
        plan.total_scanned
    );

    Ok(ExecutionResult {
        event: FOLDER_REFERENCE_EVENT.to_string(),
        timestamp: event.timestamp,
        bucket: plan.bucket.clone(),
        source_folder: plan.folder.clone(),
        dest_folder: plan.dest_folder.clone(),
        reference_type: plan.reference_type,
        reference_class: plan.reference_class.clone(),
        moved_count: moved_files.len(),
        unchanged_count: unchanged_files.len(),
        failed_count: failures.len(),
        total_scanned: plan.total_scanned,
        cancelled,
        moved_files,
        unchanged_files,
        failures,
    })
}
