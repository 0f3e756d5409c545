use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::core::features::FeatureExtractor;
use crate::core::matcher::Thresholds;
use crate::services::planner::PlanError;
use crate::services::store::ObjectStore;

pub const DEFAULT_WORKERS: usize = 8;
pub const MAX_WORKERS: usize = 32;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub enum Phase {
    Analysing,
    Moving,
    Grouping,
}

#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub phase: Phase,
    pub completed: usize,
    pub total: usize,
    pub current: String,
}

pub type ProgressCallback = Box<dyn Fn(Progress) + Send + Sync>;

/// Everything a preview or execute run needs: the store, the feature
/// extractor, thresholds and a bounded worker pool.
pub struct RunContext {
    pub store: Arc<dyn ObjectStore>,
    pub extractor: FeatureExtractor,
    pub thresholds: Thresholds,
    pub verify_uploads: bool,
    pool: ThreadPool,
    cancellation_token: Arc<AtomicBool>,
    progress: Option<ProgressCallback>,
}

fn build_pool(workers: usize) -> Result<ThreadPool, PlanError> {
    let workers = workers.clamp(1, MAX_WORKERS);
    ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("sortrs-worker-{}", i))
        .build()
        .map_err(|e| PlanError::WorkerPool(e.to_string()))
}

impl RunContext {
    pub fn new(store: Arc<dyn ObjectStore>) -> Result<Self, PlanError> {
        Ok(Self {
            store,
            extractor: FeatureExtractor::new(),
            thresholds: Thresholds::default(),
            verify_uploads: true,
            pool: build_pool(DEFAULT_WORKERS)?,
            cancellation_token: Arc::new(AtomicBool::new(false)),
            progress: None,
        })
    }

    /// Resize the worker pool; the count is clamped to `1..=32`.
    pub fn with_workers(mut self, workers: usize) -> Result<Self, PlanError> {
        self.pool = build_pool(workers)?;
        Ok(self)
    }

    pub fn with_extractor(mut self, extractor: FeatureExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_verify_uploads(mut self, verify: bool) -> Self {
        self.verify_uploads = verify;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    pub fn cancel(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.load(Ordering::Relaxed)
    }

    /// Map `f` over `items` on the worker pool, keeping input order.
    pub(crate) fn run_parallel<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Send + Sync,
    {
        use rayon::prelude::*;
        self.pool.install(|| items.par_iter().map(|item| f(item)).collect())
    }

    pub(crate) fn tracker(&self, phase: Phase, total: usize) -> ProgressTracker<'_> {
        ProgressTracker {
            callback: self.progress.as_ref(),
            phase,
            total,
            completed: AtomicUsize::new(0),
        }
    }
}

/// Shared across workers; `completed` only ever grows.
pub(crate) struct ProgressTracker<'a> {
    callback: Option<&'a ProgressCallback>,
    phase: Phase,
    total: usize,
    completed: AtomicUsize,
}

impl ProgressTracker<'_> {
    pub fn item_done(&self, current: &str) {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(callback) = self.callback {
            let progress = Progress {
                phase: self.phase,
                completed,
                total: self.total,
                current: current.to_string(),
            };
            // A panicking observer must not take a worker down with it.
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(progress);
            })) {
                log::warn!("Progress callback panicked: {:?}", e);
            }
        }
    }
}
