//! Pipeline scheduler.
//!
//! Drives the polling cycle that turns arriving acquisition data into
//! artifacts. One cycle:
//!
//! 1. poll the monitor and rechunk newly sealed epoch blocks;
//! 2. update the reference manager (pointer read, one-time calibration,
//!    re-point invalidation);
//! 3. for every known raw segment, evaluate each stage's readiness predicate
//!    and subtract already-present artifacts to get the work set;
//! 4. dispatch the work set to a bounded pool and wait for the round to
//!    drain;
//! 5. sleep until the next cycle or a shutdown signal.
//!
//! A failed work item is logged and left absent; the next cycle simply finds
//! it in the work set again. Retries are always safe because every stage is
//! a deterministic pure function of immutable inputs, and the artifact
//! store's claim/commit protocol guarantees at most one visible result per
//! key. Shutdown is cooperative at cycle granularity: in-flight claims
//! finish (or abort cleanly) before `run` returns.

use crate::config::{ElectrodeLayout, Settings};
use crate::error::{PipelineError, PipelineResult};
use crate::layout::ExperimentLayout;
use crate::monitor::EpochBlockMonitor;
use crate::rechunker::SegmentRechunker;
use crate::reference::{CalibrationState, ReferenceManager};
use crate::stages::{StageContext, StageKind};
use crate::store::{ArtifactId, ArtifactStatus, ArtifactStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// What one scheduler cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Sealed epoch blocks seen this cycle.
    pub sealed_blocks: usize,
    /// Raw segments newly written by the rechunker.
    pub new_segments: usize,
    /// Work items dispatched.
    pub dispatched: usize,
    /// Work items that committed an artifact.
    pub completed: usize,
    /// Work items that failed and will be retried.
    pub failed: usize,
    /// Calibration state after the reference update.
    pub calibration: CalibrationState,
}

impl CycleReport {
    /// True when the cycle changed anything on disk.
    #[must_use]
    pub fn did_work(&self) -> bool {
        self.new_segments > 0 || self.completed > 0
    }
}

/// Drives polling cycles over one experiment directory.
#[derive(Debug)]
pub struct Scheduler {
    ctx: StageContext,
    monitor: EpochBlockMonitor,
    rechunker: SegmentRechunker,
    reference: ReferenceManager,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    /// Scheduler over the experiment rooted at `root`.
    #[must_use]
    pub fn new(
        settings: Arc<Settings>,
        electrodes: Arc<ElectrodeLayout>,
        root: &Path,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let layout = ExperimentLayout::new(root);
        let store = ArtifactStore::new(layout.clone());
        let ctx = StageContext {
            settings: Arc::clone(&settings),
            electrodes,
            layout: layout.clone(),
            store,
        };
        let monitor = EpochBlockMonitor::new(
            layout.clone(),
            Duration::from_secs_f64(settings.seal_quiet_sec),
        );
        let rechunker =
            SegmentRechunker::new(layout, ctx.codec(), settings.samples_per_segment());
        let reference = ReferenceManager::new(ctx.clone());
        let semaphore = Arc::new(Semaphore::new(settings.max_concurrent_stage_tasks));
        Self {
            ctx,
            monitor,
            rechunker,
            reference,
            semaphore,
            shutdown,
        }
    }

    /// The shared stage context (useful for inspection in tests).
    #[must_use]
    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// Run polling cycles until the shutdown signal flips.
    pub async fn run(mut self) -> PipelineResult<()> {
        let poll_interval = Duration::from_secs_f64(self.ctx.settings.poll_interval_sec);
        info!(root = %self.ctx.layout.root().display(), "pipeline started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let report = self.run_cycle().await?;
            if report.did_work() {
                info!(
                    new_segments = report.new_segments,
                    completed = report.completed,
                    failed = report.failed,
                    calibration = %report.calibration,
                    "cycle finished"
                );
            } else {
                debug!(calibration = %report.calibration, "all artifacts up to date");
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        info!("pipeline stopped");
        Ok(())
    }

    /// Execute one full cycle and wait for its work set to drain.
    pub async fn run_cycle(&mut self) -> PipelineResult<CycleReport> {
        // (1) ingest: monitor + rechunker
        let sealed = self.monitor.poll()?;
        let mut new_segments = 0;
        for block in &sealed {
            match self.rechunker.rechunk(block) {
                Ok(n) => new_segments += n,
                Err(err) => {
                    warn!(epoch_block = %block.name, error = %err, "rechunk failed");
                }
            }
        }

        // (2) calibration; runs between dispatch rounds so invalidation never
        // races an in-flight claim
        let calibration = match self.reference.update() {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "reference update failed");
                CalibrationState::CalibrationPending
            }
        };
        let calibration_ready = calibration == CalibrationState::CalibrationReady;

        // (3) work set: eligible minus present
        let segments = self.ctx.layout.scan_raw_segments()?;
        let mut work: Vec<(crate::layout::SegmentRef, StageKind)> = Vec::new();
        for segment in &segments {
            for kind in StageKind::ALL {
                if !kind.is_ready(segment, &self.ctx.store, calibration_ready) {
                    continue;
                }
                let id = ArtifactId::segment(segment.clone(), kind.artifact_kind());
                if self.ctx.store.status(&id) != ArtifactStatus::Absent {
                    continue;
                }
                work.push((segment.clone(), kind));
            }
        }

        // (4) bounded dispatch
        let dispatched = work.len();
        let mut join_set = JoinSet::new();
        for (segment, kind) in work {
            let ctx = self.ctx.clone();
            let semaphore = Arc::clone(&self.semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let task_segment = segment.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || kind.produce(&task_segment, &ctx))
                        .await
                        .unwrap_or_else(|err| {
                            Err(PipelineError::StageCompute(format!(
                                "stage task join failed: {err}"
                            )))
                        });
                (segment, kind, outcome)
            });
        }

        let mut completed = 0;
        let mut failed = 0;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((segment, kind, Ok(()))) => {
                    completed += 1;
                    info!(segment = %segment, stage = %kind, "artifact produced");
                }
                Ok((segment, kind, Err(err))) if err.is_benign() => {
                    debug!(segment = %segment, stage = %kind, reason = %err, "work item skipped");
                }
                Ok((segment, kind, Err(err))) => {
                    failed += 1;
                    warn!(
                        segment = %segment,
                        stage = %kind,
                        error = %err,
                        "stage failed, artifact left absent for retry"
                    );
                }
                Err(join_err) => {
                    failed += 1;
                    warn!(error = %join_err, "stage task aborted");
                }
            }
        }

        Ok(CycleReport {
            sealed_blocks: sealed.len(),
            new_segments,
            dispatched,
            completed,
            failed,
            calibration,
        })
    }
}
