//! The annotation control loop.
//!
//! One coordinating thread owns every piece of scheduling state: the version
//! cache, the in-flight count and the units sleeping off a retry delay.
//! Blocking `annotate` calls run on the [`WorkerPool`]; their results come
//! back over a channel and are extracted and persisted here. The loop blocks
//! in `select!` on three events (a queued unit, a completed task, the next
//! delayed unit falling due) and ends once all three sources are empty.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, at, never, select};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::client::{CommandRunner, HttpFetcher};
use crate::config::SchedulerSettings;
use crate::domain::TRANSCRIPT_ID_DATASET;
use crate::error::AnnotatorError;
use crate::pool::{Completion, WorkerPool};
use crate::queue::AnnotationQueue;
use crate::store::{GenomicUnitStore, ManifestStore};
use crate::task::{AnnotationTask, TaskContext};
use crate::unit::AnnotationUnit;
use crate::version::{VersionCache, VersionKey, VersionResolution};

/// Tally of one drain run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Units popped from the queue, counting every re-queue.
    pub passes: usize,
    pub version_tasks: usize,
    pub annotation_tasks: usize,
    pub persisted: usize,
    pub entries_written: usize,
    pub already_annotated: usize,
    pub delayed: usize,
    pub canceled: usize,
    pub failed: usize,
}

pub struct Orchestrator<H, C> {
    ctx: Arc<TaskContext<H, C>>,
    settings: SchedulerSettings,
}

impl<H, C> Orchestrator<H, C>
where
    H: HttpFetcher + 'static,
    C: CommandRunner + 'static,
{
    pub fn new(ctx: TaskContext<H, C>, settings: SchedulerSettings) -> Self {
        Self {
            ctx: Arc::new(ctx),
            settings,
        }
    }

    /// Runs the queue to exhaustion, blocking the calling thread. Failures of
    /// individual units are logged and counted, never returned.
    pub fn drain(
        &self,
        queue: &AnnotationQueue,
        genomic_units: &dyn GenomicUnitStore,
        manifests: &dyn ManifestStore,
    ) -> Result<DrainReport, AnnotatorError> {
        let (pool, completions) = WorkerPool::spawn(self.settings.workers, Arc::clone(&self.ctx))?;
        let started = Instant::now();
        let mut run = DrainRun {
            queue,
            genomic_units,
            manifests,
            settings: &self.settings,
            pool: &pool,
            versions: VersionCache::new(),
            delayed: Vec::new(),
            in_flight: 0,
            report: DrainReport::default(),
        };
        run.run(&completions);
        let report = run.report;
        pool.shutdown();

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            persisted = report.persisted,
            entries = report.entries_written,
            already_annotated = report.already_annotated,
            canceled = report.canceled,
            failed = report.failed,
            "annotation queue drained"
        );
        Ok(report)
    }
}

struct DrainRun<'a> {
    queue: &'a AnnotationQueue,
    genomic_units: &'a dyn GenomicUnitStore,
    manifests: &'a dyn ManifestStore,
    settings: &'a SchedulerSettings,
    pool: &'a WorkerPool,
    versions: VersionCache,
    delayed: Vec<(Instant, AnnotationUnit)>,
    in_flight: usize,
    report: DrainReport,
}

impl DrainRun<'_> {
    fn run(&mut self, completions: &Receiver<Completion>) {
        let queue = self.queue;
        loop {
            while let Ok(completion) = completions.try_recv() {
                self.complete(completion);
            }
            self.release_due();

            if queue.is_empty() && self.in_flight == 0 && self.delayed.is_empty() {
                break;
            }

            let wake = match self.next_due() {
                Some(deadline) => at(deadline),
                None => never(),
            };
            select! {
                recv(queue.receiver()) -> unit => {
                    if let Ok(unit) = unit {
                        self.process(unit);
                    }
                }
                recv(completions) -> completion => {
                    if let Ok(completion) = completion {
                        self.complete(completion);
                    }
                }
                recv(wake) -> _ => {}
            }
        }
    }

    fn process(&mut self, mut unit: AnnotationUnit) {
        self.report.passes += 1;

        if !unit.version_exists() {
            self.resolve_version(unit);
            return;
        }

        match self.already_annotated(&unit) {
            Ok(true) => {
                info!(unit = %unit, "annotation exists, skipping");
                self.report.already_annotated += 1;
                return;
            }
            Ok(false) => {}
            Err(err) => {
                error!(unit = %unit, error = %err, "failed to look up existing annotation");
                self.report.failed += 1;
                return;
            }
        }

        if unit.has_dependencies() || unit.needs_transcript_provisioning() {
            if let Err(err) = self.resolve_conditions(&mut unit) {
                error!(unit = %unit, error = %err, "failed to resolve dependencies");
                self.report.failed += 1;
                return;
            }
        }

        if !unit.ready_to_annotate() {
            let missing = unit.missing_conditions().join(", ");
            if unit.advance_retry_and_check() {
                info!(
                    unit = %unit,
                    attempt = unit.retries(),
                    missing = %missing,
                    "delaying annotation"
                );
                self.report.delayed += 1;
                self.delay(unit);
            } else {
                warn!(
                    unit = %unit,
                    attempt = unit.retries(),
                    missing = %missing,
                    "canceling annotation, conditions never met"
                );
                self.report.canceled += 1;
            }
            return;
        }

        self.report.annotation_tasks += 1;
        self.dispatch(AnnotationTask::for_unit(unit));
    }

    fn resolve_version(&mut self, unit: AnnotationUnit) {
        match self.versions.resolve(unit) {
            VersionResolution::Fetch(unit) => {
                self.report.version_tasks += 1;
                self.dispatch(AnnotationTask::version_for(unit));
            }
            VersionResolution::Cached(unit) => self.queue.put(unit),
            VersionResolution::Waiting => {}
            VersionResolution::Unavailable(unit) => {
                warn!(unit = %unit, "canceling annotation, version unavailable");
                self.report.canceled += 1;
            }
        }
    }

    /// Already stored at the unit's version. Records the manifest pin when
    /// this analysis does not hold it yet.
    fn already_annotated(&self, unit: &AnnotationUnit) -> Result<bool, AnnotatorError> {
        let current = unit.manifest_entry();
        if !self
            .genomic_units
            .annotation_exists(unit.genomic_unit(), unit.data_set(), &current)?
        {
            return Ok(false);
        }
        let pinned = self.manifests.pinned(unit.analysis_name(), unit.data_set())?;
        if pinned.as_ref() != Some(&current) {
            self.manifests
                .record(unit.analysis_name(), unit.data_set(), &current)?;
        }
        Ok(true)
    }

    /// Fills missing dependency values and the transcript flag from what the
    /// analysis has already persisted.
    fn resolve_conditions(&self, unit: &mut AnnotationUnit) -> Result<(), AnnotatorError> {
        let missing: Vec<String> = unit
            .missing_dependencies()
            .into_iter()
            .map(str::to_string)
            .collect();
        for dependency in missing {
            let Some(pinned) = self.manifests.pinned(unit.analysis_name(), &dependency)? else {
                continue;
            };
            if let Some(value) =
                self.genomic_units
                    .find_annotation_value(unit.genomic_unit(), &dependency, &pinned)?
            {
                debug!(unit = %unit, dependency = %dependency, "dependency resolved");
                unit.set_dependency_value(dependency, value);
            }
        }

        if unit.needs_transcript_provisioning() && !unit.transcript_provisioned() {
            if let Some(pinned) = self
                .manifests
                .pinned(unit.analysis_name(), TRANSCRIPT_ID_DATASET)?
            {
                let provisioned = self.genomic_units.annotation_exists(
                    unit.genomic_unit(),
                    TRANSCRIPT_ID_DATASET,
                    &pinned,
                )?;
                unit.set_transcript_provisioned(provisioned);
            }
        }
        Ok(())
    }

    fn delay(&mut self, unit: AnnotationUnit) {
        let delay = self.settings.retry_delay_for(unit.retries());
        if delay == Duration::ZERO {
            self.queue.put(unit);
        } else {
            self.delayed.push((Instant::now() + delay, unit));
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(due, _)| *due).min()
    }

    /// Moves delayed units whose back-off has elapsed to the back of the queue,
    /// in the order they were delayed.
    fn release_due(&mut self) {
        if self.delayed.is_empty() {
            return;
        }
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(deadline, _)| *deadline <= now);
        self.delayed = waiting;
        for (_, unit) in due {
            self.queue.put(unit);
        }
    }

    fn dispatch(&mut self, task: AnnotationTask) {
        debug!(task = %task, "dispatching");
        match self.pool.submit(task) {
            Ok(()) => self.in_flight += 1,
            Err(task) => {
                error!(task = %task, "worker pool closed, dropping task");
                self.report.failed += 1;
            }
        }
    }

    fn complete(&mut self, completion: Completion) {
        self.in_flight -= 1;
        let Completion { task, result } = completion;
        match task {
            AnnotationTask::Version(version_task) => {
                let key = VersionKey::for_unit(version_task.unit());
                match result.and_then(|raw| version_task.extract_version(&raw)) {
                    Ok(version) => {
                        info!(key = %key, version = %version, "version resolved");
                        for waiting in self.versions.complete(&key, &version) {
                            self.queue.put(waiting);
                        }
                        let mut unit = version_task.into_unit();
                        unit.set_version(version);
                        self.queue.put(unit);
                    }
                    Err(err) => {
                        error!(
                            unit = %version_task.unit(),
                            key = %key,
                            task = "version",
                            error = %err,
                            "version task failed"
                        );
                        self.report.failed += 1;
                        for waiting in self.versions.fail(&key) {
                            warn!(unit = %waiting, "canceling annotation, version unavailable");
                            self.report.canceled += 1;
                        }
                    }
                }
            }
            task => match result {
                Ok(raw) => self.persist(&task, &raw),
                Err(err) => {
                    error!(
                        unit = %task.unit(),
                        data_set = %task.unit().data_set(),
                        task = %task.kind(),
                        error = %err,
                        "annotation task failed"
                    );
                    self.report.failed += 1;
                }
            },
        }
    }

    fn persist(&mut self, task: &AnnotationTask, raw: &serde_json::Value) {
        let unit = task.unit();
        let entries = task.extract(raw);
        if entries.is_empty() {
            info!(unit = %unit, task = %task.kind(), "no annotations extracted");
            return;
        }

        if let Err(err) = self.genomic_units.annotate_all(unit.genomic_unit(), &entries) {
            error!(
                unit = %unit,
                task = %task.kind(),
                error = %err,
                "failed to persist annotations"
            );
            self.report.failed += 1;
            return;
        }
        self.report.entries_written += entries.len();

        if let Err(err) =
            self.manifests
                .record(unit.analysis_name(), unit.data_set(), &unit.manifest_entry())
        {
            error!(unit = %unit, error = %err, "failed to record manifest");
            self.report.failed += 1;
            return;
        }

        info!(unit = %unit, entries = entries.len(), "annotation persisted");
        self.report.persisted += 1;
    }
}
