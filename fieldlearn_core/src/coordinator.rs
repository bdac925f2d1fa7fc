//! Corpus walk: seeds first, then the special corpus, sequentially or across a worker pool.
//!
//! Workers never share learned state. Each unit of work (one file) is learned into a fresh
//! [`LearnedState`] that the coordinator unions into its accumulator, after which both blacklists
//! are re-enforced over the merged tree.

use crate::checkpoint::{Checkpoint, CheckpointStore, FileCounters, find_latest_run};
use crate::config::{FileFormat, LearnerConfig, RunConfig, RunContext};
use crate::corpus::{SpecialCorpus, list_seed_files};
use crate::mutator::{FileReport, LearnedState, LearningStats, MutationEngine};
use crate::oracle::{CommandStructureOracle, StructureOracle};
use crate::report::{FileResultLogger, write_results};
use crate::validator::{FormatValidator, ValidityOracle};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Conditions that cancel a run from outside the walk.
#[derive(Debug, Clone, Default)]
pub struct StopTrigger {
    /// Wall-clock budget measured from when the watcher starts.
    pub time_limit: Option<Duration>,
    /// Cancel as soon as this path exists.
    pub stop_file: Option<PathBuf>,
}

impl StopTrigger {
    pub fn is_empty(&self) -> bool {
        self.time_limit.is_none() && self.stop_file.is_none()
    }

    fn fired(&self, started: Instant) -> Option<String> {
        if let Some(limit) = self.time_limit
            && started.elapsed() >= limit
        {
            return Some(format!("time limit of {}s reached", limit.as_secs()));
        }
        match &self.stop_file {
            Some(path) if path.exists() => Some(format!("stop file {path:?} found")),
            _ => None,
        }
    }
}

/// Final figures of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub resumed: bool,
    pub cancelled: bool,
    /// Error that ended the walk before every file was visited.
    pub interrupted: Option<String>,
    pub counters: FileCounters,
    pub stats: LearningStats,
    pub learned_fields: usize,
    pub learned_values: usize,
    pub blacklisted_by_size: usize,
    pub blacklisted_by_count: usize,
    pub checksum_types: usize,
    pub result_files: Vec<PathBuf>,
}

/// Everything a unit of work needs, cheap to clone into a worker thread.
#[derive(Clone)]
struct WorkerContext {
    config: Arc<LearnerConfig>,
    oracle: Arc<dyn StructureOracle>,
    validator: Arc<dyn ValidityOracle>,
    special: SpecialCorpus,
    scratch_dir: PathBuf,
    format: FileFormat,
}

impl WorkerContext {
    fn rng_for(&self, file: &Path) -> ChaCha8Rng {
        match self.config.rng_seed {
            Some(seed) => {
                let digest = md5::compute(file.to_string_lossy().as_bytes());
                let mut mix = [0u8; 8];
                mix.copy_from_slice(&digest.0[..8]);
                ChaCha8Rng::seed_from_u64(seed ^ u64::from_le_bytes(mix))
            }
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        }
    }

    /// Learns `file` into `state`. Panics are caught and reported as failures.
    fn learn(&self, file: &Path, state: &mut LearnedState) -> Result<FileReport, String> {
        let engine = MutationEngine::new(
            self.oracle.as_ref(),
            self.validator.as_ref(),
            &self.config,
            &self.special,
            &self.scratch_dir,
            self.format,
        );
        let mut rng = self.rng_for(file);
        match catch_unwind(AssertUnwindSafe(|| engine.learn_file(file, state, &mut rng))) {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic_payload) => Err(format!("Worker panicked: {}", panic_message(panic_payload.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

enum WorkerMessage {
    Started(usize),
    Finished {
        index: usize,
        elapsed: Duration,
        outcome: Result<(LearnedState, FileReport), String>,
    },
}

/// Mutable bookkeeping of a run, owned by the coordinator thread only.
struct RunState {
    ctx: RunContext,
    learned: LearnedState,
    processed: BTreeSet<PathBuf>,
    counters: FileCounters,
    started_at: String,
    logger: FileResultLogger,
    checkpoints: CheckpointStore,
    since_save: usize,
}

impl RunState {
    fn record_success(&mut self, file: &Path, elapsed: Duration, report: &FileReport) {
        tracing::debug!(
            "Processed {file:?} in {:.2}s: {} learning spans, {} discoveries",
            elapsed.as_secs_f64(),
            report.learning_spans,
            report.discoveries
        );
        self.logger.log_success(file, elapsed);
        self.counters.succeeded += 1;
        self.mark_processed(file);
    }

    fn record_failure(&mut self, file: &Path, reason: &str, elapsed: Duration) {
        tracing::error!("Failed to process {file:?}: {reason}");
        self.logger.log_failure(file, reason, elapsed);
        self.counters.failed += 1;
        self.mark_processed(file);
    }

    fn record_timeout(&mut self, file: &Path, timeout: Duration) {
        tracing::error!("Timed out after {}s, abandoning {file:?}", timeout.as_secs());
        self.logger.log_timeout(file, timeout);
        self.counters.timed_out += 1;
        self.mark_processed(file);
    }

    fn mark_processed(&mut self, file: &Path) {
        self.processed.insert(file.to_path_buf());
        self.since_save += 1;
    }

    fn enforce_limits(&mut self) {
        for name in self.learned.values.enforce_limits() {
            tracing::info!("Post-merge blacklist (by count): '{name}'");
        }
    }

    fn save_checkpoint(&mut self, max_files: Option<usize>) {
        let checkpoint = Checkpoint::capture(
            &self.ctx,
            max_files,
            &self.started_at,
            &self.learned,
            &self.processed,
            self.counters,
        );
        match self.checkpoints.save(&checkpoint) {
            Ok(()) => self.since_save = 0,
            Err(e) => tracing::error!("Failed to save checkpoint: {e}"),
        }
    }
}

pub struct CorpusCoordinator {
    config: Arc<LearnerConfig>,
    run: RunConfig,
    oracle: Arc<dyn StructureOracle>,
    validator: Arc<dyn ValidityOracle>,
    cancel: Arc<AtomicBool>,
}

impl CorpusCoordinator {
    pub fn new(
        config: LearnerConfig,
        run: RunConfig,
        oracle: Arc<dyn StructureOracle>,
        validator: Arc<dyn ValidityOracle>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            run,
            oracle,
            validator,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Coordinator wired to the external format oracle and the stock validity checker.
    pub fn with_external_tools(config: LearnerConfig, run: RunConfig) -> Self {
        let oracle = CommandStructureOracle::new(
            config.oracle_command(run.format),
            Duration::from_millis(config.oracle.timeout_ms),
        );
        let validator = FormatValidator::from_settings(run.format, &config.validator);
        Self::new(config, run, Arc::new(oracle), Arc::new(validator))
    }

    /// Flag that stops the walk at the next file (sequential) or batch (parallel) boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Starts a thread that raises the cancel flag once `trigger` fires. The thread exits on its own
    /// when the flag is already set or when every other handle to it is gone.
    pub fn spawn_stop_watcher(&self, trigger: StopTrigger) -> std::io::Result<JoinHandle<()>> {
        let cancel = self.cancel_handle();
        let started = Instant::now();
        std::thread::Builder::new()
            .name("fieldlearn-stop-watcher".into())
            .spawn(move || {
                while Arc::strong_count(&cancel) > 1 && !cancel.load(Ordering::SeqCst) {
                    if let Some(reason) = trigger.fired(started) {
                        tracing::warn!("Cancelling run: {reason}");
                        cancel.store(true, Ordering::SeqCst);
                        return;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            })
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Walks the seeds, then the special corpus. Once the run directory exists, the checkpoint and
    /// results are always written; a walk error ends the walk early and lands in
    /// [`RunSummary::interrupted`].
    pub fn run(&self) -> Result<RunSummary, anyhow::Error> {
        let (mut state, resumed) = self.start()?;
        let interrupted = match self.walk_corpus(&mut state) {
            Ok(()) => None,
            Err(e) => {
                tracing::error!("Walk stopped early: {e:#}");
                Some(format!("{e:#}"))
            }
        };
        Ok(self.finish(state, resumed, interrupted))
    }

    fn walk_corpus(&self, state: &mut RunState) -> Result<(), anyhow::Error> {
        let special = SpecialCorpus::new(state.ctx.special_dir(), self.run.format)?;
        let worker = WorkerContext {
            config: Arc::clone(&self.config),
            oracle: Arc::clone(&self.oracle),
            validator: Arc::clone(&self.validator),
            special: special.clone(),
            scratch_dir: state.ctx.scratch_dir(),
            format: self.run.format,
        };

        let seeds = select(list_seed_files(&state.ctx.seed_dir)?, self.run.max_files);
        let seeds_taken = seeds.len();
        tracing::info!("Walking {} seed files in {:?}", seeds_taken, state.ctx.seed_dir);
        self.walk(&worker, state, seeds)?;

        let special_quota = self
            .run
            .max_files
            .map(|max| max.saturating_sub(seeds_taken));
        if !self.is_cancelled() && special_quota != Some(0) {
            let specials = select(special.entries()?, special_quota);
            tracing::info!("Walking {} special corpus files", specials.len());
            self.walk(&worker, state, specials)?;
        }
        Ok(())
    }

    /// Fresh or resumed run state.
    fn start(&self) -> Result<(RunState, bool), anyhow::Error> {
        let mut restored = None;
        if self.run.resume {
            match find_latest_run(&self.config.paths.logs_root, self.run.format)? {
                Some(run_id) => {
                    let ctx = RunContext::at(&self.config, &self.run, run_id);
                    let checkpoint = CheckpointStore::new(ctx.checkpoint_path()).load()?;
                    tracing::info!(
                        "Resuming run {} with {} files already processed",
                        ctx.run_id,
                        checkpoint.files_processed_count
                    );
                    restored = Some((ctx, checkpoint));
                }
                None => tracing::info!(
                    "No previous {} run to resume, starting fresh",
                    self.run.format
                ),
            }
        }
        let resumed = restored.is_some();

        let (ctx, learned, processed, counters, started_at) = match restored {
            Some((ctx, checkpoint)) => (
                ctx,
                checkpoint.restore_state(self.config.limits.max_unique_values),
                checkpoint.processed_files,
                checkpoint.counters,
                checkpoint.started_at,
            ),
            None => {
                let now = chrono::Local::now();
                (
                    RunContext::fresh(&self.config, &self.run, now),
                    LearnedState::new(self.config.limits.max_unique_values),
                    BTreeSet::new(),
                    FileCounters::default(),
                    now.to_rfc3339(),
                )
            }
        };
        ctx.ensure_directories_exist()
            .map_err(|e| anyhow::anyhow!("Failed to create run directory {:?}: {e}", ctx.run_dir))?;
        tracing::info!("Run directory: {:?}", ctx.run_dir);

        let logger = FileResultLogger::new(&ctx.run_dir, resumed)?;
        let checkpoints = CheckpointStore::new(ctx.checkpoint_path());
        Ok((
            RunState {
                ctx,
                learned,
                processed,
                counters,
                started_at,
                logger,
                checkpoints,
                since_save: 0,
            },
            resumed,
        ))
    }

    fn walk(
        &self,
        worker: &WorkerContext,
        state: &mut RunState,
        files: Vec<PathBuf>,
    ) -> Result<(), anyhow::Error> {
        let total = files.len();
        let pending: Vec<PathBuf> = files
            .into_iter()
            .filter(|f| !state.processed.contains(f))
            .collect();
        let skipped = total - pending.len();
        if skipped > 0 {
            tracing::info!("Skipping {skipped} already processed files");
            state.counters.skipped += skipped as u64;
        }

        let workers = self.config.parallel.effective_workers();
        if workers <= 1 {
            self.walk_sequential(worker, state, pending);
            Ok(())
        } else {
            self.walk_parallel(worker, state, pending, workers)
        }
    }

    fn walk_sequential(&self, worker: &WorkerContext, state: &mut RunState, files: Vec<PathBuf>) {
        let save_interval = self.config.checkpoint.save_interval.max(1);
        let total = files.len();
        for (i, file) in files.iter().enumerate() {
            if self.is_cancelled() {
                tracing::info!("Cancelled after {i} of {total} files");
                break;
            }
            tracing::info!("Processing {}/{}: {file:?}", i + 1, total);
            let started = Instant::now();
            match worker.learn(file, &mut state.learned) {
                Ok(report) => state.record_success(file, started.elapsed(), &report),
                Err(reason) => state.record_failure(file, &reason, started.elapsed()),
            }
            if state.since_save >= save_interval {
                state.save_checkpoint(self.run.max_files);
            }
        }
    }

    fn walk_parallel(
        &self,
        worker: &WorkerContext,
        state: &mut RunState,
        files: Vec<PathBuf>,
        workers: usize,
    ) -> Result<(), anyhow::Error> {
        let batch_size = self.config.parallel.batch_size.max(1);
        let timeout = Duration::from_secs(self.config.parallel.file_timeout_secs);
        let batches = files.len().div_ceil(batch_size);
        tracing::info!(
            "Processing {} files with {workers} workers in {batches} batches",
            files.len()
        );

        for (batch_index, batch) in files.chunks(batch_size).enumerate() {
            if self.is_cancelled() {
                tracing::info!("Cancelled before batch {}/{batches}", batch_index + 1);
                break;
            }
            tracing::info!("Batch {}/{batches}: {} files", batch_index + 1, batch.len());
            self.run_batch(worker, state, batch, workers, timeout)?;
            state.enforce_limits();
            state.save_checkpoint(self.run.max_files);
        }
        Ok(())
    }

    fn run_batch(
        &self,
        worker: &WorkerContext,
        state: &mut RunState,
        batch: &[PathBuf],
        workers: usize,
        timeout: Duration,
    ) -> Result<(), anyhow::Error> {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<(usize, PathBuf)>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<WorkerMessage>();
        for job in batch.iter().cloned().enumerate() {
            job_tx.send(job)?;
        }
        drop(job_tx);

        for id in 0..workers.min(batch.len()) {
            spawn_worker(id, worker.clone(), job_rx.clone(), result_tx.clone())?;
        }
        let mut next_worker_id = workers;

        let mut running: HashMap<usize, Instant> = HashMap::new();
        let mut abandoned: HashSet<usize> = HashSet::new();
        let mut settled = 0;

        while settled < batch.len() {
            match result_rx.recv_timeout(POLL_INTERVAL) {
                Ok(WorkerMessage::Started(index)) => {
                    running.insert(index, Instant::now());
                }
                Ok(WorkerMessage::Finished {
                    index,
                    elapsed,
                    outcome,
                }) => {
                    if abandoned.contains(&index) {
                        tracing::debug!("Ignoring late result for abandoned {:?}", batch[index]);
                        continue;
                    }
                    running.remove(&index);
                    settled += 1;
                    let file = &batch[index];
                    match outcome {
                        Ok((learned, report)) => {
                            state.learned.union(learned);
                            state.record_success(file, elapsed, &report);
                        }
                        Err(reason) => state.record_failure(file, &reason, elapsed),
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    anyhow::bail!("All workers exited with {} files unsettled", batch.len() - settled);
                }
            }

            let expired: Vec<usize> = running
                .iter()
                .filter(|(_, started)| started.elapsed() > timeout)
                .map(|(index, _)| *index)
                .collect();
            for index in expired {
                running.remove(&index);
                abandoned.insert(index);
                settled += 1;
                state.record_timeout(&batch[index], timeout);
                // The stuck thread keeps its slot; a replacement serves the rest of the queue.
                if !job_rx.is_empty() {
                    spawn_worker(next_worker_id, worker.clone(), job_rx.clone(), result_tx.clone())?;
                    next_worker_id += 1;
                }
            }
        }
        Ok(())
    }

    fn finish(&self, mut state: RunState, resumed: bool, interrupted: Option<String>) -> RunSummary {
        state.enforce_limits();
        state.save_checkpoint(self.run.max_files);

        let result_files = match write_results(
            &state.ctx,
            &state.learned.values,
            &state.learned.checksums,
            self.config.limits.max_span_bytes,
        ) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::error!("Error saving results: {e}");
                Vec::new()
            }
        };

        let values = &state.learned.values;
        let summary = RunSummary {
            run_id: state.ctx.run_id.clone(),
            run_dir: state.ctx.run_dir.clone(),
            resumed,
            cancelled: self.is_cancelled(),
            interrupted,
            counters: state.counters,
            stats: state.learned.stats,
            learned_fields: values.leaf_count(),
            learned_values: values.value_count(),
            blacklisted_by_size: values.blacklists().by_size.len(),
            blacklisted_by_count: values.blacklists().by_count.len(),
            checksum_types: state.learned.checksums.by_type.len(),
            result_files,
        };
        tracing::info!(
            "Run {} finished: {} succeeded, {} failed, {} timed out, {} skipped",
            summary.run_id,
            summary.counters.succeeded,
            summary.counters.failed,
            summary.counters.timed_out,
            summary.counters.skipped
        );
        summary
    }
}

fn select(files: Vec<PathBuf>, quota: Option<usize>) -> Vec<PathBuf> {
    match quota {
        Some(max) => files.into_iter().take(max).collect(),
        None => files,
    }
}

fn spawn_worker(
    id: usize,
    ctx: WorkerContext,
    jobs: Receiver<(usize, PathBuf)>,
    results: Sender<WorkerMessage>,
) -> Result<(), anyhow::Error> {
    std::thread::Builder::new()
        .name(format!("fieldlearn-worker-{id}"))
        .spawn(move || {
            while let Ok((index, file)) = jobs.recv() {
                if results.send(WorkerMessage::Started(index)).is_err() {
                    return;
                }
                let started = Instant::now();
                let mut private = LearnedState::new(ctx.config.limits.max_unique_values);
                let outcome = ctx
                    .learn(&file, &mut private)
                    .map(|report| (private, report));
                let message = WorkerMessage::Finished {
                    index,
                    elapsed: started.elapsed(),
                    outcome,
                };
                if results.send(message).is_err() {
                    return;
                }
            }
        })
        .map_err(|e| anyhow::anyhow!("Failed to spawn worker thread {id}: {e}"))?;
    Ok(())
}
