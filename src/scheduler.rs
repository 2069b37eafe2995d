use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use rayon::prelude::*;
use walk_common::{EngineError, ExportMode, HandoffSlot, SimParams, Snapshot, SnapshotSink};

use crate::kernel::{self, KernelParams};
use crate::particles::ParticleStore;
use crate::rng::RngStreams;

/// Where the batch loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Computing,
    AwaitingHandoffSlot,
    Publishing,
    Draining,
    Terminated,
}

/// Knobs that shape the batch loop but not the physics.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub batch_increments: u64,
    pub export: ExportMode,
    pub capacity: usize,
    pub pace: Option<Duration>,
    pub base_seed: u64,
}

/// What a completed run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub increments: u64,
    pub batches: u64,
    pub publications: u64,
    pub truncated_publications: u64,
    pub jumps: u64,
    pub elapsed: Duration,
}

/// Drives increments in batches over the particle store and hands a snapshot to the sink after
/// every batch.
pub struct BatchScheduler {
    params: SimParams,
    kernel: KernelParams,
    store: ParticleStore,
    rngs: RngStreams,
    pool: rayon::ThreadPool,
    options: SchedulerOptions,
    state: SchedulerState,
    increments_done: u64,
}

/// Caps the requested worker count at the available hardware parallelism.
pub fn clamp_workers(requested: usize) -> usize {
    let available = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    if requested > available {
        warn!("Not enough cores for {} workers. Using max: {}", requested, available);
        available
    } else {
        requested
    }
}

impl BatchScheduler {
    /// Allocates the RNG table, the particle store and the worker pool. Any failure here is fatal
    /// and happens before a single increment runs.
    pub fn new(params: SimParams, options: SchedulerOptions) -> Result<Self, EngineError> {
        if options.batch_increments == 0 {
            return Err(EngineError::config("batch_increments must be at least 1"));
        }
        if options.capacity == 0 {
            return Err(EngineError::config("snapshot capacity must be at least 1"));
        }
        let workers = params.worker_count();
        let rngs = RngStreams::initialize(workers, options.base_seed)?;
        let store = ParticleStore::new(params.particle_count())?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("walk-worker-{}", i))
            .build()
            .map_err(|e| EngineError::resource("building worker pool", io::Error::other(e)))?;

        info!(
            "Scheduler ready: {} particles, {} workers, {} increments in batches of {}.",
            store.len(),
            workers,
            params.increment_count,
            options.batch_increments
        );

        Ok(BatchScheduler {
            kernel: KernelParams::from(&params),
            params,
            store,
            rngs,
            pool,
            options,
            state: SchedulerState::Idle,
            increments_done: 0,
        })
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn increments_done(&self) -> u64 {
        self.increments_done
    }

    pub fn params(&self) -> &SimParams {
        &self.params
    }

    pub fn store(&self) -> &ParticleStore {
        &self.store
    }

    pub fn base_seed(&self) -> u64 {
        self.rngs.base_seed()
    }

    /// Runs every increment, publishing the initial state, each full batch and the remainder.
    /// Ends in [`SchedulerState::Terminated`] whether or not it succeeds.
    pub fn run<S: SnapshotSink>(&mut self, sink: &mut S) -> Result<RunSummary, EngineError> {
        let started = Instant::now();
        let mut summary = RunSummary::default();
        info!("Handing snapshots off to {}", sink.describe());

        let result = self.run_batches(sink, &mut summary);
        self.transition(SchedulerState::Terminated);
        summary.increments = self.increments_done;
        summary.elapsed = started.elapsed();
        result.map(|()| summary)
    }

    fn run_batches<S: SnapshotSink>(&mut self, sink: &mut S, summary: &mut RunSummary) -> Result<(), EngineError> {
        let total = self.params.increment_count;
        let batch = self.options.batch_increments;
        let full_batches = total / batch;
        let remainder = total % batch;

        self.transition(SchedulerState::Computing);
        self.handoff(sink, summary)?;

        let mut last_report = Instant::now();
        for b in 0..full_batches {
            self.transition(SchedulerState::Computing);
            let batch_start = Instant::now();
            summary.jumps += self.advance(batch);
            summary.batches += 1;
            self.handoff(sink, summary)?;

            if last_report.elapsed() >= Duration::from_secs(5) || b + 1 == full_batches {
                info!(
                    "Batch [{}/{}] | Increments: {}/{} | Batch Time: {:6.2} ms",
                    b + 1,
                    full_batches,
                    self.increments_done,
                    total,
                    batch_start.elapsed().as_secs_f64() * 1000.0
                );
                last_report = Instant::now();
            }
        }

        if remainder > 0 {
            self.transition(SchedulerState::Draining);
            summary.jumps += self.advance(remainder);
            summary.batches += 1;
            self.handoff(sink, summary)?;
            debug!("Drained {} remainder increments.", remainder);
        }
        Ok(())
    }

    /// Runs `increments` strictly sequential increments, each one parallel over the particles.
    /// Returns the number of jump events.
    fn advance(&mut self, increments: u64) -> u64 {
        let k = self.kernel;
        let workers = self.rngs.len();
        let particles = self.store.as_mut_slice();
        // Chunk i always pairs with stream i, so results never depend on thread timing.
        let chunk_len = particles.len().div_ceil(workers);
        let rngs = &mut self.rngs;

        let mut jumps = 0;
        for _ in 0..increments {
            let step_start = Instant::now();
            jumps += self.pool.install(|| {
                particles
                    .par_chunks_mut(chunk_len)
                    .zip(rngs.streams_mut().par_iter_mut())
                    .map(|(chunk, rng)| kernel::apply_chunk(chunk, &k, rng))
                    .sum::<u64>()
            });
            trace!("Increment completed in {:.3} ms", step_start.elapsed().as_secs_f64() * 1000.0);
        }
        self.increments_done += increments;
        jumps
    }

    fn handoff<S: SnapshotSink>(&mut self, sink: &mut S, summary: &mut RunSummary) -> Result<(), EngineError> {
        let snapshot = self.store.snapshot(self.increments_done, self.options.export, self.options.capacity);

        self.transition(SchedulerState::AwaitingHandoffSlot);
        let mut slot = sink.acquire_slot()?;
        self.transition(SchedulerState::Publishing);
        let written = slot.write(&snapshot)?;
        drop(slot);

        summary.publications += 1;
        if snapshot.truncated_from.is_some() || written < snapshot.len() {
            summary.truncated_publications += 1;
        }
        debug!(
            "Published {} records at increment {} ({} jumps so far).",
            written, self.increments_done, summary.jumps
        );

        if let Some(pace) = self.options.pace {
            std::thread::sleep(pace);
        }
        self.transition(SchedulerState::Computing);
        Ok(())
    }

    fn transition(&mut self, next: SchedulerState) {
        if self.state != next {
            trace!("{:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

/// Fallback sink when no live consumer is present: rewrites a `x,y` CSV on every publish.
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CsvSink { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct CsvSlot<'a> {
    path: &'a Path,
}

impl HandoffSlot for CsvSlot<'_> {
    fn write(&mut self, snapshot: &Snapshot) -> Result<usize, EngineError> {
        let csv_err = |e: csv::Error| EngineError::resource(format!("writing {}", self.path.display()), io::Error::other(e));
        // Write aside and rename so a reader never sees a half-written file.
        let staging = self.path.with_extension("csv.tmp");

        let mut writer = csv::Writer::from_path(&staging).map_err(csv_err)?;
        writer.write_record(["x", "y"]).map_err(csv_err)?;
        for record in &snapshot.records {
            writer
                .write_record([format!("{:.3}", record.x), record.lane().to_string()])
                .map_err(csv_err)?;
        }
        writer
            .flush()
            .map_err(|e| EngineError::resource(format!("flushing {}", staging.display()), e))?;
        drop(writer);

        fs::rename(&staging, self.path)
            .map_err(|e| EngineError::resource(format!("renaming into {}", self.path.display()), e))?;
        Ok(snapshot.len())
    }
}

impl SnapshotSink for CsvSink {
    type Slot<'a> = CsvSlot<'a>;

    fn acquire_slot(&mut self) -> Result<CsvSlot<'_>, EngineError> {
        Ok(CsvSlot { path: &self.path })
    }

    fn describe(&self) -> String {
        format!("CSV file {}", self.path.display())
    }
}
