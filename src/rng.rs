use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use walk_common::EngineError;

/// Golden-ratio increment separating the seeds of neighbouring workers.
const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// A source of uniform draws in `[0, 1)`.
pub trait Uniform01 {
    fn uniform01(&mut self) -> f32;
}

impl Uniform01 for StdRng {
    #[inline]
    fn uniform01(&mut self) -> f32 {
        self.random::<f32>()
    }
}

/// One independent stream per worker. Stream `i` is only ever touched by the worker advancing
/// chunk `i`, so no locking is involved.
#[derive(Debug)]
pub struct RngStreams {
    base_seed: u64,
    streams: Vec<StdRng>,
}

impl RngStreams {
    /// Creates `worker_count` streams from `base_seed` combined with each worker index.
    pub fn initialize(worker_count: usize, base_seed: u64) -> Result<Self, EngineError> {
        if worker_count == 0 {
            return Err(EngineError::config("at least one RNG stream is required"));
        }
        let mut streams = Vec::new();
        streams.try_reserve_exact(worker_count).map_err(|e| {
            EngineError::resource(
                format!("allocating {} RNG streams", worker_count),
                std::io::Error::new(std::io::ErrorKind::OutOfMemory, e),
            )
        })?;
        streams.extend((0..worker_count).map(|i| StdRng::seed_from_u64(worker_seed(base_seed, i))));
        Ok(RngStreams { base_seed, streams })
    }

    pub fn base_seed(&self) -> u64 {
        self.base_seed
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Stream `i` belongs to worker `i`; draw from it with [`Uniform01::uniform01`].
    pub fn streams_mut(&mut self) -> &mut [StdRng] {
        &mut self.streams
    }
}

pub fn worker_seed(base_seed: u64, worker: usize) -> u64 {
    base_seed.wrapping_add((worker as u64).wrapping_add(1).wrapping_mul(SEED_STRIDE))
}

/// Run-derived base seed: wall clock nanoseconds mixed with the process id.
pub fn time_seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos ^ (u64::from(std::process::id()) << 32)
}
