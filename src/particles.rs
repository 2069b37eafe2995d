use std::collections::BTreeMap;

use walk_common::{EngineError, ExportMode, Snapshot, SnapshotRecord};

/// Binary orientation of a particle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Lane {
    Lower = 0,
    Upper = 1,
}

impl Lane {
    #[inline]
    pub fn flipped(self) -> Lane {
        match self {
            Lane::Lower => Lane::Upper,
            Lane::Upper => Lane::Lower,
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle {
    pub lane: Lane,
    pub x: f32,
}

/// Per-lane population summary.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LaneStats {
    pub count: usize,
    pub mean_x: f64,
    pub variance_x: f64,
}

/// Contiguous particle records, mutated in place once per increment.
#[derive(Debug)]
pub struct ParticleStore {
    particles: Vec<Particle>,
}

/// Histogram bins are 0.01 wide.
const HISTOGRAM_SCALE: f32 = 100.0;

impl ParticleStore {
    /// Allocates `count` particles at the origin: the first `count / 2` on the upper lane, the
    /// rest on the lower lane.
    pub fn new(count: usize) -> Result<Self, EngineError> {
        let mut particles = Vec::new();
        particles.try_reserve_exact(count).map_err(|e| {
            EngineError::resource(
                format!("allocating {} particles", count),
                std::io::Error::new(std::io::ErrorKind::OutOfMemory, e),
            )
        })?;
        let upper = count / 2;
        particles.extend((0..count).map(|i| Particle {
            lane: if i < upper { Lane::Upper } else { Lane::Lower },
            x: 0.0,
        }));
        Ok(ParticleStore { particles })
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    #[cfg(test)]
    pub fn as_slice(&self) -> &[Particle] {
        &self.particles
    }

    pub fn as_mut_slice(&mut self) -> &mut [Particle] {
        &mut self.particles
    }

    /// Builds the exported view of the population, cut down to `capacity` records.
    pub fn snapshot(&self, increment: u64, mode: ExportMode, capacity: usize) -> Snapshot {
        match mode {
            ExportMode::Particles => {
                // Only the first `capacity` particles can ever be exported.
                let records = self
                    .particles
                    .iter()
                    .take(capacity)
                    .map(|p| SnapshotRecord::new(p.x, p.lane.index(), 1.0))
                    .collect();
                let mut snapshot = Snapshot::new(increment, records, capacity);
                let total = self.particles.len();
                snapshot.truncated_from = (total > capacity).then_some(total);
                snapshot
            }
            ExportMode::Histogram => Snapshot::new(increment, self.histogram(), capacity),
        }
    }

    /// Frequency of each (lane, position) pair, positions quantised to 0.01.
    fn histogram(&self) -> Vec<SnapshotRecord> {
        let mut bins: BTreeMap<(u8, i64), u32> = BTreeMap::new();
        for p in &self.particles {
            let bin = (p.x * HISTOGRAM_SCALE).round() as i64;
            *bins.entry((p.lane.index(), bin)).or_insert(0) += 1;
        }
        let total = self.particles.len().max(1) as f32;
        bins.into_iter()
            .map(|((lane, bin), n)| SnapshotRecord::new(bin as f32 / HISTOGRAM_SCALE, lane, n as f32 / total))
            .collect()
    }

    /// Count, mean and variance of position for each lane, indexed by lane value.
    pub fn lane_stats(&self) -> [LaneStats; 2] {
        let mut sums = [(0usize, 0f64, 0f64); 2];
        for p in &self.particles {
            let s = &mut sums[p.lane.index() as usize];
            let x = f64::from(p.x);
            s.0 += 1;
            s.1 += x;
            s.2 += x * x;
        }
        sums.map(|(count, sum, sum_sq)| {
            if count == 0 {
                return LaneStats::default();
            }
            let n = count as f64;
            let mean_x = sum / n;
            LaneStats { count, mean_x, variance_x: (sum_sq / n - mean_x * mean_x).max(0.0) }
        })
    }
}
