use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Record slots in a shared segment built with the default layout.
pub const SNAPSHOT_CAPACITY: usize = 4096;

/// "WKSH", stamped into every initialised segment header.
pub const SEGMENT_MAGIC: u32 = 0x574B_5348;
pub const LAYOUT_VERSION: u32 = 1;

/// One exported record, as laid out in shared memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SnapshotRecord {
    pub x: f32,
    /// Lane of the particle (0.0 or 1.0).
    pub y: f32,
    pub weight: f32,
}

/// Fixed header at offset 0 of the shared segment. `count` leads so that a consumer reading only
/// `{count, padding, records}` still finds it first.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SegmentHeader {
    pub count: i32,
    pub magic: u32,
    pub version: u32,
    pub capacity: u32,
    pub particle_count: i32,
    pub sequence: u32,
}

impl SegmentHeader {
    pub const SIZE: usize = std::mem::size_of::<SegmentHeader>();

    pub fn stamped(capacity: usize, particle_count: usize) -> Self {
        SegmentHeader {
            count: 0,
            magic: SEGMENT_MAGIC,
            version: LAYOUT_VERSION,
            capacity: capacity as u32,
            particle_count: particle_count as i32,
            sequence: 0,
        }
    }

    pub fn is_stamped(&self) -> bool {
        self.magic != 0
    }
}

impl SnapshotRecord {
    pub const SIZE: usize = std::mem::size_of::<SnapshotRecord>();

    pub fn new(x: f32, lane: u8, weight: f32) -> Self {
        SnapshotRecord { x, y: f32::from(lane), weight }
    }

    pub fn lane(&self) -> u8 {
        if self.y >= 0.5 { 1 } else { 0 }
    }
}

/// Total byte size of a segment holding `capacity` records.
pub fn segment_size(capacity: usize) -> usize {
    SegmentHeader::SIZE + capacity * SnapshotRecord::SIZE
}

/// A bounded view of the particle population, ready to hand off.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Increments completed when this snapshot was taken.
    pub increment: u64,
    pub records: Vec<SnapshotRecord>,
    /// Size of the population (or histogram) before it was cut down to capacity, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated_from: Option<usize>,
}

impl Snapshot {
    pub fn new(increment: u64, mut records: Vec<SnapshotRecord>, capacity: usize) -> Self {
        let truncated_from = (records.len() > capacity).then_some(records.len());
        records.truncate(capacity);
        Snapshot { increment, records, truncated_from }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_sizes_are_fixed() {
        assert_eq!(SegmentHeader::SIZE, 24);
        assert_eq!(SnapshotRecord::SIZE, 12);
        assert_eq!(segment_size(0), 24);
        assert_eq!(segment_size(SNAPSHOT_CAPACITY), 24 + 12 * 4096);
    }

    #[test]
    fn count_is_the_first_field() {
        let mut header = SegmentHeader::stamped(8, 3);
        header.count = 7;
        assert_eq!(&header.as_bytes()[..4], &7i32.to_ne_bytes());
        assert_eq!(&header.as_bytes()[4..8], &SEGMENT_MAGIC.to_ne_bytes());
    }

    #[test]
    fn header_reads_back_from_bytes() {
        let header = SegmentHeader::stamped(16, 10);
        let mut buf = vec![0u8; segment_size(16)];
        buf[..SegmentHeader::SIZE].copy_from_slice(header.as_bytes());
        let (parsed, rest) = SegmentHeader::read_from_prefix(&buf).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_stamped());
        assert_eq!(rest.len(), 16 * SnapshotRecord::SIZE);
        assert!(!SegmentHeader::default().is_stamped());
    }

    #[test]
    fn snapshot_truncates_to_capacity() {
        let records = vec![SnapshotRecord::new(1.0, 1, 1.0); 10];
        let snapshot = Snapshot::new(3, records.clone(), 4);
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot.truncated_from, Some(10));

        let whole = Snapshot::new(3, records, 10);
        assert_eq!(whole.len(), 10);
        assert!(whole.truncated_from.is_none());
    }

    #[test]
    fn record_lane_round_trips_through_float() {
        assert_eq!(SnapshotRecord::new(0.0, 1, 1.0).lane(), 1);
        assert_eq!(SnapshotRecord::new(0.0, 0, 1.0).lane(), 0);
    }
}
