pub mod config;
pub mod error;
pub mod handoff;
pub mod shm;
pub mod sim_params;
pub mod snapshot;

// Re-export key types for easier use by dependent crates
pub use config::{EngineConfig, ExportMode, HandoffConfig, OutputConfig, RngConfig, SinkKind, StepSize, WalkConfig, WalkVariant};
pub use error::EngineError;
pub use handoff::{HandoffPolicy, HandoffSlot, SnapshotSink};
pub use shm::{NamedSemaphore, SegmentContents, SharedSegment};
pub use sim_params::{PhysicalInputs, SimParams};
pub use snapshot::{SegmentHeader, Snapshot, SnapshotRecord, LAYOUT_VERSION, SEGMENT_MAGIC, SNAPSHOT_CAPACITY};
