use std::io;
use std::time::Duration;

/// Failure modes of the walk engine and its shared-memory handoff.
///
/// Every variant except [`EngineError::Capacity`] is fatal to a run. Capacity overruns are
/// truncated by the bridge and only ever logged.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bad invocation or configuration values.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An allocation, mapping or descriptor operation failed.
    #[error("resource error: {context}: {source}")]
    Resource {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A snapshot had more records than the shared region can hold.
    #[error("snapshot of {requested} records exceeds shared capacity {capacity}")]
    Capacity { requested: usize, capacity: usize },

    /// The consumer held the exclusion primitive past the bounded wait.
    #[error("handoff timed out after {attempts} attempts ({waited:?}); consumer presumed unresponsive")]
    HandoffTimeout { attempts: u32, waited: Duration },

    /// The attached segment disagrees with what this producer expects.
    #[error("segment consistency error: {0}")]
    Consistency(String),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }

    pub fn resource(context: impl Into<String>, source: io::Error) -> Self {
        EngineError::Resource { context: context.into(), source }
    }

    /// Captures `errno` from the most recent failed libc call.
    pub fn last_os(context: impl Into<String>) -> Self {
        Self::resource(context, io::Error::last_os_error())
    }

    /// Process exit status reported for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            EngineError::Configuration(_) => 2,
            EngineError::Resource { .. } => 3,
            EngineError::HandoffTimeout { .. } => 4,
            EngineError::Consistency(_) => 5,
            // Never fatal on its own; kept distinct so a caller that does propagate it still fails.
            EngineError::Capacity { .. } => 6,
        }
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::Capacity { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_and_nonzero() {
        let errors = [
            EngineError::config("x"),
            EngineError::resource("x", io::Error::other("boom")),
            EngineError::HandoffTimeout { attempts: 1, waited: Duration::ZERO },
            EngineError::Consistency("x".into()),
            EngineError::Capacity { requested: 2, capacity: 1 },
        ];
        let mut codes: Vec<u8> = errors.iter().map(|e| e.exit_code()).collect();
        assert!(codes.iter().all(|&c| c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn only_capacity_is_non_fatal() {
        assert!(!EngineError::Capacity { requested: 5, capacity: 4 }.is_fatal());
        assert!(EngineError::Consistency("mismatch".into()).is_fatal());
        assert!(EngineError::HandoffTimeout { attempts: 3, waited: Duration::from_millis(30) }.is_fatal());
    }

    #[test]
    fn resource_error_keeps_its_cause() {
        let err = EngineError::resource("mmap", io::Error::from_raw_os_error(libc::ENOMEM));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert!(source.is_some());
        assert!(err.to_string().starts_with("resource error: mmap"));
    }
}
