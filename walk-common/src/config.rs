use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::EngineError;
use crate::handoff::HandoffPolicy;

// Configuration for the producer/consumer handoff
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct HandoffConfig {
    pub segment_name: String,
    pub semaphore_name: String,
    /// Increments executed between two publications.
    pub batch_increments: u64,
    pub retries: u32,
    pub backoff_ms: u64,
    /// Optional sleep after each publication, for consumers that redraw slowly.
    pub pace_ms: u64,
    pub sink: SinkKind,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Shared,
    Csv,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalkVariant {
    /// Lane selects which side the move probability favours.
    SymmetricBias,
    /// Unbiased step plus a lane-dependent drift offset.
    Drift,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepSize {
    /// sqrt(2 * D * dt)
    Continuous,
    /// Fixed `lattice_unit` per move.
    Lattice,
}

// Walk behaviour choices that are not physical inputs
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct WalkConfig {
    pub variant: WalkVariant,
    pub step_size: StepSize,
    pub lattice_unit: f32,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct RngConfig {
    /// Base seed for all worker streams. Time-derived when absent.
    pub seed: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportMode {
    Particles,
    Histogram,
}

// Configuration for output settings
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub fallback_csv: String,
    pub export: ExportMode,
}

/// Deployment configuration, loaded from an optional TOML file.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub handoff: HandoffConfig,
    pub walk: WalkConfig,
    pub rng: RngConfig,
    pub output: OutputConfig,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        HandoffConfig {
            segment_name: String::from("/particle_shm"),
            semaphore_name: String::from("/particle_sem"),
            batch_increments: 10,
            retries: 50,
            backoff_ms: 20,
            pace_ms: 0,
            sink: SinkKind::Shared,
        }
    }
}

impl Default for WalkConfig {
    fn default() -> Self {
        WalkConfig {
            variant: WalkVariant::SymmetricBias,
            step_size: StepSize::Continuous,
            lattice_unit: 1.0,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            fallback_csv: String::from("particles.csv"),
            export: ExportMode::Particles,
        }
    }
}

impl HandoffConfig {
    pub fn policy(&self) -> HandoffPolicy {
        HandoffPolicy::new(self.retries, Duration::from_millis(self.backoff_ms))
    }

    pub fn pace(&self) -> Option<Duration> {
        (self.pace_ms > 0).then(|| Duration::from_millis(self.pace_ms))
    }
}

impl EngineConfig {
    /// Loads the configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref).map_err(|e| {
            EngineError::config(format!("failed to read config file '{}': {}", path_ref.display(), e))
        })?;
        Self::from_toml_str(&config_str)
            .map_err(|e| EngineError::config(format!("{} ({})", e, path_ref.display())))
    }

    /// Like [`EngineConfig::load`], but a file that does not exist yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            log::debug!("No config file at '{}', using defaults.", path.as_ref().display());
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(config_str: &str) -> Result<Self, EngineError> {
        let config: EngineConfig = toml::from_str(config_str)
            .map_err(|e| EngineError::config(format!("failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        validate_posix_name("segment_name", &self.handoff.segment_name)?;
        validate_posix_name("semaphore_name", &self.handoff.semaphore_name)?;
        if self.handoff.batch_increments == 0 {
            return Err(EngineError::config("batch_increments must be at least 1"));
        }
        if !(self.walk.lattice_unit.is_finite() && self.walk.lattice_unit > 0.0) {
            return Err(EngineError::config("lattice_unit must be a positive number"));
        }
        if self.output.fallback_csv.is_empty() {
            return Err(EngineError::config("fallback_csv must not be empty"));
        }
        Ok(())
    }
}

/// POSIX shared object names are a single leading slash followed by a non-empty name.
fn validate_posix_name(field: &str, name: &str) -> Result<(), EngineError> {
    let valid = name.len() > 1
        && name.len() <= 255
        && name.starts_with('/')
        && !name[1..].contains('/')
        && !name.contains('\0');
    if valid {
        Ok(())
    } else {
        Err(EngineError::config(format!(
            "{} '{}' must look like '/name' with no further slashes",
            field, name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.handoff.batch_increments, 10);
        assert_eq!(config.handoff.segment_name, "/particle_shm");
        assert_eq!(config.handoff.sink, SinkKind::Shared);
        assert_eq!(config.walk.variant, WalkVariant::SymmetricBias);
        assert_eq!(config.output.export, ExportMode::Particles);
        assert!(config.rng.seed.is_none());
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [handoff]
            retries = 3
            sink = "csv"

            [walk]
            variant = "drift"
            step_size = "lattice"

            [rng]
            seed = 42
            "#,
        )
        .unwrap();
        assert_eq!(config.handoff.retries, 3);
        assert_eq!(config.handoff.backoff_ms, 20);
        assert_eq!(config.handoff.sink, SinkKind::Csv);
        assert_eq!(config.walk.variant, WalkVariant::Drift);
        assert_eq!(config.walk.step_size, StepSize::Lattice);
        assert_eq!(config.walk.lattice_unit, 1.0);
        assert_eq!(config.rng.seed, Some(42));
    }

    #[test]
    fn rejects_bad_names_and_batch() {
        assert!(EngineConfig::from_toml_str("[handoff]\nsegment_name = \"no_slash\"").is_err());
        assert!(EngineConfig::from_toml_str("[handoff]\nsemaphore_name = \"/a/b\"").is_err());
        assert!(EngineConfig::from_toml_str("[handoff]\nbatch_increments = 0").is_err());
        assert!(EngineConfig::from_toml_str("[walk]\nlattice_unit = 0.0").is_err());
        assert!(EngineConfig::from_toml_str("[walk]\nvariant = \"sideways\"").is_err());
    }

    #[test]
    fn missing_default_file_is_not_an_error() {
        let path = std::env::temp_dir().join(format!("walk-missing-{}.toml", std::process::id()));
        assert!(EngineConfig::load_or_default(&path).is_ok());
        assert!(matches!(EngineConfig::load(&path), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn policy_and_pace_follow_millis() {
        let mut handoff = HandoffConfig::default();
        assert_eq!(handoff.policy().budget(), Duration::from_millis(50 * 20));
        assert!(handoff.pace().is_none());
        handoff.pace_ms = 105;
        assert_eq!(handoff.pace(), Some(Duration::from_millis(105)));
    }
}
