use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use log::{debug, error, info};
use std::path::PathBuf;
use std::process::ExitCode;

// Define modules used by main
mod kernel;
mod particles;
mod rng;
mod scheduler;

use scheduler::{clamp_workers, BatchScheduler, CsvSink, RunSummary, SchedulerOptions};
use walk_common::{EngineConfig, EngineError, PhysicalInputs, SharedSegment, SimParams, SinkKind, SNAPSHOT_CAPACITY};

const DEFAULT_CONFIG: &str = "walk.toml";

/// Two-lane persistent random walk with drift, handing snapshots to a consumer over shared memory.
#[derive(Parser, Debug)]
#[command(name = "walk-engine", version)]
struct Args {
    /// Time increment
    #[arg(allow_negative_numbers = true)]
    delta_t: f32,
    /// Total simulated time
    #[arg(allow_negative_numbers = true)]
    time_const: f32,
    /// Diffusion constant
    #[arg(allow_negative_numbers = true)]
    diffusion_constant: f32,
    /// Drift bias
    #[arg(allow_negative_numbers = true)]
    bias: f32,
    /// Lane flip rate
    #[arg(allow_negative_numbers = true)]
    jump_rate: f32,
    /// Number of particles
    particle_count: usize,
    /// Worker threads (capped at the available cores)
    worker_count: usize,

    /// Deployment configuration (TOML). Defaults apply when walk.toml is absent.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    // Initialize the logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(&args) {
        Ok(summary) => {
            info!(
                "Run complete: {} increments in {} batches, {} publications ({} truncated), {} jumps, {:.3} s.",
                summary.increments,
                summary.batches,
                summary.publications,
                summary.truncated_publications,
                summary.jumps,
                summary.elapsed.as_secs_f64()
            );
            ExitCode::SUCCESS
        }
        Err(err) => match err.downcast_ref::<EngineError>() {
            // Bad invocation values get the same usage treatment as a wrong argument count.
            Some(EngineError::Configuration(msg)) => Args::command().error(ErrorKind::ValueValidation, msg).exit(),
            Some(engine_err) => {
                error!("{:#}", err);
                ExitCode::from(engine_err.exit_code())
            }
            None => {
                error!("{:#}", err);
                ExitCode::FAILURE
            }
        },
    }
}

fn run(args: &Args) -> Result<RunSummary> {
    info!("Starting walk engine...");

    // --- Load Configuration ---
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default(DEFAULT_CONFIG)?,
    };

    let inputs = PhysicalInputs {
        delta_t: args.delta_t,
        time_const: args.time_const,
        diffusion_constant: args.diffusion_constant,
        bias: args.bias,
        jump_rate: args.jump_rate,
        particle_count: args.particle_count,
        worker_count: clamp_workers(args.worker_count),
    };
    let params = SimParams::derive(inputs, &config.walk)?;
    info!(
        "Behavior: increments {} | particles {} | move distance {:.4} | move probability {:.4} | jump probability {:.4}",
        params.increment_count,
        params.particle_count(),
        params.move_distance,
        params.move_prob,
        params.jump_prob
    );
    debug!("Simulation Parameters: {:#?}", params);

    let base_seed = config.rng.seed.unwrap_or_else(rng::time_seed);
    info!("Base RNG seed {} (set [rng] seed in the config to reproduce this run).", base_seed);

    let capacity = snapshot_capacity(config.handoff.sink, params.particle_count());

    // RNG table and particle store are allocated before anything is mapped.
    let mut scheduler = BatchScheduler::new(
        params,
        SchedulerOptions {
            batch_increments: config.handoff.batch_increments,
            export: config.output.export,
            capacity,
            pace: config.handoff.pace(),
            base_seed,
        },
    )?;
    info!("All initialization successful. Running.");

    let summary = match config.handoff.sink {
        SinkKind::Shared => {
            let mut segment = SharedSegment::attach(
                &config.handoff.segment_name,
                &config.handoff.semaphore_name,
                capacity,
                scheduler.params().particle_count(),
                config.handoff.policy(),
            )
            .context("attaching shared segment")?;
            // On error the segment is dropped here, which unmaps and closes it.
            let summary = scheduler.run(&mut segment).context("batch loop")?;
            segment.detach();
            summary
        }
        SinkKind::Csv => {
            let mut sink = CsvSink::new(&config.output.fallback_csv);
            let summary = scheduler.run(&mut sink).context("batch loop")?;
            info!("Final positions saved to {}", sink.path().display());
            summary
        }
    };

    debug!(
        "Scheduler {:?} after {} increments (base seed {}).",
        scheduler.state(),
        scheduler.increments_done(),
        scheduler.base_seed()
    );
    for (lane, stats) in scheduler.store().lane_stats().iter().enumerate() {
        info!(
            "Lane {}: {} particles | mean x {:.4} | variance {:.4}",
            lane, stats.count, stats.mean_x, stats.variance_x
        );
    }
    Ok(summary)
}

/// Records per publication: the fixed segment layout for a live consumer, the whole population
/// for the CSV file.
fn snapshot_capacity(sink: SinkKind, particle_count: usize) -> usize {
    match sink {
        SinkKind::Shared => SNAPSHOT_CAPACITY,
        SinkKind::Csv => particle_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seven_positionals_parse() {
        let args = Args::try_parse_from(["walk-engine", "0.5", "10", "1", "-0.25", "0.1", "100", "2"]).unwrap();
        assert_eq!(args.delta_t, 0.5);
        assert_eq!(args.bias, -0.25);
        assert_eq!(args.particle_count, 100);
        assert_eq!(args.worker_count, 2);
        assert!(args.config.is_none());
    }

    #[test]
    fn wrong_arity_is_a_usage_error() {
        let err = Args::try_parse_from(["walk-engine", "1", "0", "1", "0", "0", "10"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert_ne!(err.exit_code(), 0);

        let extra = Args::try_parse_from(["walk-engine", "1", "0", "1", "0", "0", "10", "1", "9"]).unwrap_err();
        assert_eq!(extra.kind(), ErrorKind::UnknownArgument);
    }

    #[test]
    fn unparsable_count_is_rejected() {
        assert!(Args::try_parse_from(["walk-engine", "1", "0", "1", "0", "0", "ten", "1"]).is_err());
    }

    #[test]
    fn zero_particles_is_a_configuration_error() {
        let args = Args::try_parse_from(["walk-engine", "1", "0", "1", "0", "0", "0", "1"]).unwrap();
        let err = run(&args).unwrap_err();
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::Configuration(msg)) => assert!(msg.contains("particleCount"), "{}", msg),
            other => panic!("expected a configuration error, got {:?}", other),
        }
    }

    #[test]
    fn missing_explicit_config_is_a_configuration_error() {
        let args = Args::try_parse_from(["walk-engine", "1", "0", "1", "0", "0", "10", "1", "--config", "/nonexistent/walk.toml"])
            .unwrap();
        let err = run(&args).unwrap_err();
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::Configuration(msg)) => assert!(msg.contains("/nonexistent/walk.toml"), "{}", msg),
            other => panic!("expected a configuration error, got {:?}", other),
        }
    }

    #[test]
    fn csv_capacity_covers_every_particle() {
        assert_eq!(snapshot_capacity(SinkKind::Shared, 10_000), SNAPSHOT_CAPACITY);
        assert_eq!(snapshot_capacity(SinkKind::Csv, 10_000), 10_000);
    }

    #[test]
    fn csv_run_with_zero_time_completes() {
        let dir = std::env::temp_dir();
        let pid = std::process::id();
        let csv_path = dir.join(format!("walk-main-{}.csv", pid));
        let config_path = dir.join(format!("walk-main-{}.toml", pid));
        std::fs::write(
            &config_path,
            format!("[handoff]\nsink = \"csv\"\n\n[output]\nfallback_csv = {:?}\n\n[rng]\nseed = 1\n", csv_path.display().to_string()),
        )
        .unwrap();

        let config_arg = config_path.display().to_string();
        let args = Args::try_parse_from(["walk-engine", "1.0", "0", "1", "0", "0", "10", "1", "--config", &config_arg]).unwrap();
        let summary = run(&args).unwrap();
        let written = std::fs::read_to_string(&csv_path).unwrap();
        let _ = std::fs::remove_file(&csv_path);
        let _ = std::fs::remove_file(&config_path);

        assert_eq!(summary.increments, 0);
        assert_eq!(summary.publications, 1);
        assert_eq!(written.lines().count(), 11);
    }

    #[test]
    fn csv_run_writes_every_particle_past_segment_capacity() {
        let dir = std::env::temp_dir();
        let pid = std::process::id();
        let csv_path = dir.join(format!("walk-main-large-{}.csv", pid));
        let config_path = dir.join(format!("walk-main-large-{}.toml", pid));
        std::fs::write(
            &config_path,
            format!("[handoff]\nsink = \"csv\"\n\n[output]\nfallback_csv = {:?}\n\n[rng]\nseed = 3\n", csv_path.display().to_string()),
        )
        .unwrap();

        let particles = SNAPSHOT_CAPACITY + 904;
        let particles_arg = particles.to_string();
        let config_arg = config_path.display().to_string();
        let args =
            Args::try_parse_from(["walk-engine", "1.0", "2", "1", "0", "0.1", &particles_arg, "2", "--config", &config_arg]).unwrap();
        let summary = run(&args).unwrap();
        let written = std::fs::read_to_string(&csv_path).unwrap();
        let _ = std::fs::remove_file(&csv_path);
        let _ = std::fs::remove_file(&config_path);

        assert_eq!(summary.increments, 2);
        assert_eq!(summary.truncated_publications, 0);
        let mut lines = written.lines();
        assert_eq!(lines.next(), Some("x,y"));
        assert_eq!(lines.count(), particles);
    }
}
