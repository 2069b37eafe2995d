use serde::{Deserialize, Serialize};

use crate::config::{StepSize, WalkConfig, WalkVariant};
use crate::error::EngineError;

/// The seven physical inputs a run is started with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicalInputs {
    pub delta_t: f32,
    pub time_const: f32,
    pub diffusion_constant: f32,
    pub bias: f32,
    pub jump_rate: f32,
    pub particle_count: usize,
    pub worker_count: usize,
}

/// Simulation constants derived once from the physical inputs. Immutable for the whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimParams {
    pub inputs: PhysicalInputs,
    pub variant: WalkVariant,

    // Derived
    pub jump_prob: f32,     // Lane flip probability per increment
    pub move_prob: f32,     // Probability of a positive move on the upper lane, in [0, 1]
    pub move_distance: f32, // Displacement of one move
    pub drift_offset: f32,  // Lane-dependent offset applied by the drift variant (bias * dt)
    pub increment_count: u64,
}

impl SimParams {
    /// Validates the inputs and derives every constant the kernel and scheduler need.
    pub fn derive(inputs: PhysicalInputs, walk: &WalkConfig) -> Result<Self, EngineError> {
        let PhysicalInputs { delta_t, time_const, diffusion_constant, bias, jump_rate, .. } = inputs;

        for (name, value) in [
            ("deltaT", delta_t),
            ("timeConst", time_const),
            ("diffusionConstant", diffusion_constant),
            ("bias", bias),
            ("jumpRate", jump_rate),
        ] {
            if !value.is_finite() {
                return Err(EngineError::config(format!("{} must be a finite number, got {}", name, value)));
            }
        }
        if delta_t <= 0.0 {
            return Err(EngineError::config(format!("deltaT must be positive, got {}", delta_t)));
        }
        if time_const < 0.0 {
            return Err(EngineError::config(format!("timeConst must not be negative, got {}", time_const)));
        }
        if diffusion_constant < 0.0 {
            return Err(EngineError::config(format!(
                "diffusionConstant must not be negative, got {}",
                diffusion_constant
            )));
        }
        if jump_rate < 0.0 {
            return Err(EngineError::config(format!("jumpRate must not be negative, got {}", jump_rate)));
        }
        if inputs.particle_count == 0 {
            return Err(EngineError::config("particleCount must be at least 1"));
        }
        if inputs.particle_count > i32::MAX as usize {
            return Err(EngineError::config("particleCount does not fit the shared layout"));
        }
        if inputs.worker_count == 0 {
            return Err(EngineError::config("workerCount must be at least 1"));
        }

        let jump_prob = jump_rate * delta_t;
        if jump_prob > 1.0 {
            log::warn!("jumpRate * deltaT = {:.4} exceeds 1; every increment will be a jump.", jump_prob);
        }

        Ok(SimParams {
            inputs,
            variant: walk.variant,
            jump_prob,
            move_prob: move_probability(diffusion_constant, bias, delta_t),
            move_distance: move_distance(walk.step_size, walk.lattice_unit, diffusion_constant, delta_t),
            drift_offset: bias * delta_t,
            increment_count: increment_count(time_const, delta_t),
        })
    }

    pub fn particle_count(&self) -> usize {
        self.inputs.particle_count
    }

    pub fn worker_count(&self) -> usize {
        self.inputs.worker_count
    }
}

/// Probability that an upper-lane particle moves in the positive direction.
///
/// `0.5 * (1 + b * sqrt(dt / 2D))`, clamped to `[0, 1]`. With no diffusion and no bias the walk is
/// exactly even; with no diffusion but some bias the raw value is infinite and saturates.
pub fn move_probability(diffusion_constant: f32, bias: f32, delta_t: f32) -> f32 {
    if diffusion_constant == 0.0 && bias == 0.0 {
        return 0.5;
    }
    let raw = 0.5 * (1.0 + bias * (delta_t / (2.0 * diffusion_constant)).sqrt());
    if raw.is_nan() {
        return 0.5;
    }
    raw.clamp(0.0, 1.0)
}

pub fn move_distance(step: StepSize, lattice_unit: f32, diffusion_constant: f32, delta_t: f32) -> f32 {
    match step {
        StepSize::Continuous => (2.0 * diffusion_constant * delta_t).sqrt(),
        StepSize::Lattice => lattice_unit,
    }
}

pub fn increment_count(time_const: f32, delta_t: f32) -> u64 {
    (time_const / delta_t).floor() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(delta_t: f32, time_const: f32, d: f32, bias: f32, jump_rate: f32) -> PhysicalInputs {
        PhysicalInputs {
            delta_t,
            time_const,
            diffusion_constant: d,
            bias,
            jump_rate,
            particle_count: 10,
            worker_count: 1,
        }
    }

    #[test]
    fn zero_diffusion_zero_bias_is_exactly_half() {
        assert_eq!(move_probability(0.0, 0.0, 1.0), 0.5);
        assert_eq!(move_probability(0.0, 0.0, 1e-6), 0.5);
        assert_eq!(move_probability(3.0, 0.0, 0.25), 0.5);
    }

    #[test]
    fn move_probability_is_always_clamped() {
        for &d in &[1e-6f32, 0.01, 0.5, 1.0, 10.0] {
            for &b in &[-1e6f32, -50.0, -1.0, -0.1, 0.0, 0.1, 1.0, 50.0, 1e6] {
                for &dt in &[1e-3f32, 0.1, 1.0, 100.0] {
                    let p = move_probability(d, b, dt);
                    assert!((0.0..=1.0).contains(&p), "p={} for d={} b={} dt={}", p, d, b, dt);
                }
            }
        }
        assert_eq!(move_probability(0.0, 2.0, 1.0), 1.0);
        assert_eq!(move_probability(0.0, -2.0, 1.0), 0.0);
    }

    #[test]
    fn positive_bias_favours_positive_moves() {
        assert!(move_probability(1.0, 1.0, 1.0) > 0.5);
        assert!(move_probability(1.0, -0.2, 1.0) < 0.5);
    }

    #[test]
    fn step_sizes() {
        assert!((move_distance(StepSize::Continuous, 1.0, 2.0, 1.0) - 2.0).abs() < 1e-6);
        assert_eq!(move_distance(StepSize::Lattice, 1.0, 2.0, 1.0), 1.0);
        assert_eq!(move_distance(StepSize::Lattice, 0.5, 2.0, 1.0), 0.5);
    }

    #[test]
    fn derive_computes_increments_and_jump_prob() {
        let params = SimParams::derive(inputs(0.1, 1.0, 1.0, 0.0, 2.0), &WalkConfig::default()).unwrap();
        assert_eq!(params.increment_count, 10);
        assert!((params.jump_prob - 0.2).abs() < 1e-6);
        assert_eq!(params.move_prob, 0.5);

        let zero = SimParams::derive(inputs(1.0, 0.0, 1.0, 0.0, 0.0), &WalkConfig::default()).unwrap();
        assert_eq!(zero.increment_count, 0);

        let floored = SimParams::derive(inputs(0.3, 1.0, 1.0, 0.0, 0.0), &WalkConfig::default()).unwrap();
        assert_eq!(floored.increment_count, 3);
    }

    #[test]
    fn derive_rejects_invalid_inputs() {
        let walk = WalkConfig::default();
        assert!(SimParams::derive(inputs(0.0, 1.0, 1.0, 0.0, 0.0), &walk).is_err());
        assert!(SimParams::derive(inputs(1.0, -1.0, 1.0, 0.0, 0.0), &walk).is_err());
        assert!(SimParams::derive(inputs(1.0, 1.0, -1.0, 0.0, 0.0), &walk).is_err());
        assert!(SimParams::derive(inputs(1.0, 1.0, 1.0, f32::NAN, 0.0), &walk).is_err());
        assert!(SimParams::derive(inputs(1.0, 1.0, 1.0, 0.0, -0.5), &walk).is_err());

        let mut no_particles = inputs(1.0, 1.0, 1.0, 0.0, 0.0);
        no_particles.particle_count = 0;
        assert!(matches!(SimParams::derive(no_particles, &walk), Err(EngineError::Configuration(_))));

        let mut no_workers = inputs(1.0, 1.0, 1.0, 0.0, 0.0);
        no_workers.worker_count = 0;
        assert!(SimParams::derive(no_workers, &walk).is_err());
    }

    #[test]
    fn drift_offset_scales_with_dt() {
        let walk = WalkConfig { variant: WalkVariant::Drift, ..WalkConfig::default() };
        let params = SimParams::derive(inputs(0.5, 1.0, 1.0, 0.4, 0.0), &walk).unwrap();
        assert_eq!(params.variant, WalkVariant::Drift);
        assert!((params.drift_offset - 0.2).abs() < 1e-6);
    }
}
