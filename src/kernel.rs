use walk_common::{SimParams, WalkVariant};

use crate::particles::{Lane, Particle};
use crate::rng::Uniform01;

/// Constants the per-particle transition reads. Copied out of [`SimParams`] once per run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelParams {
    pub variant: WalkVariant,
    pub jump_prob: f32,
    /// Already clamped to [0, 1].
    pub move_prob: f32,
    pub move_distance: f32,
    pub drift_offset: f32,
}

impl From<&SimParams> for KernelParams {
    fn from(params: &SimParams) -> Self {
        KernelParams {
            variant: params.variant,
            jump_prob: params.jump_prob,
            move_prob: params.move_prob,
            move_distance: params.move_distance,
            drift_offset: params.drift_offset,
        }
    }
}

/// What one increment did to a particle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Lane flipped, position untouched.
    Jump,
    Move,
}

/// Advances one particle by one increment. Allocation-free and never blocks.
#[inline]
pub fn apply<U: Uniform01 + ?Sized>(particle: &mut Particle, k: &KernelParams, rng: &mut U) -> Transition {
    if rng.uniform01() < k.jump_prob {
        particle.lane = particle.lane.flipped();
        return Transition::Jump;
    }

    let r = rng.uniform01();
    match k.variant {
        WalkVariant::SymmetricBias => {
            // The lower lane favours the opposite direction.
            let p_eff = match particle.lane {
                Lane::Upper => k.move_prob,
                Lane::Lower => 1.0 - k.move_prob,
            };
            if r < p_eff {
                particle.x += k.move_distance;
            } else {
                particle.x -= k.move_distance;
            }
        }
        WalkVariant::Drift => {
            let step = if r < 0.5 { k.move_distance } else { -k.move_distance };
            let drift = match particle.lane {
                Lane::Upper => k.drift_offset,
                Lane::Lower => -k.drift_offset,
            };
            particle.x += step + drift;
        }
    }
    Transition::Move
}

/// Advances a contiguous run of particles with one worker's stream. Returns the jump count.
pub fn apply_chunk<U: Uniform01 + ?Sized>(particles: &mut [Particle], k: &KernelParams, rng: &mut U) -> u64 {
    particles
        .iter_mut()
        .map(|p| (apply(p, k, rng) == Transition::Jump) as u64)
        .sum()
}
