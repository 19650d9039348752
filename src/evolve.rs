//! Branch evolution of likelihood messages.
//!
//! Advances a message across a time interval by combining a
//! matrix-exponential diffusion term with a compound Poisson jump
//! process: the message is right-multiplied by the jump kernel raised to
//! the drawn jump count, then by `exp(generator * time)`. The jump
//! operator is applied before the diffusion operator; the order is part
//! of the model.

use nalgebra::{DMatrix, RowDVector};

use crate::dynamics::ModelDynamics;
use crate::runtime::InferenceRuntime;

/// The messages carried by one child into a merge: one row vector per
/// molecular site plus the single character message.
#[derive(Clone, Debug)]
pub struct BranchMessages {
    pub sites: Vec<RowDVector<f64>>,
    pub character: RowDVector<f64>,
}

/// Diffusion operator for one branch: `exp(generator * time)`.
///
/// At `time == 0` this is the identity to numerical precision; no
/// special case is needed or wanted.
pub fn transition_operator(generator: &DMatrix<f64>, time: f64) -> DMatrix<f64> {
    (generator * time).exp()
}

/// Apply `count` discrete jump events: `message * jump^count`.
pub fn apply_jumps(
    message: &RowDVector<f64>,
    jump: &DMatrix<f64>,
    count: u64,
) -> RowDVector<f64> {
    let mut evolved = message.clone();
    for _ in 0..count {
        evolved = &evolved * jump;
    }
    evolved
}

/// Advance one message across a branch:
/// `message * jump^count * exp(generator * time)`.
pub fn evolve_message(
    message: &RowDVector<f64>,
    generator: &DMatrix<f64>,
    jump: &DMatrix<f64>,
    count: u64,
    time: f64,
) -> RowDVector<f64> {
    let jumped = apply_jumps(message, jump, count);
    &jumped * transition_operator(generator, time)
}

/// Evolve a child's full message bundle across one branch.
///
/// Per-site jump counts are drawn independently from a Poisson whose
/// rate is the joint compound rate times the branch length, normalized
/// by the number of sites so the expected total jump count across the
/// branch equals `compound_rate * time`. The character message reuses
/// the total of the per-site draws as its own jump count (shared jump
/// history between the molecular and character processes), advanced
/// under the character-process generator and jump kernel.
pub fn evolve_branch<R: InferenceRuntime>(
    messages: &BranchMessages,
    dynamics: &ModelDynamics,
    time: f64,
    runtime: &mut R,
) -> BranchMessages {
    let n_sites = messages.sites.len();
    let site_rate = if n_sites == 0 {
        0.0
    } else {
        dynamics.compound_rate() * time / n_sites as f64
    };

    let counts: Vec<u64> = (0..n_sites)
        .map(|_| runtime.sample_poisson(site_rate))
        .collect();
    let total_jumps: u64 = counts.iter().sum();

    let molecular_transition = transition_operator(dynamics.molecular_generator(), time);
    let sites: Vec<RowDVector<f64>> = messages
        .sites
        .iter()
        .zip(counts.iter())
        .map(|(message, &count)| {
            let jumped = apply_jumps(message, dynamics.molecular_jump(), count);
            &jumped * &molecular_transition
        })
        .collect();

    let character = evolve_message(
        &messages.character,
        dynamics.character_generator(),
        dynamics.character_jump(),
        total_jumps,
        time,
    );

    BranchMessages { sites, character }
}
