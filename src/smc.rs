//! Sequential-Monte-Carlo driver over independent particles.
//!
//! Each particle samples its own [`ModelDynamics`] from the prior and
//! coalesces a private copy of the tree, recording one log-weight delta
//! per resampling checkpoint. Because a particle's trajectory depends
//! only on its own RNG stream, the per-merge barrier of the model is
//! honored by aligning the recorded traces checkpoint-by-checkpoint
//! after the parallel phase: at each checkpoint the driver normalizes
//! the weights, computes the effective sample size, and resamples
//! ancestries when the ESS falls below the configured fraction of the
//! particle count.
//!
//! [`ModelDynamics`]: crate::dynamics::ModelDynamics

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

use crate::coalesce::coalesce;
use crate::dynamics::DynamicsPrior;
use crate::error::ModelError;
use crate::runtime::ParticleRuntime;
use crate::tree::PhyloTree;

/// Configuration for one SMC run.
#[derive(Clone, Debug)]
pub struct SmcConfig {
    /// Number of independent particles.
    pub n_particles: usize,
    /// Base RNG seed; particle `i` uses `seed + i`.
    pub seed: u64,
    /// Resample when ESS drops below this fraction of the particle count.
    pub ess_threshold: f64,
}

impl Default for SmcConfig {
    fn default() -> Self {
        Self {
            n_particles: 256,
            seed: 42,
            ess_threshold: 0.5,
        }
    }
}

/// Outcome of one SMC run.
#[derive(Clone, Debug)]
pub struct SmcResult {
    /// Log marginal-likelihood estimate accumulated across resampling
    /// intervals.
    pub log_marginal: f64,
    /// Final normalized particle weights.
    pub weights: Vec<f64>,
    /// Effective sample size observed at each checkpoint.
    pub ess_history: Vec<f64>,
    /// Number of checkpoints at which resampling triggered.
    pub n_resamples: usize,
}

/// Run the particle filter over `tree`.
///
/// Particles execute in parallel; a fatal [`ModelError`] from any
/// particle aborts the whole run. A particle whose weight collapses to
/// −∞ is not an error: it runs to completion and is culled by
/// resampling.
pub fn run_smc(
    tree: &PhyloTree,
    prior: &DynamicsPrior,
    config: &SmcConfig,
) -> Result<SmcResult, ModelError> {
    let traces: Vec<Vec<f64>> = (0..config.n_particles)
        .into_par_iter()
        .map(|i| -> Result<Vec<f64>, ModelError> {
            let mut runtime = ParticleRuntime::seeded(config.seed.wrapping_add(i as u64));
            let dynamics = prior.sample(&mut runtime)?;
            coalesce(tree, &dynamics, &mut runtime)?;
            Ok(runtime.into_trace())
        })
        .collect::<Result<_, _>>()?;

    let n = traces.len();
    let n_checkpoints = traces.first().map(|t| t.len()).unwrap_or(0);
    // All particles traverse the same topology, so every trace has one
    // delta per merge.
    debug_assert!(traces.iter().all(|t| t.len() == n_checkpoints));

    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_mul(0x9e3779b97f4a7c15));
    let mut ancestors: Vec<usize> = (0..n).collect();
    let mut log_weights = vec![0.0_f64; n];
    let mut log_marginal = 0.0;
    let mut ess_history = Vec::with_capacity(n_checkpoints);
    let mut n_resamples = 0;

    for step in 0..n_checkpoints {
        for (slot, weight) in log_weights.iter_mut().enumerate() {
            *weight += traces[ancestors[slot]][step];
        }

        let (weights, ess, log_sum) = normalize_log_weights(&log_weights);
        ess_history.push(ess);

        let resample = ess < config.ess_threshold * n as f64;
        debug!(step, ess, resample, "resampling checkpoint");
        if resample {
            log_marginal += log_sum - (n as f64).ln();
            ancestors = multinomial_resample(&weights, &ancestors, &mut rng);
            log_weights.iter_mut().for_each(|w| *w = 0.0);
            n_resamples += 1;
        }
    }

    let (weights, _ess, log_sum) = normalize_log_weights(&log_weights);
    log_marginal += log_sum - (n as f64).ln();

    Ok(SmcResult {
        log_marginal,
        weights,
        ess_history,
        n_resamples,
    })
}

/// Normalize log-weights via log-sum-exp.
///
/// Returns (normalized weights, ESS = 1/Σw², log of the unnormalized
/// weight sum). When every particle is dead the weights fall back to
/// uniform so resampling stays well defined.
fn normalize_log_weights(log_weights: &[f64]) -> (Vec<f64>, f64, f64) {
    let n = log_weights.len();
    if n == 0 {
        return (vec![], 0.0, f64::NEG_INFINITY);
    }

    let max_log_w = log_weights.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_log_w.is_infinite() {
        return (vec![1.0 / n as f64; n], n as f64, f64::NEG_INFINITY);
    }

    let sum_exp: f64 = log_weights.iter().map(|&lw| (lw - max_log_w).exp()).sum();
    let log_sum = max_log_w + sum_exp.ln();

    let weights: Vec<f64> = log_weights.iter().map(|&lw| (lw - log_sum).exp()).collect();

    let sum_sq: f64 = weights.iter().map(|&w| w * w).sum();
    let ess = if sum_sq > 0.0 { 1.0 / sum_sq } else { 0.0 };

    (weights, ess, log_sum)
}

/// Draw a fresh ancestry by sampling slots in proportion to weight.
fn multinomial_resample(weights: &[f64], ancestors: &[usize], rng: &mut StdRng) -> Vec<usize> {
    let n = weights.len();
    (0..n)
        .map(|_| {
            let u: f64 = rng.gen();
            let mut cumulative = 0.0;
            let mut chosen = n - 1;
            for (slot, &weight) in weights.iter().enumerate() {
                cumulative += weight;
                if u <= cumulative {
                    chosen = slot;
                    break;
                }
            }
            ancestors[chosen]
        })
        .collect()
}
