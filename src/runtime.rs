//! Boundary with the probabilistic-inference runtime.
//!
//! The coalescence engine never samples or accumulates weight on its
//! own: every random draw, every weight adjustment, and every resampling
//! signal goes through [`InferenceRuntime`]. This keeps the ambient
//! "weight/resample" effect of the model explicit and threaded through
//! each call, and lets an external particle-filter driver observe the
//! synchronization points.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Gamma, Poisson};

/// Operations the core invokes on the external inference runtime.
pub trait InferenceRuntime {
    /// Draw a rate parameter from a Gamma(shape, rate) prior.
    fn sample_gamma(&mut self, shape: f64, rate: f64) -> f64;

    /// Draw a compound jump count from a Poisson distribution.
    ///
    /// A rate of zero (or below) must always yield zero jumps.
    fn sample_poisson(&mut self, rate: f64) -> u64;

    /// Multiply the particle's running importance weight by
    /// `exp(log_delta)`. Called once per branch-merge event.
    fn adjust_weight(&mut self, log_delta: f64);

    /// Signal that all particles should reach a barrier and may be
    /// redistributed by weight. Called once per branch-merge event,
    /// immediately after [`adjust_weight`].
    ///
    /// [`adjust_weight`]: InferenceRuntime::adjust_weight
    fn resampling_checkpoint(&mut self);
}

/// Reference runtime for a single particle.
///
/// Backed by a seeded [`StdRng`], it accumulates the cumulative
/// log-weight and records the log-weight delta of every checkpoint
/// interval. The recorded trace is what the SMC driver aligns across
/// particles to honor the per-merge barrier: all particles traverse the
/// same topology, so traces have identical length and position `k`
/// corresponds to the same merge in every particle.
#[derive(Clone, Debug)]
pub struct ParticleRuntime {
    rng: StdRng,
    log_weight: f64,
    pending: f64,
    trace: Vec<f64>,
}

impl ParticleRuntime {
    /// Create a runtime with a deterministic RNG stream.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            log_weight: 0.0,
            pending: 0.0,
            trace: Vec::new(),
        }
    }

    /// Cumulative log-weight across all adjustments so far.
    pub fn log_weight(&self) -> f64 {
        self.log_weight
    }

    /// Per-checkpoint log-weight deltas recorded so far.
    pub fn trace(&self) -> &[f64] {
        &self.trace
    }

    /// Consume the runtime, returning its recorded trace.
    pub fn into_trace(self) -> Vec<f64> {
        self.trace
    }
}

impl InferenceRuntime for ParticleRuntime {
    fn sample_gamma(&mut self, shape: f64, rate: f64) -> f64 {
        // rand_distr parameterizes Gamma by shape and scale.
        match Gamma::new(shape, 1.0 / rate) {
            Ok(gamma) => gamma.sample(&mut self.rng),
            Err(_) => 0.0,
        }
    }

    fn sample_poisson(&mut self, rate: f64) -> u64 {
        if rate <= 0.0 {
            return 0;
        }
        match Poisson::new(rate) {
            Ok(poisson) => {
                let draw: f64 = poisson.sample(&mut self.rng);
                draw as u64
            }
            Err(_) => 0,
        }
    }

    fn adjust_weight(&mut self, log_delta: f64) {
        self.log_weight += log_delta;
        self.pending += log_delta;
    }

    fn resampling_checkpoint(&mut self) {
        self.trace.push(self.pending);
        self.pending = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_poisson_rate_yields_zero() {
        let mut runtime = ParticleRuntime::seeded(7);
        assert_eq!(runtime.sample_poisson(0.0), 0);
        assert_eq!(runtime.sample_poisson(-1.0), 0);
    }

    #[test]
    fn test_poisson_draws_are_deterministic_per_seed() {
        let mut a = ParticleRuntime::seeded(11);
        let mut b = ParticleRuntime::seeded(11);
        let draws_a: Vec<u64> = (0..10).map(|_| a.sample_poisson(2.5)).collect();
        let draws_b: Vec<u64> = (0..10).map(|_| b.sample_poisson(2.5)).collect();
        assert_eq!(draws_a, draws_b);
    }

    #[test]
    fn test_weight_accumulation_and_trace() {
        let mut runtime = ParticleRuntime::seeded(0);
        runtime.adjust_weight(-1.5);
        runtime.resampling_checkpoint();
        runtime.adjust_weight(-0.5);
        runtime.adjust_weight(-0.25);
        runtime.resampling_checkpoint();

        assert!((runtime.log_weight() + 2.25).abs() < 1e-12);
        assert_eq!(runtime.trace(), &[-1.5, -0.75]);
    }

    #[test]
    fn test_infinite_delta_kills_weight() {
        let mut runtime = ParticleRuntime::seeded(0);
        runtime.adjust_weight(f64::NEG_INFINITY);
        runtime.resampling_checkpoint();
        runtime.adjust_weight(-1.0);
        runtime.resampling_checkpoint();

        assert!(runtime.log_weight().is_infinite());
        assert_eq!(runtime.trace()[0], f64::NEG_INFINITY);
    }

    #[test]
    fn test_gamma_draws_positive() {
        let mut runtime = ParticleRuntime::seeded(3);
        for _ in 0..20 {
            let draw = runtime.sample_gamma(2.0, 1.5);
            assert!(draw > 0.0);
        }
    }
}
