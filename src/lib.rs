//! Likelihood-weighted coalescence of phylogenetic trees for sequential
//! Monte Carlo inference.
//!
//! Each particle in the outer importance-sampling loop executes the same
//! recursive computation over the same binary tree: sibling subtrees are
//! merged bottom-up, every branch advances its likelihood messages under
//! a joint phenotype/genotype model (matrix-exponential diffusion plus a
//! compound Poisson jump process), and every merge contributes a
//! log-weight delta that the external resampling step consumes.
//!
//! The pieces, leaf-first:
//! - [`tree`]: the four-shape tree representation tracking which
//!   subtrees are raw tips and which are coalesced summaries.
//! - [`dynamics`]: the immutable per-particle parameter bundle and the
//!   Gamma hyperprior it is sampled from.
//! - [`evolve`]: per-branch message evolution.
//! - [`likelihood`]: message-to-scalar log-likelihood aggregation.
//! - [`coalesce`]: the recursive merge driving the other three.
//! - [`runtime`]: the explicit boundary with the inference runtime
//!   (sampling, weight adjustment, resampling checkpoints).
//! - [`smc`]: a reference particle-filter driver built on that boundary.
//!
//! Within one particle the traversal is single-threaded and purely
//! functional over the tree; concurrency lives across particles in the
//! driver. A particle whose weight collapses to −∞ keeps running and is
//! culled by resampling; only setup-time invariant violations abort a
//! run, as [`error::ModelError`].

pub mod coalesce;
pub mod dynamics;
pub mod error;
pub mod evolve;
pub mod likelihood;
pub mod runtime;
pub mod smc;
pub mod tree;

pub use coalesce::coalesce;
pub use dynamics::{
    uniform_generator, uniform_jump, DynamicsPrior, GammaPrior, ModelDynamics, MOLECULAR_STATES,
};
pub use error::ModelError;
pub use evolve::{evolve_message, BranchMessages};
pub use likelihood::{log_message_likelihood, log_sequence_likelihood};
pub use runtime::{InferenceRuntime, ParticleRuntime};
pub use smc::{run_smc, SmcConfig, SmcResult};
pub use tree::{PhyloTree, TreeKind};
