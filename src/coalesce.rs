//! Coalescence engine: bottom-up reduction of a tree to one summary.
//!
//! Walks the tree post-order, merging sibling subtrees pairwise. Every
//! merge evolves both children's messages across their branches,
//! combines them site-wise, aggregates the log-likelihood term, reports
//! the delta to the inference runtime, and signals a resampling
//! checkpoint. The traversal is purely functional over the tree: inputs
//! are never mutated, only replaced by newly constructed coalesced
//! values.

use nalgebra::RowDVector;
use tracing::warn;

use crate::dynamics::{ModelDynamics, MOLECULAR_STATES};
use crate::error::ModelError;
use crate::evolve::{evolve_branch, BranchMessages};
use crate::likelihood::{log_message_likelihood, log_sequence_likelihood};
use crate::runtime::InferenceRuntime;
use crate::tree::{PhyloTree, TreeKind};

/// Coalesce a tree to a single [`PhyloTree::WeightedLeaf`].
///
/// The returned summary's cumulative log-weight is the particle's total
/// log-likelihood increment; the same total has already been reported to
/// the runtime piecewise, one delta per merge.
///
/// Fatal configuration errors (negative branch lengths, ragged site
/// sequences, wrong message dimensions, unknown observed states) come
/// back as `Err` and should halt the run. A malformed child-shape
/// combination is *not* fatal: it drives the particle's weight to −∞
/// and the traversal continues, so the particle filter can discard the
/// dead particle at the next resampling.
pub fn coalesce<R: InferenceRuntime>(
    tree: &PhyloTree,
    dynamics: &ModelDynamics,
    runtime: &mut R,
) -> Result<PhyloTree, ModelError> {
    match tree {
        PhyloTree::Leaf {
            character,
            sites,
            age,
            ..
        } => {
            // A bare tip has nothing to merge: it coalesces to its
            // initial messages with a zero log-weight.
            let messages = tip_messages(*character, sites, dynamics)?;
            Ok(PhyloTree::weighted_leaf(
                messages.sites,
                messages.character,
                *age,
                0.0,
            ))
        }
        PhyloTree::WeightedLeaf { .. } => Ok(tree.clone()),
        PhyloTree::WeightedNode {
            left,
            right,
            age,
            log_weight,
        } => merge(left, right, *age, *log_weight, dynamics, runtime),
        PhyloTree::Node { left, right, age } => match (left.kind(), right.kind()) {
            (TreeKind::Leaf, TreeKind::Leaf) => {
                let pairing =
                    PhyloTree::weighted_node((**left).clone(), (**right).clone(), *age, 0.0)?;
                coalesce(&pairing, dynamics, runtime)
            }
            (TreeKind::Leaf, TreeKind::Node) => {
                let coalesced = coalesce(right, dynamics, runtime)?;
                let baseline = coalesced.cumulative_log_weight().unwrap_or(0.0);
                let pairing =
                    PhyloTree::weighted_node((**left).clone(), coalesced, *age, baseline)?;
                coalesce(&pairing, dynamics, runtime)
            }
            (TreeKind::Node, TreeKind::Leaf) => {
                let coalesced = coalesce(left, dynamics, runtime)?;
                let baseline = coalesced.cumulative_log_weight().unwrap_or(0.0);
                let pairing =
                    PhyloTree::weighted_node(coalesced, (**right).clone(), *age, baseline)?;
                coalesce(&pairing, dynamics, runtime)
            }
            (TreeKind::Node, TreeKind::Node) => {
                let left_coalesced = coalesce(left, dynamics, runtime)?;
                let right_coalesced = coalesce(right, dynamics, runtime)?;
                let baseline = left_coalesced.cumulative_log_weight().unwrap_or(0.0)
                    + right_coalesced.cumulative_log_weight().unwrap_or(0.0);
                let pairing =
                    PhyloTree::weighted_node(left_coalesced, right_coalesced, *age, baseline)?;
                coalesce(&pairing, dynamics, runtime)
            }
            _ => {
                // Children already in coalesced form under a raw node:
                // not one of the anticipated shapes. Kill the particle,
                // keep the run alive.
                warn!(node = %tree, "unexpected child shapes under node; particle weight set to zero");
                runtime.adjust_weight(f64::NEG_INFINITY);
                runtime.resampling_checkpoint();
                Ok(dead_summary(left, right, *age, dynamics))
            }
        },
    }
}

/// Merge the two children of a pairing node under `age`, with `baseline`
/// the sum of the children's pre-merge cumulative log-weights.
fn merge<R: InferenceRuntime>(
    left: &PhyloTree,
    right: &PhyloTree,
    age: f64,
    baseline: f64,
    dynamics: &ModelDynamics,
    runtime: &mut R,
) -> Result<PhyloTree, ModelError> {
    let (left_messages, right_messages) =
        match (child_messages(left, dynamics)?, child_messages(right, dynamics)?) {
            (Some(l), Some(r)) => (l, r),
            _ => {
                warn!(
                    left = %left,
                    right = %right,
                    "pairing child carries no messages; particle weight set to zero"
                );
                runtime.adjust_weight(f64::NEG_INFINITY);
                runtime.resampling_checkpoint();
                return Ok(dead_summary(left, right, age, dynamics));
            }
        };

    let left_time = branch_length(age, left)?;
    let right_time = branch_length(age, right)?;

    if left_messages.sites.len() != right_messages.sites.len() {
        return Err(ModelError::RaggedSites {
            left: left_messages.sites.len(),
            right: right_messages.sites.len(),
        });
    }

    let left_evolved = evolve_branch(&left_messages, dynamics, left_time, runtime);
    let right_evolved = evolve_branch(&right_messages, dynamics, right_time, runtime);

    let site_messages: Vec<RowDVector<f64>> = left_evolved
        .sites
        .iter()
        .zip(right_evolved.sites.iter())
        .map(|(l, r)| l.component_mul(r))
        .collect();
    let character_message = left_evolved
        .character
        .component_mul(&right_evolved.character);

    let log_likelihood = log_sequence_likelihood(&site_messages)
        + log_message_likelihood(&character_message);

    let log_weight = baseline + log_likelihood;
    runtime.adjust_weight(log_likelihood);
    runtime.resampling_checkpoint();

    Ok(PhyloTree::weighted_leaf(
        site_messages,
        character_message,
        age,
        log_weight,
    ))
}

/// Initial messages for an observed tip: per-site basis vectors and the
/// emission-table row for the observed character state.
fn tip_messages(
    character: usize,
    sites: &[usize],
    dynamics: &ModelDynamics,
) -> Result<BranchMessages, ModelError> {
    let site_messages = sites
        .iter()
        .map(|&state| dynamics.molecular_emission(state))
        .collect::<Result<Vec<_>, _>>()?;
    let character_message = dynamics.character_emission(character)?;
    Ok(BranchMessages {
        sites: site_messages,
        character: character_message,
    })
}

/// Messages carried by a merge child, or `None` if the child is not in
/// a mergeable shape.
fn child_messages(
    child: &PhyloTree,
    dynamics: &ModelDynamics,
) -> Result<Option<BranchMessages>, ModelError> {
    match child {
        PhyloTree::Leaf {
            character, sites, ..
        } => tip_messages(*character, sites, dynamics).map(Some),
        PhyloTree::WeightedLeaf {
            site_messages,
            character_message,
            ..
        } => {
            for message in site_messages {
                if message.ncols() != MOLECULAR_STATES {
                    return Err(ModelError::DimensionMismatch {
                        what: "site message",
                        got: message.ncols(),
                        expected: MOLECULAR_STATES,
                    });
                }
            }
            if character_message.ncols() != dynamics.n_character_states() {
                return Err(ModelError::DimensionMismatch {
                    what: "character message",
                    got: character_message.ncols(),
                    expected: dynamics.n_character_states(),
                });
            }
            Ok(Some(BranchMessages {
                sites: site_messages.clone(),
                character: character_message.clone(),
            }))
        }
        _ => Ok(None),
    }
}

fn branch_length(parent_age: f64, child: &PhyloTree) -> Result<f64, ModelError> {
    let length = parent_age - child.age();
    if length < 0.0 {
        return Err(ModelError::NegativeBranchLength {
            parent_age,
            child_age: child.age(),
            length,
            child: child.to_string(),
        });
    }
    Ok(length)
}

/// Degenerate coalesced value for a killed particle: zero messages
/// shaped like the children's, so later merges stay well-formed, and a
/// −∞ cumulative log-weight.
fn dead_summary(
    left: &PhyloTree,
    right: &PhyloTree,
    age: f64,
    dynamics: &ModelDynamics,
) -> PhyloTree {
    let n_sites = left.n_sites().or_else(|| right.n_sites()).unwrap_or(0);
    let site_messages = vec![RowDVector::zeros(MOLECULAR_STATES); n_sites];
    let character_message = RowDVector::zeros(dynamics.n_character_states());
    PhyloTree::weighted_leaf(site_messages, character_message, age, f64::NEG_INFINITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::{uniform_generator, uniform_jump};
    use crate::runtime::ParticleRuntime;
    use nalgebra::DMatrix;

    /// Dynamics with zero generators and no compound jumps: evolution is
    /// the identity, so merge outcomes are exact.
    fn frozen_dynamics() -> ModelDynamics {
        ModelDynamics::new(
            DMatrix::zeros(MOLECULAR_STATES, MOLECULAR_STATES),
            uniform_jump(MOLECULAR_STATES),
            DMatrix::zeros(2, 2),
            uniform_jump(2),
            0.0,
            DMatrix::identity(2, 2),
        )
        .unwrap()
    }

    /// Dynamics with active generators but no compound jumps, so the
    /// traversal stays deterministic.
    fn diffusive_dynamics() -> ModelDynamics {
        ModelDynamics::new(
            uniform_generator(MOLECULAR_STATES),
            uniform_jump(MOLECULAR_STATES),
            uniform_generator(2),
            uniform_jump(2),
            0.0,
            DMatrix::identity(2, 2),
        )
        .unwrap()
    }

    fn two_leaf_tree(left_site: usize, right_site: usize) -> PhyloTree {
        PhyloTree::node(
            PhyloTree::leaf(0, 0, vec![left_site], 0.0),
            PhyloTree::leaf(1, 0, vec![right_site], 0.0),
            1.0,
        )
        .unwrap()
    }

    #[test]
    fn test_matching_tips_give_zero_weight() {
        // Both tips in molecular state 0 under frozen dynamics: merged
        // message is the basis vector, every contribution is log(1).
        let dynamics = frozen_dynamics();
        let mut runtime = ParticleRuntime::seeded(1);
        let root = coalesce(&two_leaf_tree(0, 0), &dynamics, &mut runtime).unwrap();

        assert_eq!(root.kind(), TreeKind::WeightedLeaf);
        assert_eq!(root.cumulative_log_weight(), Some(0.0));
        assert_eq!(
            root.site_messages().unwrap()[0],
            RowDVector::from_vec(vec![1.0, 0.0, 0.0, 0.0])
        );
        assert_eq!(runtime.log_weight(), 0.0);
        assert_eq!(runtime.trace(), &[0.0]);
    }

    #[test]
    fn test_conflicting_tips_kill_particle() {
        // States 0 vs 1 with no evolution: the merged message is all
        // zeros and the particle's weight collapses, without an error.
        let dynamics = frozen_dynamics();
        let mut runtime = ParticleRuntime::seeded(1);
        let root = coalesce(&two_leaf_tree(0, 1), &dynamics, &mut runtime).unwrap();

        assert_eq!(root.cumulative_log_weight(), Some(f64::NEG_INFINITY));
        assert_eq!(runtime.log_weight(), f64::NEG_INFINITY);
        assert_eq!(root.site_messages().unwrap()[0], RowDVector::zeros(4));
    }

    #[test]
    fn test_root_weight_composes_additively() {
        // Four tips merged as ((0,1),(2,3)): the root weight must equal
        // the two pair contributions plus the final merge's own term.
        let dynamics = diffusive_dynamics();
        let pair_a = PhyloTree::node(
            PhyloTree::leaf(0, 0, vec![0, 2], 0.0),
            PhyloTree::leaf(1, 0, vec![0, 3], 0.0),
            1.0,
        )
        .unwrap();
        let pair_b = PhyloTree::node(
            PhyloTree::leaf(2, 1, vec![1, 2], 0.0),
            PhyloTree::leaf(3, 1, vec![0, 2], 0.0),
            1.0,
        )
        .unwrap();
        let tree = PhyloTree::node(pair_a.clone(), pair_b.clone(), 2.0).unwrap();

        let mut runtime = ParticleRuntime::seeded(1);
        let root = coalesce(&tree, &dynamics, &mut runtime).unwrap();
        let root_weight = root.cumulative_log_weight().unwrap();

        assert_eq!(runtime.trace().len(), 3);
        let delta_sum: f64 = runtime.trace().iter().sum();
        assert!((root_weight - delta_sum).abs() < 1e-12);

        // Each pair coalesced on its own reproduces its delta.
        let mut runtime_a = ParticleRuntime::seeded(1);
        let summary_a = coalesce(&pair_a, &dynamics, &mut runtime_a).unwrap();
        assert!(
            (summary_a.cumulative_log_weight().unwrap() - runtime.trace()[0]).abs() < 1e-12
        );

        let mut runtime_b = ParticleRuntime::seeded(1);
        let summary_b = coalesce(&pair_b, &dynamics, &mut runtime_b).unwrap();
        assert!(
            (summary_b.cumulative_log_weight().unwrap() - runtime.trace()[1]).abs() < 1e-12
        );
    }

    #[test]
    fn test_merge_is_commutative_in_children() {
        let dynamics = diffusive_dynamics();
        let left = PhyloTree::leaf(0, 0, vec![0, 1, 3], 0.0);
        let right = PhyloTree::leaf(1, 1, vec![2, 1, 3], 0.25);

        let tree_ab = PhyloTree::node(left.clone(), right.clone(), 1.0).unwrap();
        let tree_ba = PhyloTree::node(right, left, 1.0).unwrap();

        let mut runtime_ab = ParticleRuntime::seeded(1);
        let root_ab = coalesce(&tree_ab, &dynamics, &mut runtime_ab).unwrap();
        let mut runtime_ba = ParticleRuntime::seeded(1);
        let root_ba = coalesce(&tree_ba, &dynamics, &mut runtime_ba).unwrap();

        let weight_ab = root_ab.cumulative_log_weight().unwrap();
        let weight_ba = root_ba.cumulative_log_weight().unwrap();
        assert!((weight_ab - weight_ba).abs() < 1e-12);

        let sites_ab = root_ab.site_messages().unwrap();
        let sites_ba = root_ba.site_messages().unwrap();
        for (a, b) in sites_ab.iter().zip(sites_ba.iter()) {
            for state in 0..MOLECULAR_STATES {
                assert!((a[state] - b[state]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_root_summary_keeps_site_count() {
        let dynamics = diffusive_dynamics();
        let tree = PhyloTree::node(
            PhyloTree::node(
                PhyloTree::leaf(0, 0, vec![0, 1, 2, 3, 0], 0.0),
                PhyloTree::leaf(1, 0, vec![0, 1, 2, 3, 1], 0.0),
                0.5,
            )
            .unwrap(),
            PhyloTree::leaf(2, 1, vec![3, 1, 2, 3, 0], 0.0),
            1.5,
        )
        .unwrap();

        let mut runtime = ParticleRuntime::seeded(2);
        let root = coalesce(&tree, &dynamics, &mut runtime).unwrap();
        assert_eq!(root.n_sites(), Some(5));
        assert_eq!(runtime.trace().len(), 2);
    }

    #[test]
    fn test_malformed_child_shape_is_non_fatal() {
        let dynamics = frozen_dynamics();
        // A coalesced summary where only raw shapes are anticipated.
        let premature = PhyloTree::weighted_leaf(
            vec![RowDVector::from_vec(vec![1.0, 0.0, 0.0, 0.0])],
            RowDVector::from_vec(vec![1.0, 0.0]),
            0.0,
            -1.0,
        );
        let tree = PhyloTree::node(premature, PhyloTree::leaf(0, 0, vec![0], 0.0), 1.0).unwrap();

        let mut runtime = ParticleRuntime::seeded(1);
        let root = coalesce(&tree, &dynamics, &mut runtime).unwrap();

        assert_eq!(root.kind(), TreeKind::WeightedLeaf);
        assert_eq!(root.cumulative_log_weight(), Some(f64::NEG_INFINITY));
        assert_eq!(runtime.log_weight(), f64::NEG_INFINITY);
        // The dead particle still emitted its checkpoint.
        assert_eq!(runtime.trace().len(), 1);
        assert_eq!(root.n_sites(), Some(1));
    }

    #[test]
    fn test_negative_branch_length_is_fatal() {
        let dynamics = frozen_dynamics();
        // Bypass the constructor to simulate a corrupted setup.
        let pairing = PhyloTree::WeightedNode {
            left: Box::new(PhyloTree::leaf(0, 0, vec![0], 2.0)),
            right: Box::new(PhyloTree::leaf(1, 0, vec![0], 0.0)),
            age: 1.0,
            log_weight: 0.0,
        };

        let mut runtime = ParticleRuntime::seeded(1);
        let err = coalesce(&pairing, &dynamics, &mut runtime).unwrap_err();
        assert!(matches!(err, ModelError::NegativeBranchLength { .. }));
    }

    #[test]
    fn test_ragged_sites_are_fatal() {
        let dynamics = frozen_dynamics();
        let tree = PhyloTree::node(
            PhyloTree::leaf(0, 0, vec![0, 1], 0.0),
            PhyloTree::leaf(1, 0, vec![0], 0.0),
            1.0,
        )
        .unwrap();

        let mut runtime = ParticleRuntime::seeded(1);
        let err = coalesce(&tree, &dynamics, &mut runtime).unwrap_err();
        assert!(matches!(err, ModelError::RaggedSites { left: 2, right: 1 }));
    }

    #[test]
    fn test_wrong_message_dimension_is_fatal() {
        let dynamics = frozen_dynamics();
        let narrow = PhyloTree::weighted_leaf(
            vec![RowDVector::from_vec(vec![1.0, 0.0, 0.0])],
            RowDVector::from_vec(vec![1.0, 0.0]),
            0.0,
            0.0,
        );
        let pairing = PhyloTree::weighted_node(
            narrow,
            PhyloTree::leaf(0, 0, vec![0], 0.0),
            1.0,
            0.0,
        )
        .unwrap();

        let mut runtime = ParticleRuntime::seeded(1);
        let err = coalesce(&pairing, &dynamics, &mut runtime).unwrap_err();
        assert!(matches!(
            err,
            ModelError::DimensionMismatch { what: "site message", got: 3, expected: 4 }
        ));
    }

    #[test]
    fn test_single_leaf_coalesces_to_its_emissions() {
        let dynamics = frozen_dynamics();
        let leaf = PhyloTree::leaf(7, 1, vec![2, 0], 0.0);

        let mut runtime = ParticleRuntime::seeded(1);
        let summary = coalesce(&leaf, &dynamics, &mut runtime).unwrap();

        assert_eq!(summary.kind(), TreeKind::WeightedLeaf);
        assert_eq!(summary.cumulative_log_weight(), Some(0.0));
        assert_eq!(
            summary.site_messages().unwrap()[0],
            RowDVector::from_vec(vec![0.0, 0.0, 1.0, 0.0])
        );
        assert_eq!(
            summary.character_message().unwrap(),
            &RowDVector::from_vec(vec![0.0, 1.0])
        );
        // No merge happened, so no checkpoint was emitted.
        assert!(runtime.trace().is_empty());
    }
}
