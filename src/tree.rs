//! Tree structure for coalescent likelihood computation.
//!
//! Represents a rooted binary phylogenetic tree annotated with node ages
//! (time before present; the root is oldest, tips youngest). Four node
//! shapes track the progressive replacement of raw subtrees by coalesced
//! likelihood summaries as the engine walks upward.

use nalgebra::RowDVector;

use crate::error::ModelError;

/// Classification of a tree value's shape.
///
/// This is the only variant discriminator besides pattern matching on
/// [`PhyloTree`] itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeKind {
    Leaf,
    Node,
    WeightedLeaf,
    WeightedNode,
}

/// A binary phylogenetic tree in one of four mutually exclusive shapes.
///
/// `Leaf` and `Node` form the raw input tree; `WeightedLeaf` and
/// `WeightedNode` are produced by the coalescence engine. Values are
/// never mutated in place: each traversal step constructs new values
/// (replace, never mutate), so the whole type is freely shareable by
/// reference within one particle.
#[derive(Clone, Debug, PartialEq)]
pub enum PhyloTree {
    /// An observed tip. Immutable once constructed.
    Leaf {
        /// External identity of the tip.
        index: usize,
        /// Observed discrete character state (integer category).
        character: usize,
        /// Observed molecular state per site.
        sites: Vec<usize>,
        /// Age of the tip (time before present).
        age: f64,
    },
    /// An internal branching point not yet processed.
    Node {
        left: Box<PhyloTree>,
        right: Box<PhyloTree>,
        age: f64,
    },
    /// The result of coalescing a subtree: a synthetic tip carrying
    /// evolved likelihood messages and the cumulative log-weight of
    /// everything merged beneath it.
    WeightedLeaf {
        /// One row vector of molecular-state likelihoods per site.
        site_messages: Vec<RowDVector<f64>>,
        /// Row vector of character-state likelihoods.
        character_message: RowDVector<f64>,
        age: f64,
        log_weight: f64,
    },
    /// An internal node whose children have already been replaced by
    /// coalesced summaries (or are raw tips about to be merged); carries
    /// the pre-merge cumulative log-weight of its subtree.
    WeightedNode {
        left: Box<PhyloTree>,
        right: Box<PhyloTree>,
        age: f64,
        log_weight: f64,
    },
}

impl PhyloTree {
    /// Create an observed tip.
    pub fn leaf(index: usize, character: usize, sites: Vec<usize>, age: f64) -> Self {
        PhyloTree::Leaf {
            index,
            character,
            sites,
            age,
        }
    }

    /// Create an unprocessed internal node.
    ///
    /// Validates that the node is strictly older than both children
    /// (branch lengths are positive).
    pub fn node(left: PhyloTree, right: PhyloTree, age: f64) -> Result<Self, ModelError> {
        Self::check_age_order(age, &left)?;
        Self::check_age_order(age, &right)?;
        Ok(PhyloTree::Node {
            left: Box::new(left),
            right: Box::new(right),
            age,
        })
    }

    /// Create a coalesced summary tip from its message vectors.
    pub fn weighted_leaf(
        site_messages: Vec<RowDVector<f64>>,
        character_message: RowDVector<f64>,
        age: f64,
        log_weight: f64,
    ) -> Self {
        PhyloTree::WeightedLeaf {
            site_messages,
            character_message,
            age,
            log_weight,
        }
    }

    /// Create a pairing node over two already-summarized (or raw tip)
    /// children, carrying the pre-merge cumulative log-weight.
    ///
    /// Validates the same age ordering as [`PhyloTree::node`].
    pub fn weighted_node(
        left: PhyloTree,
        right: PhyloTree,
        age: f64,
        log_weight: f64,
    ) -> Result<Self, ModelError> {
        Self::check_age_order(age, &left)?;
        Self::check_age_order(age, &right)?;
        Ok(PhyloTree::WeightedNode {
            left: Box::new(left),
            right: Box::new(right),
            age,
            log_weight,
        })
    }

    fn check_age_order(age: f64, child: &PhyloTree) -> Result<(), ModelError> {
        if age <= child.age() {
            return Err(ModelError::AgeOrderViolation {
                age,
                child_age: child.age(),
                child: child.to_string(),
            });
        }
        Ok(())
    }

    /// Which of the four shapes this value holds.
    pub fn kind(&self) -> TreeKind {
        match self {
            PhyloTree::Leaf { .. } => TreeKind::Leaf,
            PhyloTree::Node { .. } => TreeKind::Node,
            PhyloTree::WeightedLeaf { .. } => TreeKind::WeightedLeaf,
            PhyloTree::WeightedNode { .. } => TreeKind::WeightedNode,
        }
    }

    /// Age of this node (time before present).
    pub fn age(&self) -> f64 {
        match self {
            PhyloTree::Leaf { age, .. }
            | PhyloTree::Node { age, .. }
            | PhyloTree::WeightedLeaf { age, .. }
            | PhyloTree::WeightedNode { age, .. } => *age,
        }
    }

    /// Number of molecular sites carried by this value, if it is a tip
    /// or a coalesced summary.
    pub fn n_sites(&self) -> Option<usize> {
        match self {
            PhyloTree::Leaf { sites, .. } => Some(sites.len()),
            PhyloTree::WeightedLeaf { site_messages, .. } => Some(site_messages.len()),
            _ => None,
        }
    }

    /// Stored per-site messages of a coalesced summary.
    pub fn site_messages(&self) -> Option<&[RowDVector<f64>]> {
        match self {
            PhyloTree::WeightedLeaf { site_messages, .. } => Some(site_messages),
            _ => None,
        }
    }

    /// Stored character message of a coalesced summary.
    pub fn character_message(&self) -> Option<&RowDVector<f64>> {
        match self {
            PhyloTree::WeightedLeaf {
                character_message, ..
            } => Some(character_message),
            _ => None,
        }
    }

    /// Cumulative log-weight carried by a coalesced value.
    pub fn cumulative_log_weight(&self) -> Option<f64> {
        match self {
            PhyloTree::WeightedLeaf { log_weight, .. }
            | PhyloTree::WeightedNode { log_weight, .. } => Some(*log_weight),
            _ => None,
        }
    }
}

/// Short diagnostic label: tip index for leaves, `*` for coalesced
/// summaries, recursive bracket notation for internal nodes. Not used in
/// the likelihood computation.
impl std::fmt::Display for PhyloTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhyloTree::Leaf { index, .. } => write!(f, "{}", index),
            PhyloTree::Node { left, right, .. } => write!(f, "({},{})", left, right),
            PhyloTree::WeightedLeaf { .. } => write!(f, "*"),
            PhyloTree::WeightedNode { left, right, .. } => write!(f, "({},{})*", left, right),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tip(index: usize, age: f64) -> PhyloTree {
        PhyloTree::leaf(index, 0, vec![0, 1], age)
    }

    #[test]
    fn test_node_creation() {
        let tree = PhyloTree::node(tip(0, 0.0), tip(1, 0.5), 1.0).unwrap();
        assert_eq!(tree.kind(), TreeKind::Node);
        assert_eq!(tree.age(), 1.0);
    }

    #[test]
    fn test_age_invariant_rejected() {
        let err = PhyloTree::node(tip(0, 0.0), tip(1, 2.0), 1.0).unwrap_err();
        assert!(matches!(err, ModelError::AgeOrderViolation { .. }));

        // Equal ages are also rejected: branch lengths must be positive.
        let err = PhyloTree::node(tip(0, 1.0), tip(1, 0.0), 1.0).unwrap_err();
        assert!(matches!(err, ModelError::AgeOrderViolation { .. }));
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(tip(0, 0.0).kind(), TreeKind::Leaf);

        let wl = PhyloTree::weighted_leaf(vec![], RowDVector::zeros(2), 0.0, 0.0);
        assert_eq!(wl.kind(), TreeKind::WeightedLeaf);

        let wn = PhyloTree::weighted_node(tip(0, 0.0), tip(1, 0.0), 1.0, 0.0).unwrap();
        assert_eq!(wn.kind(), TreeKind::WeightedNode);
    }

    #[test]
    fn test_weighted_leaf_round_trip() {
        let sites = vec![
            RowDVector::from_vec(vec![0.25, 0.5, 0.125, 0.125]),
            RowDVector::from_vec(vec![1.0, 0.0, 0.0, 0.0]),
        ];
        let character = RowDVector::from_vec(vec![0.5, 0.5]);
        let wl = PhyloTree::weighted_leaf(sites.clone(), character.clone(), 2.5, -3.75);

        assert_eq!(wl.site_messages().unwrap(), sites.as_slice());
        assert_eq!(wl.character_message().unwrap(), &character);
        assert_eq!(wl.age(), 2.5);
        assert_eq!(wl.cumulative_log_weight(), Some(-3.75));
        assert_eq!(wl.n_sites(), Some(2));
    }

    #[test]
    fn test_display_labels() {
        let tree = PhyloTree::node(
            PhyloTree::node(tip(0, 0.0), tip(1, 0.0), 1.0).unwrap(),
            tip(2, 0.0),
            2.0,
        )
        .unwrap();
        assert_eq!(tree.to_string(), "((0,1),2)");
    }
}
