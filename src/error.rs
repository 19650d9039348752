//! Fatal configuration errors.
//!
//! These indicate a caller/setup bug detected before or during traversal
//! setup, and halt the run with a diagnostic naming the violated
//! invariant. Run-time data conditions (a malformed subtree shape, a
//! zero likelihood sum) are deliberately *not* errors: they propagate as
//! a −∞ log-weight so the particle filter can discard the particle at
//! the next resampling checkpoint.

use thiserror::Error;

/// Invariant violations that halt the entire run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    /// A node is not strictly older than one of its children.
    #[error("node at age {age} is not older than child `{child}` at age {child_age}")]
    AgeOrderViolation {
        age: f64,
        child_age: f64,
        child: String,
    },

    /// A branch length came out negative during a merge.
    #[error("negative branch length {length} from parent at age {parent_age} to child `{child}` at age {child_age}")]
    NegativeBranchLength {
        parent_age: f64,
        child_age: f64,
        length: f64,
        child: String,
    },

    /// A generator or jump matrix is not square.
    #[error("{name} matrix must be square, got {rows}x{cols}")]
    NonSquareMatrix {
        name: &'static str,
        rows: usize,
        cols: usize,
    },

    /// A generator row does not sum to zero.
    #[error("{name} generator row {row} sums to {sum:e}, expected 0")]
    GeneratorRowSum {
        name: &'static str,
        row: usize,
        sum: f64,
    },

    /// A generator off-diagonal or jump-matrix entry is negative.
    #[error("{name} matrix entry ({row},{col}) is negative: {value}")]
    NegativeEntry {
        name: &'static str,
        row: usize,
        col: usize,
        value: f64,
    },

    /// A jump-matrix row does not sum to one.
    #[error("{name} jump matrix row {row} sums to {sum}, expected 1")]
    NonStochasticRow {
        name: &'static str,
        row: usize,
        sum: f64,
    },

    /// The emission table width disagrees with the character-state count.
    #[error("emission table has {cols} columns, expected {expected} character states")]
    EmissionWidth { cols: usize, expected: usize },

    /// An observed leaf state falls outside the model's state space.
    #[error("observed {what} state {state} outside model range 0..{limit}")]
    UnknownState {
        what: &'static str,
        state: usize,
        limit: usize,
    },

    /// Two sibling subtrees carry site sequences of different lengths.
    #[error("site sequences differ in length at merge: {left} vs {right}")]
    RaggedSites { left: usize, right: usize },

    /// A stored message vector has the wrong dimensionality.
    #[error("dimension mismatch: {what} has {got} states, expected {expected}")]
    DimensionMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },

    /// A rate parameter is negative or non-finite.
    #[error("{what} must be a finite non-negative rate, got {value}")]
    InvalidRate { what: &'static str, value: f64 },

    /// A Gamma prior was configured with a non-positive shape or rate.
    #[error("{what} prior needs positive shape and rate, got shape {shape}, rate {rate}")]
    InvalidPrior {
        what: &'static str,
        shape: f64,
        rate: f64,
    },
}
