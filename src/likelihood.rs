//! Likelihood aggregation for evolved messages.
//!
//! Converts a merged per-site (or character) message into its scalar
//! log-likelihood contribution: the natural log of the component sum,
//! equivalent to a dot product against a vector of ones.

use nalgebra::RowDVector;

/// Log-likelihood contribution of one evolved message vector.
///
/// A sum that is zero, negative, or non-finite means this particle's
/// parameter draw is incompatible with the data; that is a modeled
/// outcome, not an error, so it maps to `f64::NEG_INFINITY` and
/// propagates through the rest of the computation.
pub fn log_message_likelihood(message: &RowDVector<f64>) -> f64 {
    let total = message.sum();
    if total.is_finite() && total > 0.0 {
        total.ln()
    } else {
        f64::NEG_INFINITY
    }
}

/// Summed log-likelihood contribution of a per-site message sequence.
pub fn log_sequence_likelihood(messages: &[RowDVector<f64>]) -> f64 {
    messages.iter().map(log_message_likelihood).sum()
}
