//! Routing primitives shared by the router and its tests
//!
//! - Numerically stable row-wise softmax
//! - Stable Top-K selection (ties go to the lowest index)
//! - Per-expert capacity
//! - Load balance loss (importance × load)

use ndarray::{Array1, Array2, Axis};

/// Select Top-K indices for each row in the scores matrix
///
/// # Arguments
///
/// * `scores` - Routing scores of shape (num_tokens, num_experts)
/// * `k` - Number of top experts to select
///
/// # Returns
///
/// One vector per token holding the indices of its top-K experts, sorted in
/// descending order by score. Equal scores keep their original order, so the
/// lower expert index wins a tie.
///
/// # Example
///
/// ```ignore
/// let scores = array![[0.1, 0.5, 0.3, 0.2]];
/// let top_k = top_k_indices(&scores, 2);
/// assert_eq!(top_k[0], vec![1, 2]);
/// ```
pub fn top_k_indices(scores: &Array2<f32>, k: usize) -> Vec<Vec<usize>> {
    let (num_tokens, num_experts) = scores.dim();
    let k = k.min(num_experts);

    let mut result = Vec::with_capacity(num_tokens);

    for row in scores.axis_iter(Axis(0)) {
        let mut indexed_scores: Vec<(usize, f32)> = row.iter().copied().enumerate().collect();

        // sort_by is stable: equal scores stay in index order
        indexed_scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        result.push(indexed_scores.iter().take(k).map(|(idx, _)| *idx).collect());
    }

    result
}

/// Numerically stable softmax over each row
///
/// ```text
/// softmax(x_i) = exp(x_i - max(x)) / Σ exp(x_j - max(x))
/// ```
pub fn softmax(x: &Array2<f32>) -> Array2<f32> {
    let mut result = x.clone();

    for mut row in result.axis_iter_mut(Axis(0)) {
        let max_val = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|val| (val - max_val).exp());
        let sum_exp = row.sum();
        if sum_exp > 0.0 {
            row.mapv_inplace(|val| val / sum_exp);
        }
    }

    result
}

/// Relative slack absorbed before flooring the capacity
const CAPACITY_EPS: f64 = 1e-9;

/// Maximum number of tokens one expert may receive
///
/// `C = max(floor(capacity_factor × N / E), min_capacity)`
///
/// Decimal factors such as `0.7` are not exact in binary, so `0.7 × 10` can
/// land a hair under 7. A relative slack of `CAPACITY_EPS` is added before
/// flooring so whole products are not rounded down.
pub fn compute_capacity(
    num_tokens: usize,
    num_experts: usize,
    capacity_factor: f64,
    min_capacity: usize,
) -> usize {
    if num_experts == 0 {
        return min_capacity;
    }
    let exact = capacity_factor * num_tokens as f64 / num_experts as f64;
    let raw = (exact + exact.abs() * CAPACITY_EPS).floor();
    let capacity = if raw.is_finite() && raw > 0.0 { raw as usize } else { 0 };
    capacity.max(min_capacity)
}

/// Compute load balance loss to discourage routing collapse
///
/// ```text
/// L_aux = E × Σ(e=1 to E) P_e × f_e / K
/// ```
///
/// Where:
/// - `P_e` = mean gate probability of expert e over all tokens (importance)
/// - `f_e` = fraction of tokens that selected e among their top-K (load)
/// - `K`   = number of selections per token
///
/// Balanced routing gives 1.0; collapsing every token onto one expert pushes the
/// loss towards E.
///
/// # Arguments
///
/// * `gate_probs` - Normalised gate scores of shape (num_tokens, num_experts)
/// * `selections` - Top-K expert indices per token, before any capacity drop
/// * `k` - Number of selections per token
pub fn compute_load_balance_loss(
    gate_probs: &Array2<f32>,
    selections: &[Vec<usize>],
    k: usize,
) -> f32 {
    let (num_tokens, num_experts) = gate_probs.dim();

    if num_tokens == 0 || num_experts == 0 || k == 0 {
        return 0.0;
    }

    let importance: Array1<f32> = gate_probs
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(num_experts));

    let mut load = Array1::<f32>::zeros(num_experts);
    for choices in selections {
        for &expert in choices {
            load[expert] += 1.0;
        }
    }
    load /= num_tokens as f32;

    let loss: f32 = importance.iter().zip(load.iter()).map(|(p, f)| p * f).sum();

    (loss * num_experts as f32 / k as f32).max(0.0)
}
