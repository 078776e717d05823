//! Dispatch plan, gather and combine
//!
//! The router decides *where* every token goes; this module moves the data.
//!
//! ```text
//! tokens (N, D) ──gather──▶ per-expert batches (C_e, D) ──experts──▶ (C_e, D) ──combine──▶ (N, D)
//! ```
//!
//! Gather and combine are purely local index operations, so a remote exchange
//! (all-to-all across devices) can sit between them without either side
//! knowing about it.

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::errors::{MoeError, Result};

/// One admitted (token, expert) pair as seen from the token
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub expert: usize,
    /// Row of this token inside the expert's gathered batch
    pub slot: usize,
    /// Combine weight applied to the expert output
    pub weight: f32,
}

/// Routing outcome for a single token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenRoute {
    /// Admitted assignments in preference order (highest gate score first)
    pub assignments: Vec<Assignment>,
    /// Experts this token selected but could not enter because they were full
    pub dropped: Vec<usize>,
}

impl TokenRoute {
    /// No expert processes this token
    pub fn is_dropped(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// One admitted (token, expert) pair as seen from the expert
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpertSlot {
    pub token: usize,
    pub weight: f32,
}

/// Token → expert assignment for one batch
///
/// Both directions are kept: `expert_slots[e]` lists the tokens expert `e`
/// receives in gather order, and `routes[t]` lists where token `t` went. The
/// two views always describe the same set of pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchPlan {
    num_tokens: usize,
    num_experts: usize,
    top_k: usize,
    capacity: usize,
    residual: bool,
    expert_slots: Vec<Vec<ExpertSlot>>,
    routes: Vec<TokenRoute>,
    overflow: usize,
}

impl DispatchPlan {
    /// Empty plan; the router fills it through [`DispatchPlan::admit`] and
    /// [`DispatchPlan::drop_pair`]
    pub fn new(
        num_tokens: usize,
        num_experts: usize,
        top_k: usize,
        capacity: usize,
        residual: bool,
    ) -> Self {
        Self {
            num_tokens,
            num_experts,
            top_k,
            capacity,
            residual,
            expert_slots: vec![Vec::new(); num_experts],
            routes: vec![TokenRoute::default(); num_tokens],
            overflow: 0,
        }
    }

    /// Append `token` to the end of `expert`'s batch and return its slot
    ///
    /// Admission past capacity is recorded as overflow rather than refused;
    /// refusing is the caller's drop policy.
    pub(crate) fn admit(&mut self, token: usize, expert: usize, weight: f32) -> usize {
        let slots = &mut self.expert_slots[expert];
        let slot = slots.len();
        if slot >= self.capacity {
            self.overflow += 1;
        }
        slots.push(ExpertSlot { token, weight });
        self.routes[token].assignments.push(Assignment {
            expert,
            slot,
            weight,
        });
        slot
    }

    pub(crate) fn drop_pair(&mut self, token: usize, expert: usize) {
        self.routes[token].dropped.push(expert);
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn residual(&self) -> bool {
        self.residual
    }

    /// Tokens `expert` receives in gather order; `None` past the last expert
    pub fn expert_slots(&self, expert: usize) -> Option<&[ExpertSlot]> {
        self.expert_slots.get(expert).map(Vec::as_slice)
    }

    pub(crate) fn is_full(&self, expert: usize) -> bool {
        self.expert_slots[expert].len() >= self.capacity
    }

    pub fn routes(&self) -> &[TokenRoute] {
        &self.routes
    }

    pub fn route(&self, token: usize) -> Option<&TokenRoute> {
        self.routes.get(token)
    }

    /// Tokens per expert, in expert order
    pub fn expert_load(&self) -> Vec<usize> {
        self.expert_slots.iter().map(Vec::len).collect()
    }

    /// Number of admitted (token, expert) pairs
    pub fn pair_count(&self) -> usize {
        self.expert_slots.iter().map(Vec::len).sum()
    }

    /// Number of (token, expert) pairs refused because the expert was full
    pub fn dropped_pairs(&self) -> usize {
        self.routes.iter().map(|r| r.dropped.len()).sum()
    }

    /// Pairs admitted beyond capacity (only possible with drops disabled)
    pub fn overflow(&self) -> usize {
        self.overflow
    }

    /// Token is in the batch and no expert processes it
    pub fn is_dropped(&self, token: usize) -> bool {
        self.routes.get(token).is_some_and(TokenRoute::is_dropped)
    }

    /// Token is in the batch and got all K of its selections
    pub fn is_fully_routed(&self, token: usize) -> bool {
        self.routes
            .get(token)
            .is_some_and(|route| route.assignments.len() == self.top_k)
    }
}

/// Build one batch per expert from the token rows it was assigned
///
/// Batch `e` has exactly `plan.expert_load()[e]` rows, in admission
/// order; experts with nothing assigned get a `(0, D)` batch.
pub fn gather(plan: &DispatchPlan, tokens: &Array2<f32>) -> Result<Vec<Array2<f32>>> {
    let (num_tokens, dim) = tokens.dim();
    if num_tokens != plan.num_tokens {
        return Err(MoeError::input(format!(
            "plan routes {} tokens but the batch has {}",
            plan.num_tokens, num_tokens
        )));
    }

    let batches = plan
        .expert_slots
        .iter()
        .map(|slots| {
            let mut batch = Array2::<f32>::zeros((slots.len(), dim));
            for (mut row, slot) in batch.axis_iter_mut(Axis(0)).zip(slots) {
                row.assign(&tokens.row(slot.token));
            }
            batch
        })
        .collect();

    Ok(batches)
}

/// Scatter expert outputs back to token order
///
/// Each output row is scaled by its combine weight and summed into the
/// token's position. Every output is shape-checked before anything is
/// written, so a bad expert leaves no partial result. In residual mode a
/// token with no admitted assignment receives its own input row.
pub fn combine(
    plan: &DispatchPlan,
    tokens: &Array2<f32>,
    expert_outputs: &[Array2<f32>],
) -> Result<Array2<f32>> {
    let (num_tokens, dim) = tokens.dim();
    if num_tokens != plan.num_tokens {
        return Err(MoeError::input(format!(
            "plan routes {} tokens but the batch has {}",
            plan.num_tokens, num_tokens
        )));
    }
    if expert_outputs.len() != plan.num_experts {
        return Err(MoeError::input(format!(
            "expected {} expert outputs, got {}",
            plan.num_experts,
            expert_outputs.len()
        )));
    }

    for (expert, (slots, output)) in plan.expert_slots.iter().zip(expert_outputs).enumerate() {
        let expected = (slots.len(), dim);
        if output.dim() != expected {
            return Err(MoeError::ShapeMismatch {
                expert,
                expected,
                found: output.dim(),
            });
        }
    }

    let mut combined = Array2::<f32>::zeros((num_tokens, dim));

    for (slots, output) in plan.expert_slots.iter().zip(expert_outputs) {
        for (slot, expert_row) in slots.iter().zip(output.axis_iter(Axis(0))) {
            combined
                .row_mut(slot.token)
                .scaled_add(slot.weight, &expert_row);
        }
    }

    if plan.residual {
        for (token, route) in plan.routes.iter().enumerate() {
            if route.is_dropped() {
                combined.row_mut(token).assign(&tokens.row(token));
            }
        }
    }

    Ok(combined)
}
