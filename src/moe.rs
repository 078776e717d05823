//! Mixture of Experts (MoE) Layer
//!
//! One call routes a token batch through a sparse set of experts and returns a
//! batch of the same shape in the original token order.
//!
//! # Architecture
//!
//! ```text
//! Input → Gate → Router (Top-K, capacity) → Gather → Experts (parallel) → Combine → Output
//!                    └──────────────── L_aux ──────────────▶ AuxLossContext
//! ```
//!
//! A call is all-or-nothing: if any expert fails or returns the wrong shape,
//! the whole call fails and the loss context is left untouched.
//!
//! # References
//!
//! - Lepikhin et al., "GShard", 2020
//! - Fedus et al., "Switch Transformers", 2021
//! - Riquelme et al., "Scaling Vision with Sparse Mixture of Experts", 2021

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::aux_loss::AuxLossContext;
use crate::dispatch::{self, DispatchPlan};
use crate::errors::{MoeError, Result};
use crate::expert::{build_ffn_experts, FeedForwardExpert, TokenTransform};
use crate::model_config::{MoeConfig, RouterConfig, RouterMode};
use crate::router::Router;

/// Per-call routing summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingStats {
    pub capacity: usize,
    /// Tokens received by each expert
    pub expert_load: Vec<usize>,
    /// (token, expert) pairs refused at a full expert
    pub dropped_pairs: usize,
    /// Tokens that reached no expert at all
    pub dropped_tokens: usize,
    /// Pairs admitted past capacity
    pub overflow: usize,
}

impl RoutingStats {
    pub fn from_plan(plan: &DispatchPlan) -> Self {
        RoutingStats {
            capacity: plan.capacity(),
            expert_load: plan.expert_load(),
            dropped_pairs: plan.dropped_pairs(),
            dropped_tokens: plan.routes().iter().filter(|r| r.is_dropped()).count(),
            overflow: plan.overflow(),
        }
    }

    /// Fraction of tokens handled by each expert
    pub fn utilization(&self, num_tokens: usize) -> Vec<f32> {
        if num_tokens == 0 {
            return vec![0.0; self.expert_load.len()];
        }
        self.expert_load
            .iter()
            .map(|&load| load as f32 / num_tokens as f32)
            .collect()
    }
}

/// Output of one [`MoeLayer::apply`] call
#[derive(Debug, Clone)]
pub struct MoeOutput {
    /// Combined token batch, shape (N, D)
    pub output: Array2<f32>,
    /// This call's contribution to the auxiliary loss
    pub aux_loss: f32,
    pub stats: RoutingStats,
    pub plan: DispatchPlan,
}

/// Mixture of Experts Layer
///
/// Combines a gate projection, a router and a pool of experts addressed by
/// index. Generic over the expert type so any [`TokenTransform`] can be used.
pub struct MoeLayer<E: TokenTransform = FeedForwardExpert> {
    /// Gating weights: (d_model, num_experts)
    w_gate: Array2<f32>,
    router: Router,
    experts: Vec<E>,
    d_model: usize,
    mode: RouterMode,
}

impl<E: TokenTransform> MoeLayer<E> {
    /// Create a new MoE layer
    ///
    /// # Arguments
    ///
    /// * `d_model` - Token width
    /// * `router_config` - Router settings; `num_experts` must equal `experts.len()`
    /// * `experts` - Expert pool, expert `i` at index `i`
    pub fn new(d_model: usize, router_config: RouterConfig, experts: Vec<E>) -> Result<Self> {
        if d_model == 0 {
            return Err(MoeError::config("d_model must be > 0"));
        }
        if experts.len() != router_config.num_experts {
            return Err(MoeError::config(format!(
                "router has {} experts but {} were provided",
                router_config.num_experts,
                experts.len()
            )));
        }

        let num_experts = router_config.num_experts;
        let w_gate = Self::init_gate(d_model, num_experts, router_config.seed)?;
        let router = Router::new(router_config)?;

        Ok(MoeLayer {
            w_gate,
            router,
            experts,
            d_model,
            mode: RouterMode::Train,
        })
    }

    /// Xavier initialisation for the gate
    fn init_gate(d_model: usize, num_experts: usize, seed: u64) -> Result<Array2<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let std = (2.0 / (d_model + num_experts) as f32).sqrt();
        let normal =
            Normal::new(0.0, std).map_err(|e| MoeError::config(format!("gate init: {}", e)))?;
        Ok(Array2::from_shape_fn((d_model, num_experts), |_| {
            normal.sample(&mut rng)
        }))
    }

    /// Replace the gate projection, e.g. with trained weights
    pub fn set_gate(&mut self, w_gate: Array2<f32>) -> Result<()> {
        let expected = (self.d_model, self.num_experts());
        if w_gate.dim() != expected {
            return Err(MoeError::input(format!(
                "gate must have shape {:?}, got {:?}",
                expected,
                w_gate.dim()
            )));
        }
        self.w_gate = w_gate;
        Ok(())
    }

    pub fn set_mode(&mut self, mode: RouterMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> RouterMode {
        self.mode
    }

    pub fn num_experts(&self) -> usize {
        self.experts.len()
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn experts(&self) -> &[E] {
        &self.experts
    }

    /// Route, dispatch, run experts and combine one token batch
    ///
    /// The call's auxiliary loss is added to `ctx` only once the whole call
    /// has succeeded.
    pub fn apply(&mut self, input: &Array2<f32>, ctx: &mut AuxLossContext) -> Result<MoeOutput> {
        if input.ncols() != self.d_model {
            return Err(MoeError::input(format!(
                "layer expects token width {}, got {}",
                self.d_model,
                input.ncols()
            )));
        }

        // 1. Route
        let logits = input.dot(&self.w_gate);
        let routed = self.router.route(&logits, self.mode)?;

        // 2. Dispatch
        let batches = dispatch::gather(&routed.plan, input)?;

        // 3. Expert apply
        let expert_outputs = self.apply_experts(&batches)?;

        // 4. Combine
        let output = dispatch::combine(&routed.plan, input, &expert_outputs)?;

        ctx.add_loss(routed.aux_loss);

        let stats = RoutingStats::from_plan(&routed.plan);
        debug!(
            num_tokens = input.nrows(),
            expert_load = ?stats.expert_load,
            dropped_tokens = stats.dropped_tokens,
            aux_loss = routed.aux_loss,
            "MoE layer applied"
        );

        Ok(MoeOutput {
            output,
            aux_loss: routed.aux_loss,
            stats,
            plan: routed.plan,
        })
    }

    /// Run every expert on its own batch in parallel; the first failure wins
    fn apply_experts(&mut self, batches: &[Array2<f32>]) -> Result<Vec<Array2<f32>>> {
        self.experts
            .par_iter_mut()
            .zip(batches.par_iter())
            .enumerate()
            .map(|(expert_idx, (expert, batch))| {
                let output = expert.transform(batch).map_err(|err| match err {
                    MoeError::ShapeMismatch { .. } | MoeError::Expert { .. } => err,
                    other => MoeError::Expert {
                        expert: expert_idx,
                        message: other.to_string(),
                    },
                })?;

                if output.dim() != batch.dim() {
                    return Err(MoeError::ShapeMismatch {
                        expert: expert_idx,
                        expected: batch.dim(),
                        found: output.dim(),
                    });
                }
                Ok(output)
            })
            .collect()
    }
}

impl MoeLayer<FeedForwardExpert> {
    /// Build MoE layer `layer_idx` of a model with feed-forward experts
    pub fn from_config(config: &MoeConfig, layer_idx: usize, num_experts: usize) -> Result<Self> {
        let router_config = config.router_config(num_experts, layer_idx);
        let experts = build_ffn_experts(
            num_experts,
            config.d_model,
            config.d_ff,
            router_config.seed.wrapping_mul(1_000),
        )?;
        Self::new(config.d_model, router_config, experts)
    }

    pub fn parameters(&self) -> usize {
        self.w_gate.len() + self.experts.iter().map(|e| e.parameters()).sum::<usize>()
    }
}

/// The MoE layers of one model, run back to back
///
/// `forward` resets the loss context once at pass start; the caller reads the
/// accumulated total afterwards.
///
/// A shared stack holds a single layer and applies it `depth` times, so one
/// router (and its RNG) and one expert pool serve every block.
pub struct MoeStack<E: TokenTransform = FeedForwardExpert> {
    layers: Vec<MoeLayer<E>>,
    /// Consecutive applications of each layer per pass
    repeats: usize,
}

impl<E: TokenTransform> MoeStack<E> {
    pub fn new(layers: Vec<MoeLayer<E>>) -> Self {
        MoeStack { layers, repeats: 1 }
    }

    /// One layer applied at every one of `depth` blocks
    pub fn shared(layer: MoeLayer<E>, depth: usize) -> Result<Self> {
        if depth == 0 {
            return Err(MoeError::config("shared stack depth must be > 0"));
        }
        Ok(MoeStack {
            layers: vec![layer],
            repeats: depth,
        })
    }

    /// Distinct layers; a shared stack has exactly one
    pub fn layers(&self) -> &[MoeLayer<E>] {
        &self.layers
    }

    /// Layer applications per forward pass
    pub fn len(&self) -> usize {
        self.layers.len() * self.repeats
    }

    pub fn is_shared(&self) -> bool {
        self.repeats > 1
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn set_mode(&mut self, mode: RouterMode) {
        for layer in &mut self.layers {
            layer.set_mode(mode);
        }
    }

    /// One forward pass; returns the final batch and stats per layer call
    pub fn forward(
        &mut self,
        input: &Array2<f32>,
        ctx: &mut AuxLossContext,
    ) -> Result<(Array2<f32>, Vec<RoutingStats>)> {
        ctx.reset_loss();

        let repeats = self.repeats;
        let mut hidden = input.clone();
        let mut stats = Vec::with_capacity(self.len());

        for layer in &mut self.layers {
            for _ in 0..repeats {
                let out = layer.apply(&hidden, ctx)?;
                hidden = out.output;
                stats.push(out.stats);
            }
        }

        Ok((hidden, stats))
    }
}

impl MoeStack<FeedForwardExpert> {
    /// Build one feed-forward MoE layer per resolved expert count, or a single
    /// shared layer when `share_router` is set
    pub fn from_config(config: &MoeConfig) -> Result<Self> {
        config.validate()?;
        let counts = config.resolve_expert_counts()?;

        info!(
            num_layers = counts.len(),
            applications = config.num_moe_applications(),
            shared = config.share_router,
            expert_counts = ?counts,
            top_k = config.top_k(),
            noise = ?config.noise_policy(),
            "Building MoE stack"
        );

        if config.share_router {
            let layer = MoeLayer::<FeedForwardExpert>::from_config(config, 0, counts[0])?;
            return Self::shared(layer, config.depth);
        }

        let layers = counts
            .iter()
            .enumerate()
            .map(|(layer_idx, &num_experts)| {
                MoeLayer::<FeedForwardExpert>::from_config(config, layer_idx, num_experts)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(MoeStack::new(layers))
    }
}
