//! Top-K router with capacity-constrained admission
//!
//! # Algorithm
//!
//! ```text
//! logits (N, E) → noise (train only) → softmax → top-K → capacity admission → plan + L_aux
//! ```
//!
//! Admission walks the selections rank by rank: every token's first choice is
//! considered (tokens 0..N-1 in order) before any second choice, so a
//! secondary assignment can never push out a primary one. Within a rank the
//! lower token index wins a contested slot.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::dispatch::DispatchPlan;
use crate::errors::{MoeError, Result};
use crate::model_config::{RouterConfig, RouterMode};
use crate::noise::NoiseGenerator;
use crate::routing;

/// Result of routing one batch
#[derive(Debug, Clone)]
pub struct RouterOutput {
    pub plan: DispatchPlan,
    /// Load balance loss for this call
    pub aux_loss: f32,
    /// Normalised gate scores after noise, shape (N, E)
    pub gate_probs: Array2<f32>,
}

/// Router for expert selection
///
/// Owns its noise generator and a seeded RNG, so routing the same logits from
/// the same starting state always yields the same plan.
#[derive(Debug, Clone)]
pub struct Router {
    config: RouterConfig,
    noise: Option<NoiseGenerator>,
    rng: StdRng,
}

impl Router {
    /// Create a new router, rejecting configurations that can never route
    pub fn new(config: RouterConfig) -> Result<Self> {
        config.validate()?;

        let noise = config
            .noise
            .map(|policy| NoiseGenerator::new(policy, config.num_experts))
            .transpose()?;

        if !config.drop_tks && !config.use_residual {
            let min_factor = config.capacity_factor_train.min(config.capacity_factor_eval);
            if min_factor < config.top_k as f64 {
                warn!(
                    num_experts = config.num_experts,
                    top_k = config.top_k,
                    capacity_factor = min_factor,
                    "Capacity factor below top_k with drop_tks disabled, experts will exceed capacity"
                );
            }
        }

        Ok(Router {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            noise,
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn num_experts(&self) -> usize {
        self.config.num_experts
    }

    pub fn top_k(&self) -> usize {
        self.config.top_k
    }

    /// Capacity this router would use for a batch of `num_tokens`
    pub fn capacity(&self, num_tokens: usize, mode: RouterMode) -> usize {
        routing::compute_capacity(
            num_tokens,
            self.config.num_experts,
            self.config.capacity_factor(mode),
            self.config.min_capacity,
        )
    }

    /// Route tokens to experts
    ///
    /// # Arguments
    ///
    /// * `logits` - Raw gate logits of shape (num_tokens, num_experts)
    /// * `mode` - Selects the capacity factor; noise is only applied in `Train`
    pub fn route(&mut self, logits: &Array2<f32>, mode: RouterMode) -> Result<RouterOutput> {
        let (num_tokens, num_experts) = logits.dim();
        if num_experts != self.config.num_experts {
            return Err(MoeError::input(format!(
                "router expects {} expert logits per token, got {}",
                self.config.num_experts, num_experts
            )));
        }
        if logits.iter().any(|v| !v.is_finite()) {
            return Err(MoeError::input("router logits must be finite"));
        }

        let top_k = self.config.top_k;

        // 1. Perturb
        let perturbed = match (&self.noise, mode) {
            (Some(noise), RouterMode::Train) => noise.apply(logits, &mut self.rng),
            _ => logits.clone(),
        };

        // 2. Normalise per token
        let gate_probs = routing::softmax(&perturbed);

        // 3. Select
        let selections = routing::top_k_indices(&gate_probs, top_k);

        // 4. Admit under capacity
        let capacity = self.capacity(num_tokens, mode);
        let mut plan = DispatchPlan::new(
            num_tokens,
            num_experts,
            top_k,
            capacity,
            self.config.use_residual,
        );

        for rank in 0..top_k {
            for (token, choices) in selections.iter().enumerate() {
                let expert = choices[rank];
                if plan.is_full(expert) && self.config.drop_tks {
                    plan.drop_pair(token, expert);
                    continue;
                }

                let weight = self.combine_weight(&gate_probs, token, choices, expert);
                plan.admit(token, expert, weight);
            }
        }

        // 5. Balance
        let aux_loss = routing::compute_load_balance_loss(&gate_probs, &selections, top_k);

        if plan.overflow() > 0 {
            warn!(
                overflow = plan.overflow(),
                capacity = capacity,
                num_tokens = num_tokens,
                "Experts admitted tokens past capacity (drop_tks disabled)"
            );
        }

        debug!(
            num_tokens = num_tokens,
            num_experts = num_experts,
            top_k = top_k,
            capacity = capacity,
            dropped = plan.dropped_pairs(),
            overflow = plan.overflow(),
            aux_loss = aux_loss,
            "Routed batch"
        );

        Ok(RouterOutput {
            plan,
            aux_loss,
            gate_probs,
        })
    }

    fn combine_weight(
        &self,
        gate_probs: &Array2<f32>,
        token: usize,
        choices: &[usize],
        expert: usize,
    ) -> f32 {
        let prob = gate_probs[[token, expert]];
        if !self.config.normalize_weights {
            return prob;
        }

        let selected: f32 = choices.iter().map(|&e| gate_probs[[token, e]]).sum();
        if selected > 0.0 {
            prob / selected
        } else {
            prob
        }
    }
}
