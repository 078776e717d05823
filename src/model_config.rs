use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{MoeError, Result};

/// Expert count for the MoE layers of a model
///
/// Either one count shared by every MoE layer, or an explicit count per layer.
/// Serialized untagged, so a JSON config may carry `4` or `[4, 8, 8]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpertCount {
    Uniform(usize),
    PerLayer(Vec<usize>),
}

impl ExpertCount {
    /// Resolve to one concrete count per MoE layer
    ///
    /// A per-layer list must have exactly `num_moe_layers` entries and no count
    /// may be zero.
    pub fn resolve(&self, num_moe_layers: usize) -> Result<Vec<usize>> {
        let counts = match self {
            ExpertCount::Uniform(n) => vec![*n; num_moe_layers],
            ExpertCount::PerLayer(list) => {
                if list.len() != num_moe_layers {
                    return Err(MoeError::config(format!(
                        "num_experts has {} entries but the model has {} MoE layers",
                        list.len(),
                        num_moe_layers
                    )));
                }
                list.clone()
            }
        };

        if let Some(layer) = counts.iter().position(|&n| n == 0) {
            return Err(MoeError::config(format!(
                "MoE layer {} has zero experts",
                layer
            )));
        }

        Ok(counts)
    }
}

impl Default for ExpertCount {
    fn default() -> Self {
        ExpertCount::Uniform(4)
    }
}

/// Noise injected into router logits before normalisation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoisePolicy {
    /// Multiplicative uniform noise in `[1 - eps, 1 + eps]`
    /// - Paired with the residual (top-1) router
    Jitter,

    /// Additive Gaussian noise with std `1 / E²`
    /// - Paired with the balanced top-2 router
    Gaussian,
}

/// Whether a router is running inside a training step or at evaluation
///
/// Selects the capacity factor, and noise is only injected in `Train`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RouterMode {
    #[default]
    Train,
    Eval,
}

/// Per-layer router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub num_experts: usize,

    /// Experts selected per token (1 or 2)
    pub top_k: usize,

    pub capacity_factor_train: f64,
    pub capacity_factor_eval: f64,

    /// Lower bound on the per-expert capacity after flooring (0 disables it)
    pub min_capacity: usize,

    /// Drop tokens that reach a saturated expert; otherwise admit them past capacity
    pub drop_tks: bool,

    /// Tokens whose every assignment was dropped pass their input through
    pub use_residual: bool,

    /// `None` disables noise entirely
    pub noise: Option<NoisePolicy>,

    /// Renormalise combine weights over the selected top-k set
    pub normalize_weights: bool,

    pub seed: u64,
}

impl RouterConfig {
    /// Top-2 router with Gaussian noise, dropping overflow tokens
    pub fn top2(num_experts: usize) -> Self {
        Self {
            num_experts,
            top_k: 2,
            capacity_factor_train: 1.25,
            capacity_factor_eval: 2.0,
            min_capacity: 0,
            drop_tks: true,
            use_residual: false,
            noise: Some(NoisePolicy::Gaussian),
            normalize_weights: false,
            seed: 42,
        }
    }

    /// Top-1 router with Jitter noise and residual pass-through
    pub fn residual(num_experts: usize) -> Self {
        Self {
            top_k: 1,
            use_residual: true,
            noise: Some(NoisePolicy::Jitter),
            ..Self::top2(num_experts)
        }
    }

    pub fn capacity_factor(&self, mode: RouterMode) -> f64 {
        match mode {
            RouterMode::Train => self.capacity_factor_train,
            RouterMode::Eval => self.capacity_factor_eval,
        }
    }

    /// Check everything that can be rejected before any batch is seen
    pub fn validate(&self) -> Result<()> {
        if self.num_experts == 0 {
            return Err(MoeError::config("num_experts must be > 0"));
        }
        if !(1..=2).contains(&self.top_k) {
            return Err(MoeError::config(format!(
                "top_k must be 1 or 2, got {}",
                self.top_k
            )));
        }
        if self.top_k > self.num_experts {
            return Err(MoeError::config(format!(
                "top_k ({}) must be <= num_experts ({})",
                self.top_k, self.num_experts
            )));
        }
        for (name, factor) in [
            ("capacity_factor_train", self.capacity_factor_train),
            ("capacity_factor_eval", self.capacity_factor_eval),
        ] {
            if !factor.is_finite() || factor < 0.0 {
                return Err(MoeError::config(format!(
                    "{} must be a finite non-negative number, got {}",
                    name, factor
                )));
            }
        }

        // With a zero capacity every token overflows; without drops or a
        // residual path there is nowhere for them to go.
        if !self.drop_tks && !self.use_residual && self.min_capacity == 0 {
            let zero_capacity = [self.capacity_factor_train, self.capacity_factor_eval]
                .iter()
                .any(|&f| f == 0.0);
            if zero_capacity {
                return Err(MoeError::config(
                    "drop_tks=false with a zero capacity factor and no residual path overflows every expert",
                ));
            }
        }

        Ok(())
    }
}

/// Model-level MoE configuration
///
/// Mirrors the constructor surface of a MoE vision transformer: half of the
/// `depth` transformer layers carry an MoE feed-forward block. With
/// `share_router` set, one router and one expert pool serve every one of the
/// `depth` blocks instead (WideNet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoeConfig {
    pub num_experts: ExpertCount,
    pub depth: usize,
    pub d_model: usize,
    pub d_ff: usize,
    pub capacity_factor_train: f64,
    pub capacity_factor_eval: f64,
    pub min_capacity: usize,
    pub drop_tks: bool,
    pub use_residual: bool,
    pub noisy_policy: Option<NoisePolicy>,
    pub normalize_weights: bool,
    /// One router and expert pool applied at every block
    pub share_router: bool,
    pub seed: u64,
}

impl Default for MoeConfig {
    fn default() -> Self {
        Self {
            num_experts: ExpertCount::default(),
            depth: 12,
            d_model: 768,
            d_ff: 3072,
            capacity_factor_train: 1.25,
            capacity_factor_eval: 2.0,
            min_capacity: 0,
            drop_tks: true,
            use_residual: false,
            noisy_policy: None,
            normalize_weights: false,
            share_router: false,
            seed: 42,
        }
    }
}

impl MoeConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: MoeConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn top_k(&self) -> usize {
        if self.use_residual { 1 } else { 2 }
    }

    pub fn noise_policy(&self) -> NoisePolicy {
        self.noisy_policy.unwrap_or(if self.use_residual {
            NoisePolicy::Jitter
        } else {
            NoisePolicy::Gaussian
        })
    }

    /// Distinct MoE layers, each with its own router and experts
    pub fn num_moe_layers(&self) -> usize {
        if self.share_router {
            1
        } else {
            self.depth / 2
        }
    }

    /// MoE layer calls in one forward pass
    pub fn num_moe_applications(&self) -> usize {
        if self.share_router {
            self.depth
        } else {
            self.depth / 2
        }
    }

    pub fn resolve_expert_counts(&self) -> Result<Vec<usize>> {
        self.num_experts.resolve(self.num_moe_layers())
    }

    pub fn router_config(&self, num_experts: usize, layer_idx: usize) -> RouterConfig {
        RouterConfig {
            num_experts,
            top_k: self.top_k(),
            capacity_factor_train: self.capacity_factor_train,
            capacity_factor_eval: self.capacity_factor_eval,
            min_capacity: self.min_capacity,
            drop_tks: self.drop_tks,
            use_residual: self.use_residual,
            noise: Some(self.noise_policy()),
            normalize_weights: self.normalize_weights,
            seed: self.seed.wrapping_add(layer_idx as u64),
        }
    }

    /// Validate the model-level shape and every per-layer router config
    pub fn validate(&self) -> Result<()> {
        if self.depth == 0 {
            return Err(MoeError::config("depth must be > 0"));
        }
        if !self.share_router && self.depth % 2 != 0 {
            return Err(MoeError::config(format!(
                "depth must be even without a shared router, got {}",
                self.depth
            )));
        }
        if self.d_model == 0 || self.d_ff == 0 {
            return Err(MoeError::config("d_model and d_ff must be > 0"));
        }
        for (layer_idx, &num_experts) in self.resolve_expert_counts()?.iter().enumerate() {
            self.router_config(num_experts, layer_idx).validate()?;
        }
        Ok(())
    }
}
