use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::errors::{MoeError, Result};

/// A shape-preserving transform over a batch of tokens
///
/// Experts are addressed by their index in the layer's pool and share no
/// state, which lets the layer run them in parallel. An implementation must
/// accept a `(0, D)` batch and return a batch of the same shape as its input.
pub trait TokenTransform: Send {
    fn transform(&mut self, batch: &Array2<f32>) -> Result<Array2<f32>>;
}

// Lets a pool mix expert types as `Vec<Box<dyn TokenTransform>>`
impl<T: TokenTransform + ?Sized> TokenTransform for Box<T> {
    fn transform(&mut self, batch: &Array2<f32>) -> Result<Array2<f32>> {
        (**self).transform(batch)
    }
}

/// Expert network (SwiGLU without residual connection)
///
/// ```text
/// out = (swish(x W₁) ⊙ x W₂) W₃
/// ```
///
/// The residual connection, if any, belongs to the surrounding block.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FeedForwardExpert {
    w1: Array2<f32>,
    w2: Array2<f32>,
    w3: Array2<f32>,
}

impl FeedForwardExpert {
    pub fn new(d_model: usize, d_ff: usize, seed: u64) -> Result<Self> {
        if d_model == 0 || d_ff == 0 {
            return Err(MoeError::config("expert dimensions must be > 0"));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        // Smaller init than a dense FFN: several experts contribute to each token
        let std = (0.5 / d_model as f32).sqrt();
        let normal = Normal::new(0.0, std)
            .map_err(|e| MoeError::config(format!("expert init: {}", e)))?;

        Ok(FeedForwardExpert {
            w1: Array2::from_shape_fn((d_model, d_ff), |_| normal.sample(&mut rng)),
            w2: Array2::from_shape_fn((d_model, d_ff), |_| normal.sample(&mut rng)),
            w3: Array2::from_shape_fn((d_ff, d_model), |_| normal.sample(&mut rng)),
        })
    }

    pub fn d_model(&self) -> usize {
        self.w1.nrows()
    }

    pub fn parameters(&self) -> usize {
        self.w1.len() + self.w2.len() + self.w3.len()
    }
}

impl TokenTransform for FeedForwardExpert {
    fn transform(&mut self, batch: &Array2<f32>) -> Result<Array2<f32>> {
        if batch.ncols() != self.d_model() {
            return Err(MoeError::input(format!(
                "expert expects width {}, got {}",
                self.d_model(),
                batch.ncols()
            )));
        }

        let x1 = batch.dot(&self.w1);
        let x2 = batch.dot(&self.w2);
        let swish = x1.mapv(|x| x / (1.0 + (-x).exp()));
        let gated = &swish * &x2;

        Ok(gated.dot(&self.w3))
    }
}

/// Build `num_experts` independently initialised feed-forward experts
///
/// Expert `i` is seeded with `seed + i`.
pub fn build_ffn_experts(
    num_experts: usize,
    d_model: usize,
    d_ff: usize,
    seed: u64,
) -> Result<Vec<FeedForwardExpert>> {
    if num_experts == 0 {
        return Err(MoeError::config("num_experts must be > 0"));
    }
    (0..num_experts)
        .map(|i| FeedForwardExpert::new(d_model, d_ff, seed.wrapping_add(i as u64)))
        .collect()
}
