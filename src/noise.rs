use ndarray::Array2;
use rand::distr::Uniform;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::errors::{MoeError, Result};
use crate::model_config::NoisePolicy;

/// Half-width of the multiplicative jitter band
pub const JITTER_EPS: f32 = 1e-2;

/// Perturbs router logits to break ties and spread load across experts
///
/// - `Gaussian`: `logit + n`, `n ~ N(0, 1/E²)`
/// - `Jitter`: `logit × u`, `u ~ U(1 - eps, 1 + eps)`
///
/// The generator holds no RNG of its own; callers pass a seeded one so the
/// perturbation is reproducible.
#[derive(Debug, Clone)]
pub enum NoiseGenerator {
    Gaussian { normal: Normal<f32> },
    Jitter { uniform: Uniform<f32> },
}

impl NoiseGenerator {
    pub fn new(policy: NoisePolicy, num_experts: usize) -> Result<Self> {
        if num_experts == 0 {
            return Err(MoeError::config("noise generator needs num_experts > 0"));
        }

        match policy {
            NoisePolicy::Gaussian => {
                let std = 1.0 / (num_experts as f32).powi(2);
                let normal = Normal::new(0.0, std)
                    .map_err(|e| MoeError::config(format!("gaussian noise: {}", e)))?;
                Ok(NoiseGenerator::Gaussian { normal })
            }
            NoisePolicy::Jitter => Self::jitter(JITTER_EPS),
        }
    }

    /// Jitter noise with a custom band; `eps` must lie in `(0, 1)`
    pub fn jitter(eps: f32) -> Result<Self> {
        if !(eps > 0.0 && eps < 1.0) {
            return Err(MoeError::config(format!(
                "jitter eps must be in (0, 1), got {}",
                eps
            )));
        }
        let uniform = Uniform::new(1.0 - eps, 1.0 + eps)
            .map_err(|e| MoeError::config(format!("jitter noise: {}", e)))?;
        Ok(NoiseGenerator::Jitter { uniform })
    }

    pub fn policy(&self) -> NoisePolicy {
        match self {
            NoiseGenerator::Gaussian { .. } => NoisePolicy::Gaussian,
            NoiseGenerator::Jitter { .. } => NoisePolicy::Jitter,
        }
    }

    /// Return a perturbed copy of `logits`, one draw per element in row-major order
    pub fn apply<R: Rng + ?Sized>(&self, logits: &Array2<f32>, rng: &mut R) -> Array2<f32> {
        match self {
            NoiseGenerator::Gaussian { normal } => logits.mapv(|x| x + normal.sample(&mut *rng)),
            NoiseGenerator::Jitter { uniform } => logits.mapv(|x| x * uniform.sample(&mut *rng)),
        }
    }
}
