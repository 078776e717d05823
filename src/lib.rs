pub mod aux_loss;
pub mod dispatch;
pub mod errors;
pub mod expert;
pub mod model_config;
pub mod moe;
pub mod noise;
pub mod router;
pub mod routing;
// Re-export key structs for easier access
pub use aux_loss::AuxLossContext;
pub use dispatch::{combine, gather, Assignment, DispatchPlan, ExpertSlot, TokenRoute};
pub use errors::{MoeError, Result};
pub use expert::{build_ffn_experts, FeedForwardExpert, TokenTransform};
pub use model_config::{ExpertCount, MoeConfig, NoisePolicy, RouterConfig, RouterMode};
pub use moe::{MoeLayer, MoeOutput, MoeStack, RoutingStats};
pub use noise::NoiseGenerator;
pub use router::{Router, RouterOutput};
