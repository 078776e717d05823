use clap::Parser;
use moe_dispatch::{AuxLossContext, ExpertCount, MoeConfig, MoeStack, RouterMode};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

#[derive(Parser, Debug)]
#[command(name = "moe-route")]
#[command(about = "Route a random token batch through a stack of MoE layers")]
struct Args {
    /// JSON config file; flags below override its fields
    #[arg(short, long)]
    config: Option<String>,

    /// Number of tokens in the batch
    #[arg(short = 'n', long, default_value_t = 64)]
    tokens: usize,

    #[arg(long)]
    d_model: Option<usize>,

    #[arg(long)]
    d_ff: Option<usize>,

    /// Expert count; repeat once per MoE layer for per-layer counts
    #[arg(short, long)]
    experts: Vec<usize>,

    /// Transformer depth (MoE layers = depth / 2, or depth with --share-router)
    #[arg(long)]
    depth: Option<usize>,

    #[arg(long)]
    capacity_factor_train: Option<f64>,

    #[arg(long)]
    capacity_factor_eval: Option<f64>,

    /// Admit overflow tokens past capacity instead of dropping them
    #[arg(long)]
    no_drop: bool,

    /// Top-1 routing with jitter noise and residual pass-through
    #[arg(long)]
    use_residual: bool,

    /// One router and expert pool applied at every one of `depth` blocks
    #[arg(long)]
    share_router: bool,

    /// Route with the eval capacity factor and no noise
    #[arg(long)]
    eval: bool,

    #[arg(long)]
    seed: Option<u64>,
}

fn build_config(args: &Args) -> moe_dispatch::Result<MoeConfig> {
    let mut config = match &args.config {
        Some(path) => MoeConfig::from_json_file(path)?,
        // Small enough to run instantly on a laptop
        None => MoeConfig {
            depth: 4,
            d_model: 64,
            d_ff: 256,
            ..MoeConfig::default()
        },
    };

    match args.experts.as_slice() {
        [] => {}
        [n] => config.num_experts = ExpertCount::Uniform(*n),
        list => config.num_experts = ExpertCount::PerLayer(list.to_vec()),
    }
    if let Some(d_model) = args.d_model {
        config.d_model = d_model;
    }
    if let Some(d_ff) = args.d_ff {
        config.d_ff = d_ff;
    }
    if let Some(depth) = args.depth {
        config.depth = depth;
    }
    if let Some(f) = args.capacity_factor_train {
        config.capacity_factor_train = f;
    }
    if let Some(f) = args.capacity_factor_eval {
        config.capacity_factor_eval = f;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.drop_tks &= !args.no_drop;
    config.use_residual |= args.use_residual;
    config.share_router |= args.share_router;

    Ok(config)
}

fn main() -> moe_dispatch::Result<()> {
    let args = Args::parse();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = build_config(&args)?;
    let mut stack = MoeStack::from_config(&config)?;
    if args.eval {
        stack.set_mode(RouterMode::Eval);
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let normal = Normal::new(0.0f32, 1.0).map_err(|e| moe_dispatch::MoeError::Configuration {
        message: format!("input distribution: {}", e),
    })?;
    let input = Array2::from_shape_fn((args.tokens, config.d_model), |_| normal.sample(&mut rng));

    let mut ctx = AuxLossContext::new();
    let (output, stats) = stack.forward(&input, &mut ctx)?;

    println!("\n=== MOE ROUTING ===");
    println!(
        "Layers: {}{} | top_k: {} | noise: {:?} | mode: {}",
        stack.len(),
        if stack.is_shared() { " (shared)" } else { "" },
        config.top_k(),
        config.noise_policy(),
        if args.eval { "eval" } else { "train" }
    );
    for (layer_idx, layer_stats) in stats.iter().enumerate() {
        let load: Vec<String> = layer_stats
            .utilization(args.tokens)
            .iter()
            .enumerate()
            .map(|(idx, frac)| format!("E{}:{:.1}%", idx, frac * 100.0))
            .collect();
        println!(
            "Layer {}: capacity={} dropped_tokens={} overflow={} | {}",
            layer_idx,
            layer_stats.capacity,
            layer_stats.dropped_tokens,
            layer_stats.overflow,
            load.join(" | ")
        );
    }
    println!("Output shape: {:?}", output.dim());
    println!("Auxiliary loss: {:.4}", ctx.take_loss());

    Ok(())
}
