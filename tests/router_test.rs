use approx::assert_abs_diff_eq;
use moe_dispatch::{MoeError, NoisePolicy, Router, RouterConfig, RouterMode};
use ndarray::{array, Array2};

fn quiet_top1(num_experts: usize, capacity_factor: f64) -> RouterConfig {
    RouterConfig {
        top_k: 1,
        capacity_factor_train: capacity_factor,
        noise: None,
        ..RouterConfig::top2(num_experts)
    }
}

#[test]
fn test_overflow_drops_later_tokens() {
    // N=4, E=2, cf=1.0 → C=2; tokens 0,1,2 all prefer expert 0
    let mut router = Router::new(quiet_top1(2, 1.0)).unwrap();
    let logits = array![[2.0, 0.0], [2.0, 0.0], [2.0, 0.0], [0.0, 2.0]];

    let out = router.route(&logits, RouterMode::Train).unwrap();
    let plan = &out.plan;

    assert_eq!(plan.capacity(), 2);
    assert_eq!(plan.expert_load(), vec![2, 1]);
    assert!(!plan.is_dropped(0));
    assert!(!plan.is_dropped(1));
    assert!(plan.is_dropped(2));
    assert_eq!(plan.route(2).unwrap().dropped, vec![0]);
    assert!(!plan.is_dropped(3));
    assert_eq!(plan.dropped_pairs(), 1);
    assert_eq!(plan.overflow(), 0);
}

#[test]
fn test_decimal_capacity_factor_keeps_whole_capacity() {
    // 0.7 × 10 / 1 is exactly 7 tokens, not 6
    let mut router = Router::new(quiet_top1(1, 0.7)).unwrap();
    let logits = Array2::zeros((10, 1));

    let plan = router.route(&logits, RouterMode::Train).unwrap().plan;

    assert_eq!(plan.capacity(), 7);
    assert_eq!(plan.expert_load(), vec![7]);
    assert_eq!(plan.dropped_pairs(), 3);
    assert!(!plan.is_dropped(6));
    assert!(plan.is_dropped(7));
}

#[test]
fn test_no_drop_admits_past_capacity() {
    let config = RouterConfig {
        drop_tks: false,
        ..quiet_top1(2, 1.0)
    };
    let mut router = Router::new(config).unwrap();
    let logits = Array2::from_shape_fn((6, 2), |(_, e)| if e == 0 { 3.0 } else { 0.0 });

    let out = router.route(&logits, RouterMode::Train).unwrap();

    assert_eq!(out.plan.capacity(), 3);
    assert_eq!(out.plan.expert_load(), vec![6, 0]);
    assert_eq!(out.plan.overflow(), 3);
    assert_eq!(out.plan.dropped_pairs(), 0);
}

#[test]
fn test_top2_primary_choices_admitted_first() {
    // C = floor(1.0 * 2 / 2) = 1
    let config = RouterConfig {
        capacity_factor_train: 1.0,
        noise: None,
        ..RouterConfig::top2(2)
    };
    let mut router = Router::new(config).unwrap();
    let logits = array![[0.0, 1.0], [1.0, 0.0]];

    let out = router.route(&logits, RouterMode::Train).unwrap();
    let plan = &out.plan;

    // Token 0's secondary (expert 0) would have taken token 1's primary slot
    assert_eq!(plan.route(0).unwrap().assignments[0].expert, 1);
    assert_eq!(plan.route(1).unwrap().assignments[0].expert, 0);
    assert_eq!(plan.route(0).unwrap().dropped, vec![0]);
    assert_eq!(plan.route(1).unwrap().dropped, vec![1]);
    assert_eq!(plan.pair_count(), 2);
}

#[test]
fn test_top2_assignments_sorted_by_score() {
    let config = RouterConfig {
        capacity_factor_train: 4.0,
        noise: None,
        ..RouterConfig::top2(3)
    };
    let mut router = Router::new(config).unwrap();
    let logits = array![[0.1, 2.0, 1.0]];

    let out = router.route(&logits, RouterMode::Train).unwrap();
    let route = out.plan.route(0).unwrap();

    assert_eq!(route.assignments.len(), 2);
    assert_eq!(route.assignments[0].expert, 1);
    assert_eq!(route.assignments[1].expert, 2);
    assert!(route.assignments[0].weight > route.assignments[1].weight);
    assert_abs_diff_eq!(
        route.assignments[0].weight,
        out.gate_probs[[0, 1]],
        epsilon = 1e-6
    );
}

#[test]
fn test_normalized_weights_sum_to_one() {
    let config = RouterConfig {
        capacity_factor_train: 4.0,
        noise: None,
        normalize_weights: true,
        ..RouterConfig::top2(4)
    };
    let mut router = Router::new(config).unwrap();
    let logits = array![[0.3, -1.0, 2.0, 0.5], [1.0, 1.0, 1.0, 1.0]];

    let out = router.route(&logits, RouterMode::Train).unwrap();
    for route in out.plan.routes() {
        let total: f32 = route.assignments.iter().map(|a| a.weight).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-6);
    }
}

#[test]
fn test_ties_break_to_lowest_expert() {
    let mut router = Router::new(RouterConfig {
        capacity_factor_train: 4.0,
        noise: None,
        ..RouterConfig::top2(4)
    })
    .unwrap();
    let logits = Array2::zeros((1, 4));

    let out = router.route(&logits, RouterMode::Train).unwrap();
    let experts: Vec<usize> = out.plan.route(0).unwrap().assignments.iter().map(|a| a.expert).collect();
    assert_eq!(experts, vec![0, 1]);
}

#[test]
fn test_same_seed_same_plan() {
    let config = RouterConfig {
        seed: 1234,
        ..RouterConfig::top2(4)
    };
    let logits = Array2::from_shape_fn((32, 4), |(t, e)| ((t * 7 + e * 3) % 5) as f32 * 0.01);

    let mut a = Router::new(config.clone()).unwrap();
    let mut b = Router::new(config).unwrap();

    let plan_a = a.route(&logits, RouterMode::Train).unwrap().plan;
    let plan_b = b.route(&logits, RouterMode::Train).unwrap().plan;
    assert_eq!(plan_a, plan_b);
}

#[test]
fn test_eval_mode_uses_eval_capacity_and_no_noise() {
    let config = RouterConfig {
        capacity_factor_train: 1.0,
        capacity_factor_eval: 2.0,
        ..RouterConfig::top2(4)
    };
    let mut router = Router::new(config).unwrap();
    assert_eq!(router.capacity(8, RouterMode::Train), 2);
    assert_eq!(router.capacity(8, RouterMode::Eval), 4);

    let logits = array![[0.0, 1.0, 2.0, 3.0]];
    let out = router.route(&logits, RouterMode::Eval).unwrap();
    let expected = moe_dispatch::routing::softmax(&logits);
    assert_eq!(out.gate_probs, expected);
}

#[test]
fn test_residual_config_uses_jitter_top1() {
    let router = Router::new(RouterConfig::residual(4)).unwrap();
    assert_eq!(router.top_k(), 1);
    assert_eq!(router.config().noise, Some(NoisePolicy::Jitter));
}

#[test]
fn test_wrong_logit_width_rejected() {
    let mut router = Router::new(RouterConfig::top2(4)).unwrap();
    let err = router
        .route(&Array2::zeros((3, 5)), RouterMode::Train)
        .unwrap_err();
    assert!(matches!(err, MoeError::InvalidInput { .. }));
}

#[test]
fn test_non_finite_logits_rejected() {
    let mut router = Router::new(RouterConfig::top2(2)).unwrap();
    let logits = array![[f32::NAN, 0.0]];
    assert!(router.route(&logits, RouterMode::Train).is_err());
}

#[test]
fn test_zero_experts_rejected_at_construction() {
    let err = Router::new(RouterConfig::top2(0)).unwrap_err();
    assert!(matches!(err, MoeError::Configuration { .. }));
}

#[test]
fn test_empty_batch_routes_to_empty_plan() {
    let mut router = Router::new(RouterConfig::top2(4)).unwrap();
    let out = router
        .route(&Array2::zeros((0, 4)), RouterMode::Train)
        .unwrap();

    assert_eq!(out.plan.pair_count(), 0);
    assert_eq!(out.aux_loss, 0.0);
}

#[test]
fn test_collapsed_routing_has_higher_loss_than_balanced() {
    let mut router = Router::new(quiet_top1(4, 2.0)).unwrap();

    let collapsed = Array2::from_shape_fn((8, 4), |(_, e)| if e == 0 { 5.0 } else { 0.0 });
    let balanced = Array2::from_shape_fn((8, 4), |(t, e)| if e == t % 4 { 5.0 } else { 0.0 });

    let collapsed_loss = router.route(&collapsed, RouterMode::Train).unwrap().aux_loss;
    let balanced_loss = router.route(&balanced, RouterMode::Train).unwrap().aux_loss;

    assert!(collapsed_loss > balanced_loss);
    assert!(balanced_loss >= 0.0);
}
