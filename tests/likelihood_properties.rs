//! Cross-module properties of the likelihood engine: determinism, rollback,
//! scaling, ambiguity, incrementality and growth.

use ndarray::Array2;
use pruning_core::core::{Dimensions, LikelihoodCore};
use pruning_core::{
    log_likelihoods_parallel, simulate_patterns, Ascertainment, BinaryGainLoss, LikelihoodConfig,
    LikelihoodError, PatternSet, RateCategories, ScalingMode, ScalingPolicy, SubstitutionModel,
    TipData, Tree, TreeLikelihood, F81,
};

// ═══════════════════════════════════════════════════════════════════
// Fixtures
// ═══════════════════════════════════════════════════════════════════

const EIGHT_TAXA: &str = "(((t0:0.1,t1:0.2):0.05,(t2:0.15,t3:0.3):0.1):0.2,\
                          ((t4:0.25,t5:0.1):0.12,(t6:0.2,t7:0.05):0.3):0.1);";

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn eight_taxa_tree() -> Tree {
    let taxa: Vec<String> = (0..8).map(|i| format!("t{i}")).collect();
    Tree::from_newick(EIGHT_TAXA, &taxa).unwrap()
}

fn jc() -> F81 {
    F81::jukes_cantor(4).unwrap()
}

fn build(tree: Tree, patterns: PatternSet, rates: RateCategories, config: LikelihoodConfig) -> TreeLikelihood<F81> {
    TreeLikelihood::new(tree, patterns, jc(), rates, config).unwrap()
}

fn simulated(seed: u64) -> (Tree, PatternSet) {
    let tree = eight_taxa_tree();
    let patterns = simulate_patterns(&tree, &jc(), &RateCategories::single(), 300, seed).unwrap();
    (tree, patterns)
}

fn gamma_like_rates() -> RateCategories {
    RateCategories::equal(vec![0.2, 0.6, 1.2, 2.0]).unwrap()
}

/// Balanced tree over a power-of-two number of tips, every branch `length`.
fn balanced_tree(n_tips: usize, length: f64) -> Tree {
    let mut parents = vec![-1i32; 2 * n_tips - 1];
    let mut level: Vec<usize> = (0..n_tips).collect();
    let mut next = n_tips;
    while level.len() > 1 {
        let mut up = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            for &child in pair {
                parents[child] = next as i32;
            }
            up.push(next);
            next += 1;
        }
        level = up;
    }
    let lengths = vec![length; parents.len()];
    Tree::from_structure(parents, lengths, n_tips).unwrap()
}

/// Every neighbouring tip in a different state: far from any likely history.
fn discordant_patterns(n_tips: usize, sites: usize) -> PatternSet {
    let alignment = Array2::from_shape_fn((n_tips, sites), |(tip, site)| ((tip + site) % 4) as u32);
    let taxa = (0..n_tips).map(|i| format!("t{i}")).collect();
    PatternSet::from_alignment(taxa, alignment.view(), 4).unwrap()
}

fn assert_close(a: f64, b: f64, tol: f64) {
    assert!((a - b).abs() <= tol, "{a} vs {b} (tol {tol})");
}

// ═══════════════════════════════════════════════════════════════════
// Determinism
// ═══════════════════════════════════════════════════════════════════

#[test]
fn independent_evaluations_are_bitwise_identical() {
    let (tree, patterns) = simulated(42);
    let mut a = build(tree.clone(), patterns.clone(), gamma_like_rates(), LikelihoodConfig::default());
    let mut b = build(tree, patterns, gamma_like_rates(), LikelihoodConfig::default());

    let la = a.log_likelihood().unwrap();
    let lb = b.log_likelihood().unwrap();
    assert_eq!(la.to_bits(), lb.to_bits());

    a.mark_all_dirty();
    assert_eq!(a.log_likelihood().unwrap().to_bits(), la.to_bits());
}

#[test]
fn parallel_kernels_match_serial() {
    let (tree, patterns) = simulated(5);
    let serial = LikelihoodConfig {
        parallel_pattern_threshold: usize::MAX,
        ..LikelihoodConfig::default()
    };
    let parallel = LikelihoodConfig {
        parallel_pattern_threshold: 1,
        ..LikelihoodConfig::default()
    };

    let mut a = build(tree.clone(), patterns.clone(), gamma_like_rates(), serial);
    let mut b = build(tree, patterns, gamma_like_rates(), parallel);
    assert_eq!(
        a.log_likelihood().unwrap().to_bits(),
        b.log_likelihood().unwrap().to_bits()
    );
}

// ═══════════════════════════════════════════════════════════════════
// Store / restore / accept
// ═══════════════════════════════════════════════════════════════════

#[test]
fn restore_reproduces_stored_likelihood_exactly() {
    let (tree, patterns) = simulated(1);
    let mut lik = build(tree, patterns, gamma_like_rates(), LikelihoodConfig::default());

    let original = lik.log_likelihood().unwrap();
    lik.store_state();

    lik.set_branch_length(3, 1.7).unwrap();
    let proposed = lik.log_likelihood().unwrap();
    assert_ne!(proposed.to_bits(), original.to_bits());

    // a second change within the same proposal must not touch the stored copy
    lik.set_branch_length(5, 0.9).unwrap();
    lik.log_likelihood().unwrap();

    lik.restore_state();
    assert_eq!(lik.log_likelihood().unwrap().to_bits(), original.to_bits());
    assert_eq!(lik.tree().branch_lengths[3], 0.3);

    // restored buffers are the real thing, not just a cached number
    lik.set_branch_length(6, 0.2).unwrap();
    let fresh = lik.log_likelihood().unwrap();
    let mut reference = build(lik.tree().clone(), lik.patterns().clone(), gamma_like_rates(), LikelihoodConfig::default());
    assert_close(fresh, reference.log_likelihood().unwrap(), 1e-10);
}

#[test]
fn accept_moves_the_rollback_point() {
    let (tree, patterns) = simulated(2);
    let mut lik = build(tree, patterns, RateCategories::single(), LikelihoodConfig::default());
    lik.log_likelihood().unwrap();
    lik.store_state();

    lik.set_branch_length(0, 0.6).unwrap();
    let accepted = lik.log_likelihood().unwrap();
    lik.accept_state();

    lik.set_branch_length(0, 2.5).unwrap();
    lik.log_likelihood().unwrap();
    lik.restore_state();

    assert_eq!(lik.log_likelihood().unwrap().to_bits(), accepted.to_bits());
}

#[test]
fn restore_without_stored_partials_recomputes() {
    let (tree, patterns) = simulated(3);
    let config = LikelihoodConfig {
        store_partials: false,
        ..LikelihoodConfig::default()
    };
    let mut lik = build(tree, patterns, RateCategories::single(), config);

    let original = lik.log_likelihood().unwrap();
    lik.store_state();
    lik.set_branch_length(4, 3.0).unwrap();
    lik.log_likelihood().unwrap();
    lik.restore_state();

    assert_close(lik.log_likelihood().unwrap(), original, 1e-12);
    assert_eq!(lik.last_update_count(), 7);
}

#[test]
fn model_change_is_rolled_back() {
    let (tree, patterns) = simulated(4);
    let mut lik = build(tree, patterns, RateCategories::single(), LikelihoodConfig::default());
    let original = lik.log_likelihood().unwrap();
    lik.store_state();

    lik.update_model(|m| *m = F81::new(vec![0.1, 0.2, 0.3, 0.4]).unwrap())
        .unwrap();
    assert_ne!(lik.log_likelihood().unwrap().to_bits(), original.to_bits());

    lik.restore_state();
    assert_eq!(lik.model().frequencies(), &[0.25; 4]);
    assert_eq!(lik.log_likelihood().unwrap().to_bits(), original.to_bits());
}

// ═══════════════════════════════════════════════════════════════════
// Scaling
// ═══════════════════════════════════════════════════════════════════

#[test]
fn scaling_does_not_change_small_likelihoods() {
    let (tree, patterns) = simulated(9);
    let always = LikelihoodConfig {
        scaling: ScalingPolicy {
            mode: ScalingMode::Always,
            ..ScalingPolicy::default()
        },
        ..LikelihoodConfig::default()
    };
    let mut plain = build(tree.clone(), patterns.clone(), gamma_like_rates(), LikelihoodConfig::default());
    let mut scaled = build(tree, patterns, gamma_like_rates(), always);

    assert_close(plain.log_likelihood().unwrap(), scaled.log_likelihood().unwrap(), 1e-10);
    let a = plain.pattern_log_likelihoods().unwrap().to_vec();
    let b = scaled.pattern_log_likelihoods().unwrap().to_vec();
    for (x, y) in a.iter().zip(&b) {
        assert_close(*x, *y, 1e-10);
    }
}

#[test]
fn underflow_without_scaling_is_negative_infinity() {
    let tree = balanced_tree(256, 1e-3);
    let config = LikelihoodConfig {
        scaling: ScalingPolicy::disabled(),
        ..LikelihoodConfig::default()
    };
    let mut lik = build(tree, discordant_patterns(256, 3), RateCategories::single(), config);

    assert_eq!(lik.log_likelihood().unwrap(), f64::NEG_INFINITY);
    assert_eq!(lik.scaling_mode(), ScalingMode::Off);
}

#[test]
fn underflow_retry_switches_scaling_on() {
    let tree = balanced_tree(256, 1e-3);
    let patterns = discordant_patterns(256, 3);

    let mut reactive = build(tree.clone(), patterns.clone(), RateCategories::single(), LikelihoodConfig::default());
    let ll = reactive.log_likelihood().unwrap();
    assert!(ll.is_finite());
    assert!(ll < -745.0, "should be far below the f64 range, got {ll}");
    assert_eq!(reactive.scaling_mode(), ScalingMode::Threshold);

    let forced = LikelihoodConfig {
        scaling: ScalingPolicy::forced(),
        ..LikelihoodConfig::default()
    };
    let mut scaled = build(tree.clone(), patterns.clone(), RateCategories::single(), forced);
    assert_close(scaled.log_likelihood().unwrap(), ll, 1e-9 * ll.abs());

    let always = LikelihoodConfig {
        scaling: ScalingPolicy {
            mode: ScalingMode::Always,
            ..ScalingPolicy::default()
        },
        ..LikelihoodConfig::default()
    };
    let mut every_node = build(tree, patterns, RateCategories::single(), always);
    assert_close(every_node.log_likelihood().unwrap(), ll, 1e-9 * ll.abs());
}

// ═══════════════════════════════════════════════════════════════════
// Ambiguity
// ═══════════════════════════════════════════════════════════════════

fn site_lls(first: char) -> Vec<f64> {
    let taxa = names(&["A", "B", "C", "D"]);
    let tree = Tree::from_newick("((A:0.1,B:0.2):0.05,(C:0.3,D:0.1):0.07);", &taxa).unwrap();
    let seq_a = format!("{first}CGTA");
    let patterns = PatternSet::from_dna(taxa, &[seq_a.as_str(), "ACGTA", "CCGAA", "CTGAG"]).unwrap();
    build(tree, patterns, RateCategories::single(), LikelihoodConfig::default())
        .site_log_likelihoods()
        .unwrap()
}

#[test]
fn ambiguous_tip_marginalises_over_states() {
    let ambiguous = site_lls('N');
    let observed: Vec<Vec<f64>> = ['A', 'C', 'G', 'T'].iter().map(|&c| site_lls(c)).collect();

    let marginal: f64 = observed.iter().map(|lls| lls[0].exp()).sum::<f64>().ln();
    assert_close(ambiguous[0], marginal, 1e-10);
    for lls in &observed {
        assert!(ambiguous[0] >= lls[0]);
        // the other sites do not depend on site 0
        for site in 1..5 {
            assert_close(lls[site], ambiguous[site], 1e-12);
        }
    }
}

#[test]
fn tip_partials_match_state_codes() {
    let (tree, patterns) = simulated(12);
    let mut states = build(tree.clone(), patterns.clone(), gamma_like_rates(), LikelihoodConfig::default());
    let with_partials = LikelihoodConfig {
        use_ambiguities: true,
        ..LikelihoodConfig::default()
    };
    let mut partials = build(tree, patterns, gamma_like_rates(), with_partials);

    assert_close(states.log_likelihood().unwrap(), partials.log_likelihood().unwrap(), 1e-10);
}

#[test]
fn both_children_ambiguous_gives_ones() {
    let config = LikelihoodConfig::default();
    let mut core = LikelihoodCore::new(Dimensions::new(3, 1, 1, 4), &config).unwrap();
    core.create_tip_states(0, &[4]).unwrap();
    core.create_tip_states(1, &[7]).unwrap();
    core.create_node_partials(2).unwrap();
    core.set_matrix(0, 0, 0.3, 1.0, &jc()).unwrap();
    core.set_matrix(1, 0, 0.8, 1.0, &jc()).unwrap();

    core.compute_partials(0, 1, 2, None).unwrap();
    assert_eq!(core.partials(2).unwrap(), &[1.0; 4]);
}

#[test]
fn soft_tip_partials_are_used() {
    let taxa = names(&["A", "B"]);
    let tree = Tree::from_newick("(A:0.5,B:0.5);", &taxa).unwrap();
    let tips = vec![
        TipData::Partials(vec![0.5, 0.5, 0.0, 0.0]),
        TipData::States(vec![0]),
    ];
    let patterns = PatternSet::new(taxa, tips, vec![1.0], 4).unwrap();
    let mut lik = build(tree, patterns, RateCategories::single(), LikelihoodConfig::default());

    let e = (-4.0_f64 / 3.0).exp();
    let same = 0.25 + 0.75 * e;
    let diff = 0.25 - 0.25 * e;
    // Σ_r 0.25 (0.5 P(r→A) + 0.5 P(r→C)) P(r→A), P over a total length of 1
    let expected = (0.5 * same + 0.5 * diff) * 0.25;
    assert_close(lik.log_likelihood().unwrap(), expected.ln(), 1e-12);
}

// ═══════════════════════════════════════════════════════════════════
// Incrementality and growth
// ═══════════════════════════════════════════════════════════════════

#[test]
fn incremental_update_equals_full_recomputation() {
    let (tree, patterns) = simulated(21);
    let mut lik = build(tree.clone(), patterns.clone(), gamma_like_rates(), LikelihoodConfig::default());
    lik.log_likelihood().unwrap();
    assert_eq!(lik.last_update_count(), 7);

    lik.set_branch_length(2, 0.9).unwrap();
    let incremental = lik.log_likelihood().unwrap();
    assert_eq!(lik.last_update_count(), 3);

    let mut changed = tree;
    changed.set_branch_length(2, 0.9).unwrap();
    let mut full = build(changed, patterns, gamma_like_rates(), LikelihoodConfig::default());
    assert_close(incremental, full.log_likelihood().unwrap(), 1e-12);
}

#[test]
fn node_and_children_dirty_recomputes_locally() {
    let (tree, patterns) = simulated(22);
    let root = tree.root_index;
    let mut lik = build(tree, patterns, RateCategories::single(), LikelihoodConfig::default());
    let before = lik.log_likelihood().unwrap();

    lik.mark_node_and_children_dirty(root).unwrap();
    assert_eq!(lik.log_likelihood().unwrap().to_bits(), before.to_bits());
    assert_eq!(lik.last_update_count(), 3);
}

#[test]
fn pattern_range_update_keeps_other_patterns() {
    let (tree, patterns) = simulated(23);
    let pattern_count = patterns.pattern_count();
    let mut lik = build(tree, patterns, gamma_like_rates(), LikelihoodConfig::default());
    let before = lik.pattern_log_likelihoods().unwrap().to_vec();
    lik.store_state();

    lik.mark_patterns_dirty(1..pattern_count / 2).unwrap();
    let after = lik.pattern_log_likelihoods().unwrap().to_vec();
    assert_eq!(lik.last_update_count(), 7);
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.to_bits(), b.to_bits());
    }

    assert!(matches!(
        lik.mark_patterns_dirty(0..pattern_count + 1),
        Err(LikelihoodError::InvalidSiteRange { .. })
    ));
}

#[test]
fn site_range_pieces_equal_full_range() {
    let config = LikelihoodConfig::default();
    let dims = Dimensions::new(3, 6, 2, 4);
    let mut whole = LikelihoodCore::new(dims, &config).unwrap();
    let mut pieces = LikelihoodCore::new(dims, &config).unwrap();
    for core in [&mut whole, &mut pieces] {
        core.create_tip_states(0, &[0, 1, 2, 3, 4, 0]).unwrap();
        core.create_tip_states(1, &[0, 0, 2, 1, 3, 4]).unwrap();
        core.create_node_partials(2).unwrap();
        for node in 0..2 {
            core.set_matrix(node, 0, 0.2, 0.5, &jc()).unwrap();
            core.set_matrix(node, 1, 0.2, 1.5, &jc()).unwrap();
        }
    }

    whole.compute_partials(0, 1, 2, None).unwrap();
    pieces.compute_partials(0, 1, 2, Some(0..2)).unwrap();
    pieces.compute_partials(0, 1, 2, Some(2..6)).unwrap();
    assert_eq!(whole.partials(2).unwrap(), pieces.partials(2).unwrap());
}

#[test]
fn growth_keeps_existing_likelihood() {
    let (tree, patterns) = simulated(31);
    let mut lik = build(tree, patterns, gamma_like_rates(), LikelihoodConfig::default());
    let before = lik.log_likelihood().unwrap();
    lik.store_state();

    let first = lik.grow_storage(5);
    assert_eq!(first, 15);
    assert_eq!(lik.tree().n_nodes, 20);
    assert_eq!(lik.core().node_count(), 20);

    // detached nodes do not take part in the evaluation
    lik.set_branch_length(17, 0.4).unwrap();
    assert_eq!(lik.log_likelihood().unwrap().to_bits(), before.to_bits());
    assert_eq!(lik.last_update_count(), 0);

    lik.mark_all_dirty();
    assert_eq!(lik.log_likelihood().unwrap().to_bits(), before.to_bits());

    lik.set_branch_length(1, 0.8).unwrap();
    lik.log_likelihood().unwrap();
    lik.restore_state();
    assert_eq!(lik.log_likelihood().unwrap().to_bits(), before.to_bits());
}

// ═══════════════════════════════════════════════════════════════════
// Closed forms
// ═══════════════════════════════════════════════════════════════════

#[test]
fn three_taxon_jukes_cantor() {
    let taxa = names(&["A", "B", "C"]);
    let tree = Tree::from_newick("(A:2.0,(B:1.0,C:1.0):1.0);", &taxa).unwrap();
    let patterns = PatternSet::from_dna(taxa, &["A", "C", "C"]).unwrap();
    let mut lik = build(tree, patterns, RateCategories::single(), LikelihoodConfig::default());

    let t = |same: bool, time: f64| {
        let e = (-4.0 / 3.0 * time).exp();
        if same {
            0.25 + 0.75 * e
        } else {
            0.25 - 0.25 * e
        }
    };
    // states: A = 0, C = 1
    let mut total = 0.0;
    for r in 0..4 {
        for x in 0..4 {
            total += 0.25 * t(r == 0, 2.0) * t(r == x, 1.0) * t(x == 1, 1.0).powi(2);
        }
    }
    let expected = total.ln();
    let dominant = (0.25 * t(false, 2.0) * t(true, 1.0).powi(3)).ln();

    let ll = lik.log_likelihood().unwrap();
    assert!((ll - expected).abs() < 1e-6, "ll={ll} expected={expected}");
    assert!(expected > dominant);
}

#[test]
fn binary_gain_loss_two_tips() {
    let taxa = names(&["A", "B"]);
    let tree = Tree::from_newick("(A:1,B:1);", &taxa).unwrap();
    let patterns = PatternSet::new(
        taxa,
        vec![TipData::States(vec![1]), TipData::States(vec![1])],
        vec![1.0],
        2,
    )
    .unwrap();
    let model = BinaryGainLoss::new(1.0, 2.0).unwrap();
    let mut lik = TreeLikelihood::new(tree, patterns, model, RateCategories::single(), LikelihoodConfig::default()).unwrap();

    // π = (2/3, 1/3), e = exp(-3)
    let e = (-3.0_f64).exp();
    let p01 = (1.0 - e) / 3.0;
    let p11 = (1.0 + 2.0 * e) / 3.0;
    let expected = (2.0 / 3.0 * p01 * p01 + 1.0 / 3.0 * p11 * p11).ln();
    assert_close(lik.log_likelihood().unwrap(), expected, 1e-12);
}

// ═══════════════════════════════════════════════════════════════════
// Topologies and rate categories
// ═══════════════════════════════════════════════════════════════════

#[test]
fn multifurcation_matches_zero_length_resolution() {
    let taxa = names(&["A", "B", "C", "D"]);
    let seqs = ["ACGTTAGC", "ACGTCAGC", "ATGTCAGA", "GTGACAGA"];
    let star = Tree::from_newick("(A:0.1,B:0.2,C:0.3,D:0.15);", &taxa).unwrap();
    let binary = Tree::from_newick("(((A:0.1,B:0.2):0.0,C:0.3):0.0,D:0.15);", &taxa).unwrap();

    let patterns = PatternSet::from_dna(taxa, &seqs).unwrap();
    let mut a = build(star, patterns.clone(), gamma_like_rates(), LikelihoodConfig::default());
    let mut b = build(binary, patterns, gamma_like_rates(), LikelihoodConfig::default());

    assert_close(a.log_likelihood().unwrap(), b.log_likelihood().unwrap(), 1e-12);
    assert_eq!(a.last_update_count(), 1);
}

/// One root with `n_tips` children, and the caterpillar resolving it with
/// zero-length internal branches.
fn star_and_caterpillar(n_tips: usize, length: f64) -> (Tree, Tree) {
    let mut star_parents = vec![n_tips as i32; n_tips];
    star_parents.push(-1);
    let mut star_lengths = vec![length; n_tips];
    star_lengths.push(0.0);
    let star = Tree::from_structure(star_parents, star_lengths, n_tips).unwrap();

    let root = 2 * n_tips - 2;
    let mut parents = vec![-1i32; root + 1];
    let mut lengths = vec![0.0; root + 1];
    parents[0] = n_tips as i32;
    lengths[0] = length;
    for tip in 1..n_tips {
        parents[tip] = (n_tips + tip - 1).min(root) as i32;
        lengths[tip] = length;
    }
    for internal in n_tips..root {
        parents[internal] = (internal + 1) as i32;
    }
    let caterpillar = Tree::from_structure(parents, lengths, n_tips).unwrap();
    (star, caterpillar)
}

#[test]
fn wide_multifurcation_is_rescaled_during_the_fold() {
    let (star, caterpillar) = star_and_caterpillar(300, 1e-3);
    let patterns = discordant_patterns(300, 3);
    let always = LikelihoodConfig {
        scaling: ScalingPolicy {
            mode: ScalingMode::Always,
            ..ScalingPolicy::default()
        },
        ..LikelihoodConfig::default()
    };

    let mut resolved = build(caterpillar, patterns.clone(), RateCategories::single(), always.clone());
    let expected = resolved.log_likelihood().unwrap();
    assert!(expected.is_finite());
    assert!(expected < -745.0, "should be far below the f64 range, got {expected}");

    let mut every_step = build(star.clone(), patterns.clone(), RateCategories::single(), always);
    assert_close(every_step.log_likelihood().unwrap(), expected, 1e-9 * expected.abs());

    let mut reactive = build(star, patterns, RateCategories::single(), LikelihoodConfig::default());
    assert_close(reactive.log_likelihood().unwrap(), expected, 1e-9 * expected.abs());
    assert_eq!(reactive.scaling_mode(), ScalingMode::Threshold);
    assert_eq!(reactive.last_update_count(), 1);
}

#[test]
fn mixture_integrates_category_likelihoods() {
    let (tree, patterns) = simulated(40);
    let mixture = RateCategories::new(vec![0.5, 2.0], vec![0.3, 0.7]).unwrap();
    let mut mixed = build(tree.clone(), patterns.clone(), mixture, LikelihoodConfig::default());
    let mut slow = build(tree.clone(), patterns.clone(), RateCategories::new(vec![0.5], vec![1.0]).unwrap(), LikelihoodConfig::default());
    let mut fast = build(tree, patterns, RateCategories::new(vec![2.0], vec![1.0]).unwrap(), LikelihoodConfig::default());

    let m = mixed.pattern_log_likelihoods().unwrap().to_vec();
    let s = slow.pattern_log_likelihoods().unwrap().to_vec();
    let f = fast.pattern_log_likelihoods().unwrap().to_vec();
    for p in 0..m.len() {
        let expected = (0.3 * s[p].exp() + 0.7 * f[p].exp()).ln();
        assert_close(m[p], expected, 1e-10);
    }
}

#[test]
fn per_pattern_categories_select_one_rate() {
    let (tree, patterns) = simulated(41);
    let n = patterns.pattern_count();
    let map: Vec<usize> = (0..n).map(|p| p % 2).collect();
    let rates = RateCategories::per_pattern(vec![0.5, 2.0], map).unwrap();

    let mut mapped = build(tree.clone(), patterns.clone(), rates, LikelihoodConfig::default());
    let mut slow = build(tree.clone(), patterns.clone(), RateCategories::new(vec![0.5], vec![1.0]).unwrap(), LikelihoodConfig::default());
    let mut fast = build(tree, patterns, RateCategories::new(vec![2.0], vec![1.0]).unwrap(), LikelihoodConfig::default());

    let m = mapped.pattern_log_likelihoods().unwrap().to_vec();
    let s = slow.pattern_log_likelihoods().unwrap().to_vec();
    let f = fast.pattern_log_likelihoods().unwrap().to_vec();
    for p in 0..n {
        let expected = if p % 2 == 0 { s[p] } else { f[p] };
        assert_close(m[p], expected, 1e-12);
    }

    mapped.set_pattern_category(0, 1).unwrap();
    let moved = mapped.pattern_log_likelihoods().unwrap().to_vec();
    assert_close(moved[0], f[0], 1e-12);
    for p in 1..n {
        assert_eq!(moved[p].to_bits(), m[p].to_bits());
    }
}

#[test]
fn batch_evaluation_matches_serial() {
    let tree = eight_taxa_tree();
    let datasets: Vec<(PatternSet, F81)> = (0..6)
        .map(|seed| {
            let patterns = simulate_patterns(&tree, &jc(), &RateCategories::single(), 100, seed).unwrap();
            (patterns, jc())
        })
        .collect();

    let batch = log_likelihoods_parallel(
        &tree,
        datasets.clone(),
        &RateCategories::single(),
        &LikelihoodConfig::default(),
    );
    for ((patterns, model), result) in datasets.into_iter().zip(batch) {
        let mut lik = TreeLikelihood::new(tree.clone(), patterns, model, RateCategories::single(), LikelihoodConfig::default()).unwrap();
        assert_eq!(result.unwrap().to_bits(), lik.log_likelihood().unwrap().to_bits());
    }
}

// ═══════════════════════════════════════════════════════════════════
// Ascertainment
// ═══════════════════════════════════════════════════════════════════

// Two JC tips: a variable pattern has probability 0.25 * P(diff, d) and the
// four constant ones 0.25 * P(same, d) each, so conditioned on variability
// every variable pattern has probability 1/12 whatever the branch lengths.
#[test]
fn excluding_constant_sites_conditions_on_variability() {
    let taxa = names(&["A", "B"]);
    let tree = Tree::from_newick("(A:0.3,B:0.5);", &taxa).unwrap();
    let patterns = PatternSet::from_dna(taxa, &["AC", "GA"])
        .unwrap()
        .exclude_constant_patterns()
        .unwrap();

    let mut lik = build(tree.clone(), patterns.clone(), RateCategories::single(), LikelihoodConfig::default());
    let ll = lik.log_likelihood().unwrap();
    assert_close(ll, 2.0 * (1.0f64 / 12.0).ln(), 1e-12);

    let sites = lik.site_log_likelihoods().unwrap();
    assert_eq!(sites.len(), 2);
    assert_close(sites.iter().sum::<f64>(), ll, 1e-12);

    lik.set_branch_length(1, 2.5).unwrap();
    assert_close(lik.log_likelihood().unwrap(), ll, 1e-12);

    let forced = LikelihoodConfig {
        scaling: ScalingPolicy::forced(),
        ..LikelihoodConfig::default()
    };
    let mut scaled = build(tree, patterns, RateCategories::single(), forced);
    assert_close(scaled.log_likelihood().unwrap(), ll, 1e-12);
}

#[test]
fn included_patterns_renormalise() {
    let taxa = names(&["A", "B"]);
    let tree = Tree::from_newick("(A:0.3,B:0.5);", &taxa).unwrap();
    let patterns = PatternSet::from_dna(taxa, &["AC", "GA"]).unwrap();

    let mut plain = build(tree.clone(), patterns.clone(), RateCategories::single(), LikelihoodConfig::default());
    let raw = plain.pattern_log_likelihoods().unwrap().to_vec();
    let d: f64 = 0.8;
    let p_diff = 0.25 - 0.25 * (-4.0 / 3.0 * d).exp();
    assert_close(raw[0], (0.25 * p_diff).ln(), 1e-12);

    let included = patterns.with_ascertainment(Ascertainment::Include(vec![0, 1])).unwrap();
    let mut lik = build(tree, included, RateCategories::single(), LikelihoodConfig::default());
    for ll in lik.pattern_log_likelihoods().unwrap() {
        assert_close(*ll, 0.5f64.ln(), 1e-12);
    }
}
