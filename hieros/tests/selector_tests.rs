// tests/selector_tests.rs
//
// Selector bookkeeping under random insert / remove / sample sequences.
//
// These tests verify:
// - keys, indices and key_counts stay the same length
// - keys[indices[key]] == key after every mutation
// - the efficient and naive time-balanced selectors draw the same keys

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use hieros::replay::{build_selector, Selector, SelectorKind, TrajectoryKey};

const KINDS: [SelectorKind; 4] = [
    SelectorKind::Uniform,
    SelectorKind::TimeBalanced,
    SelectorKind::TimeBalancedNaive,
    SelectorKind::EfficientTimeBalanced,
];

fn assert_index_map(selector: &dyn Selector, live: &[TrajectoryKey]) {
    let table = selector.table();
    assert_eq!(table.len(), live.len());
    assert_eq!(table.keys().len(), table.key_counts().len());
    for key in live {
        let pos = table.position(*key).expect("live key indexed");
        assert_eq!(table.keys()[pos], *key);
    }
    selector.check_consistency().unwrap();
}

#[test]
fn test_random_mutations_keep_invariant() {
    for kind in KINDS {
        let mut selector = build_selector(kind, 1.5, 42).unwrap();
        let mut ops = ChaCha8Rng::seed_from_u64(9);
        let mut live: Vec<TrajectoryKey> = Vec::new();
        let mut next = 0u64;

        for _ in 0..400 {
            match ops.gen_range(0..3) {
                0 | 1 if live.len() < 40 => {
                    let key = TrajectoryKey(next);
                    next += 1;
                    selector.insert(key).unwrap();
                    live.push(key);
                }
                _ if !live.is_empty() => {
                    let i = ops.gen_range(0..live.len());
                    let key = live.remove(i);
                    selector.remove(key).unwrap();
                    assert!(selector.table().position(key).is_none());
                }
                _ => {}
            }
            if !live.is_empty() {
                let drawn = selector.sample().expect("non-empty selector samples");
                assert!(live.contains(&drawn), "{kind:?} drew a removed key");
            }
            assert_index_map(selector.as_ref(), &live);
        }
    }
}

#[test]
fn test_duplicate_insert_and_unknown_remove_rejected() {
    for kind in KINDS {
        let mut selector = build_selector(kind, 1.0, 0).unwrap();
        selector.insert(TrajectoryKey(1)).unwrap();
        assert!(selector.insert(TrajectoryKey(1)).is_err());
        assert!(selector.remove(TrajectoryKey(2)).is_err());
        assert_index_map(selector.as_ref(), &[TrajectoryKey(1)]);
    }
}

#[test]
fn test_empty_selector_samples_nothing() {
    for kind in KINDS {
        let mut selector = build_selector(kind, 1.0, 0).unwrap();
        assert!(selector.sample().is_none());
    }
}

#[test]
fn test_efficient_matches_naive_draws() {
    let mut naive = build_selector(SelectorKind::TimeBalancedNaive, 2.0, 5).unwrap();
    let mut efficient = build_selector(SelectorKind::EfficientTimeBalanced, 2.0, 5).unwrap();
    for k in 0..12 {
        naive.insert(TrajectoryKey(k)).unwrap();
        efficient.insert(TrajectoryKey(k)).unwrap();
    }
    for _ in 0..200 {
        assert_eq!(naive.sample(), efficient.sample());
    }
}

#[test]
fn test_time_balanced_spreads_draws() {
    let mut selector = build_selector(SelectorKind::EfficientTimeBalanced, 1.5, 3).unwrap();
    for k in 0..8 {
        selector.insert(TrajectoryKey(k)).unwrap();
    }
    for _ in 0..800 {
        selector.sample();
    }
    let counts = selector.table().key_counts();
    assert_eq!(counts.iter().sum::<u64>(), 800);
    // Undersampled keys are favoured, so no key is starved.
    assert!(counts.iter().all(|c| *c > 20), "{counts:?}");
}
