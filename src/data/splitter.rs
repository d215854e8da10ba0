// ============================================================
// Layer 4 — Subject-Level Train/Validation/Test Splitter
// ============================================================
// Shuffles SUBJECTS (never windows) and cuts them into three
// folds, so no subject's windows can appear in more than one
// fold.
//
// The split is stratified by source dataset: each source is
// shuffled and cut on its own, so a multi-dataset experiment
// draws train, validation and test subjects from every study.
//
// Determinism:
//   - subjects are sorted before shuffling, so the input order
//     does not matter
//   - the RNG is ChaCha8 seeded from the experiment seed, with
//     one independent stream per source; adding a source never
//     changes the split of another
//   - fold sizes use largest-remainder rounding of the ratio
//     weights; a fold with weight 0 always gets 0 subjects
//
// Uses Fisher-Yates shuffle via rand::seq::SliceRandom.
//
// Reference: Rust Book §8 (Vectors)
//            rand / rand_chacha crate documentation

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;

use crate::domain::fold::{Fold, FoldAssignment, FoldRatios};
use crate::domain::subject::{SourceDataset, SubjectKey};

/// Number of subjects per fold for `n` subjects, in `Fold::ALL` order.
pub fn fold_sizes(n: usize, ratios: &FoldRatios) -> [usize; 3] {
    let total = ratios.total();
    if n == 0 || !ratios.is_valid() {
        return [0; 3];
    }

    let quotas: Vec<f64> = Fold::ALL
        .iter()
        .map(|f| n as f64 * ratios.weight(*f) / total)
        .collect();
    let mut sizes = [0usize; 3];
    for (slot, q) in quotas.iter().enumerate() {
        sizes[slot] = q.floor() as usize;
    }

    // Hand the leftover subjects to the largest fractional parts;
    // ties go to the earlier fold.
    let mut order: Vec<usize> = (0..3).filter(|&s| quotas[s] > 0.0).collect();
    order.sort_by(|&a, &b| {
        let fa = quotas[a] - quotas[a].floor();
        let fb = quotas[b] - quotas[b].floor();
        fb.total_cmp(&fa).then(a.cmp(&b))
    });
    let mut leftover = n - sizes.iter().sum::<usize>();
    for slot in order.into_iter().cycle() {
        if leftover == 0 {
            break;
        }
        sizes[slot] += 1;
        leftover -= 1;
    }
    sizes
}

/// Deterministically assign every subject to one fold.
///
/// Same `subjects` (in any order), `ratios` and `seed` always give the
/// same assignment.
pub fn build_index(subjects: &[SubjectKey], ratios: FoldRatios, seed: u64) -> FoldAssignment {
    let mut by_source: BTreeMap<SourceDataset, Vec<SubjectKey>> = BTreeMap::new();
    for key in subjects {
        by_source.entry(key.source).or_default().push(key.clone());
    }

    let mut pairs = Vec::with_capacity(subjects.len());
    for (source, mut keys) in by_source {
        keys.sort();
        keys.dedup();

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(source.stream_id());
        keys.shuffle(&mut rng);

        let [n_train, n_val, _] = fold_sizes(keys.len(), &ratios);
        for (i, key) in keys.into_iter().enumerate() {
            let fold = if i < n_train {
                Fold::Train
            } else if i < n_train + n_val {
                Fold::Validation
            } else {
                Fold::Test
            };
            pairs.push((key, fold));
        }
    }

    let assignment = FoldAssignment::new(seed, ratios, pairs);
    tracing::debug!(
        "Subject split (seed {}): {} train, {} validation, {} test",
        seed,
        assignment.count(Fold::Train),
        assignment.count(Fold::Validation),
        assignment.count(Fold::Test),
    );
    assignment
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn subjects(source: SourceDataset, n: usize) -> Vec<SubjectKey> {
        (0..n).map(|i| SubjectKey::new(source, format!("{i:03}"))).collect()
    }

    #[test]
    fn test_fold_sizes_largest_remainder() {
        let r = FoldRatios::default();
        assert_eq!(fold_sizes(100, &r), [70, 15, 15]);
        assert_eq!(fold_sizes(10, &r), [7, 2, 1]);
        assert_eq!(fold_sizes(0, &r), [0, 0, 0]);
        assert_eq!(fold_sizes(2, &FoldRatios::new(1.0, 1.0, 0.0)), [1, 1, 0]);
        assert_eq!(fold_sizes(5, &FoldRatios::new(1.0, 0.0, 0.0)), [5, 0, 0]);
    }

    #[test]
    fn test_sizes_always_sum_to_n() {
        let r = FoldRatios::new(0.33, 0.33, 0.34);
        for n in 0..50 {
            assert_eq!(fold_sizes(n, &r).iter().sum::<usize>(), n);
        }
    }

    #[test]
    fn test_deterministic_and_order_independent() {
        let s     = subjects(SourceDataset::Shhs, 40);
        let mut r = s.clone();
        r.reverse();
        let a = build_index(&s, FoldRatios::default(), 42);
        let b = build_index(&r, FoldRatios::default(), 42);
        assert_eq!(a, b);
    }

    #[test]
    fn test_seed_changes_assignment() {
        let s = subjects(SourceDataset::Shhs, 40);
        let a = build_index(&s, FoldRatios::default(), 1);
        let b = build_index(&s, FoldRatios::default(), 2);
        assert_ne!(a.entries(), b.entries());
    }

    #[test]
    fn test_no_leakage() {
        let mut s = subjects(SourceDataset::Mass, 23);
        s.extend(subjects(SourceDataset::Hmc, 11));
        let a = build_index(&s, FoldRatios::default(), 9);

        let mut seen = HashSet::new();
        for fold in Fold::ALL {
            for key in a.subjects(fold) {
                assert!(seen.insert(key.clone()), "{key} assigned twice");
            }
        }
        assert_eq!(seen.len(), s.len());
    }

    #[test]
    fn test_stratified_per_source() {
        let mut s = subjects(SourceDataset::Dcsm, 20);
        s.extend(subjects(SourceDataset::Isruc, 20));
        let a = build_index(&s, FoldRatios::default(), 3);
        for source in [SourceDataset::Dcsm, SourceDataset::Isruc] {
            let train = a.subjects(Fold::Train).filter(|k| k.source == source).count();
            assert_eq!(train, 14);
        }
    }

    #[test]
    fn test_adding_a_source_keeps_other_split() {
        let dcsm = subjects(SourceDataset::Dcsm, 12);
        let a    = build_index(&dcsm, FoldRatios::default(), 5);
        let mut both = dcsm.clone();
        both.extend(subjects(SourceDataset::Svuh, 8));
        let b = build_index(&both, FoldRatios::default(), 5);
        for key in &dcsm {
            assert_eq!(a.fold_of(key), b.fold_of(key));
        }
    }
}
