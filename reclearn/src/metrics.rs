//! Ranking metrics.
//!
//! All functions work on a single user, rankings are lists of item ids with
//! the best item first and relevant items are given as a sorted list.
use std::{cmp::Ordering, convert::TryFrom};

use displaydoc::Display;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ItemId;

/// Discount used for the discounted cumulative gain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DcgMethod {
    /// `r₁ + Σ_{i≥2} rᵢ / log₂(i)`, the first position is not discounted.
    First,
    /// `Σ rᵢ / log₂(i + 1)`.
    Log2,
}

impl Default for DcgMethod {
    fn default() -> Self {
        DcgMethod::First
    }
}

/// Unknown dcg method {0}, expected 0 or 1
#[derive(Debug, Display, Error, PartialEq)]
pub struct UnknownDcgMethod(pub u8);

impl TryFrom<u8> for DcgMethod {
    type Error = UnknownDcgMethod;

    fn try_from(method: u8) -> Result<Self, Self::Error> {
        match method {
            0 => Ok(DcgMethod::First),
            1 => Ok(DcgMethod::Log2),
            other => Err(UnknownDcgMethod(other)),
        }
    }
}

/// Discounted cumulative gain of the first `k` relevances.
pub fn dcg_at_k(relevances: &[f32], k: usize, method: DcgMethod) -> f32 {
    relevances
        .iter()
        .take(k)
        .enumerate()
        .map(|(idx, &relevance)| {
            let position = (idx + 1) as f32;
            match method {
                DcgMethod::First if idx == 0 => relevance,
                DcgMethod::First => relevance / position.log2(),
                DcgMethod::Log2 => relevance / (position + 1.).log2(),
            }
        })
        .sum()
}

/// Returns the (at most) `k` best scored items which are not excluded.
///
/// `excluded` must be sorted. Ties are broken by the smaller item id and
/// NaN scores rank last.
pub fn top_k_unseen(scores: ArrayView1<f32>, k: usize, excluded: &[ItemId]) -> Vec<ItemId> {
    let mut candidates = scores
        .indexed_iter()
        .filter(|(item, _)| excluded.binary_search(item).is_err())
        .map(|(item, &score)| (item, score))
        .collect::<Vec<_>>();

    let by_score = |a: &(ItemId, f32), b: &(ItemId, f32)| {
        descending_nan_last(a.1, b.1).then_with(|| a.0.cmp(&b.0))
    };
    if k == 0 {
        return Vec::new();
    }
    if candidates.len() > k {
        candidates.select_nth_unstable_by(k - 1, by_score);
        candidates.truncate(k);
    }
    candidates.sort_unstable_by(by_score);

    candidates.into_iter().map(|(item, _)| item).collect()
}

fn descending_nan_last(a: f32, b: f32) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}

fn hits(top: &[ItemId], relevant: &[ItemId]) -> usize {
    top.iter()
        .filter(|&item| relevant.binary_search(item).is_ok())
        .count()
}

/// Fraction of the relevant items which are in `top`.
///
/// Is `0` if there are no relevant items.
pub fn recall_at_k(top: &[ItemId], relevant: &[ItemId]) -> f32 {
    if relevant.is_empty() {
        return 0.;
    }
    hits(top, relevant) as f32 / relevant.len() as f32
}

/// Fraction of the `k` recommendation slots filled with relevant items.
///
/// Divides by `k` even if `top` is shorter.
pub fn precision_at_k(top: &[ItemId], relevant: &[ItemId], k: usize) -> f32 {
    if k == 0 {
        return 0.;
    }
    hits(&top[..k.min(top.len())], relevant) as f32 / k as f32
}

/// Normalized discounted cumulative gain with binary relevance.
///
/// The ideal ranking places `min(|relevant|, k)` relevant items first.
/// Is `0` if there are no relevant items.
pub fn ndcg_at_k(top: &[ItemId], relevant: &[ItemId], k: usize, method: DcgMethod) -> f32 {
    let ideal = vec![1.; relevant.len().min(k)];
    let ideal_dcg = dcg_at_k(&ideal, k, method);
    if ideal_dcg == 0. {
        return 0.;
    }

    let relevances = top
        .iter()
        .take(k)
        .map(|item| {
            if relevant.binary_search(item).is_ok() {
                1.
            } else {
                0.
            }
        })
        .collect::<Vec<f32>>();
    dcg_at_k(&relevances, k, method) / ideal_dcg
}

/// Area under the ROC curve.
///
/// Computed with the Mann-Whitney rank statistic where tied scores share
/// their average rank. `NaN` scores rank below all other scores. Returns
/// `None` if `labels` contains only one class.
///
/// # Panics
///
/// If `scores` and `labels` have different lengths.
pub fn roc_auc(scores: &[f32], labels: &[bool]) -> Option<f32> {
    assert_eq!(scores.len(), labels.len());
    let nr_positives = labels.iter().filter(|&&label| label).count();
    let nr_negatives = labels.len() - nr_positives;
    if nr_positives == 0 || nr_negatives == 0 {
        return None;
    }

    let mut order = (0..scores.len()).collect::<Vec<_>>();
    // ascending, `NaN` scores rank lowest and tie with each other
    let ascending = |a: f32, b: f32| descending_nan_last(b, a);
    order.sort_unstable_by(|&a, &b| ascending(scores[a], scores[b]));

    let mut positive_rank_sum = 0f64;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len()
            && ascending(scores[order[end]], scores[order[start]]) == Ordering::Equal
        {
            end += 1;
        }
        // ranks are 1-based, the group covers ranks start+1..=end
        let average_rank = (start + end + 1) as f64 / 2.;
        let positives_in_group = order[start..end].iter().filter(|&&idx| labels[idx]).count();
        positive_rank_sum += average_rank * positives_in_group as f64;
        start = end;
    }

    let nr_positives = nr_positives as f64;
    let u = positive_rank_sum - nr_positives * (nr_positives + 1.) / 2.;
    Some((u / (nr_positives * nr_negatives as f64)) as f32)
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;
    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
    use rstest::rstest;
    use test_utils::assert_approx_eq;

    use super::*;

    #[rstest]
    #[case(DcgMethod::First, 3. + 2. + 3. / 3f32.log2())]
    #[case(DcgMethod::Log2, 3. + 2. / 3f32.log2() + 3. / 2.)]
    fn test_dcg_at_k(#[case] method: DcgMethod, #[case] expected: f32) {
        assert_approx_eq!(f32, dcg_at_k(&[3., 2., 3., 0., 1.], 3, method), expected);
    }

    #[test]
    fn test_dcg_of_empty_relevances_is_zero() {
        assert_approx_eq!(f32, dcg_at_k(&[], 5, DcgMethod::First), 0.);
        assert_approx_eq!(f32, dcg_at_k(&[1., 2.], 0, DcgMethod::Log2), 0.);
    }

    #[test]
    fn test_dcg_method_from_number() {
        assert_eq!(DcgMethod::try_from(0), Ok(DcgMethod::First));
        assert_eq!(DcgMethod::try_from(1), Ok(DcgMethod::Log2));
        assert_eq!(DcgMethod::try_from(2), Err(UnknownDcgMethod(2)));
    }

    #[test]
    fn test_top_k_skips_excluded_items() {
        let scores = arr1(&[0.5f32, 0.9, -1., 0.7, 0.9, f32::NAN]);
        assert_eq!(top_k_unseen(scores.view(), 3, &[]), vec![1, 4, 3]);
        assert_eq!(top_k_unseen(scores.view(), 3, &[1, 3]), vec![4, 0, 2]);
        assert_eq!(top_k_unseen(scores.view(), 10, &[0, 1, 2, 3]), vec![4, 5]);
        assert!(top_k_unseen(scores.view(), 0, &[]).is_empty());
    }

    #[test]
    fn test_recall_and_precision() {
        let top = [4, 2, 9, 1];
        assert_approx_eq!(f32, recall_at_k(&top, &[1, 3, 4]), 2. / 3.);
        assert_approx_eq!(f32, precision_at_k(&top, &[1, 3, 4], 4), 0.5);
        // only the first k slots count, but short rankings still divide by k
        assert_approx_eq!(f32, precision_at_k(&top, &[1, 3, 4], 2), 0.5);
        assert_approx_eq!(f32, precision_at_k(&top[..1], &[4], 5), 0.2);
        assert_approx_eq!(f32, recall_at_k(&top, &[]), 0.);
    }

    #[test]
    fn test_ndcg_at_k() {
        assert_approx_eq!(f32, ndcg_at_k(&[1, 2, 3], &[1, 2], 3, DcgMethod::First), 1.);
        assert_approx_eq!(f32, ndcg_at_k(&[5, 6], &[1], 2, DcgMethod::First), 0.);
        assert_approx_eq!(f32, ndcg_at_k(&[5, 6], &[], 2, DcgMethod::First), 0.);

        let expected = (1. / 3f32.log2()) / (1. + 1. / 3f32.log2());
        assert_approx_eq!(f32, ndcg_at_k(&[7, 1, 8], &[1, 2], 3, DcgMethod::Log2), expected);
    }

    #[test]
    fn test_roc_auc() {
        assert_approx_eq!(
            f32,
            roc_auc(&[0.1, 0.4, 0.35, 0.8], &[false, false, true, true]).unwrap(),
            0.75
        );
        assert_approx_eq!(f32, roc_auc(&[0.9, 0.1], &[true, false]).unwrap(), 1.);
        assert_approx_eq!(f32, roc_auc(&[0.9, 0.1], &[false, true]).unwrap(), 0.);
    }

    #[test]
    fn test_roc_auc_with_ties() {
        assert_approx_eq!(f32, roc_auc(&[0.5; 4], &[true, false, false, true]).unwrap(), 0.5);
        assert_approx_eq!(
            f32,
            roc_auc(&[0., 0.5, 0.5, 1.], &[false, false, true, true]).unwrap(),
            0.875
        );
    }

    #[test]
    fn test_roc_auc_ranks_nan_lowest() {
        let nan = f32::NAN;
        assert_approx_eq!(
            f32,
            roc_auc(&[nan, 0.9, 0.1, 0.5], &[false, true, false, true]).unwrap(),
            1.
        );
        assert_approx_eq!(
            f32,
            roc_auc(&[0.5, 0.1, nan, 0.9], &[true, false, false, true]).unwrap(),
            1.
        );
        assert_approx_eq!(f32, roc_auc(&[nan, 0.2], &[true, false]).unwrap(), 0.);
        assert_approx_eq!(f32, roc_auc(&[nan, nan], &[true, false]).unwrap(), 0.5);
    }

    #[test]
    fn test_roc_auc_with_nan_is_independent_of_order() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut pairs = (0..300)
            .map(|i| {
                let score = if i % 3 == 0 { f32::NAN } else { rng.gen::<f32>() };
                (score, rng.gen::<bool>())
            })
            .collect::<Vec<_>>();
        let auc = |pairs: &[(f32, bool)]| {
            let (scores, labels): (Vec<f32>, Vec<bool>) = pairs.iter().copied().unzip();
            roc_auc(&scores, &labels).unwrap()
        };

        let expected = auc(&pairs);
        for _ in 0..20 {
            pairs.shuffle(&mut rng);
            assert_approx_eq!(f32, auc(&pairs), expected, ulps = 4);
        }
    }

    #[test]
    fn test_roc_auc_needs_both_classes() {
        assert!(roc_auc(&[0.1, 0.2], &[true, true]).is_none());
        assert!(roc_auc(&[0.1, 0.2], &[false, false]).is_none());
        assert!(roc_auc(&[], &[]).is_none());
    }
}
