//! Stratified-cluster variance via Taylor linearization.
//!
//! Both the tabulation standard errors and the regression sandwich reduce to
//! the same aggregation: sum per-observation scores into per-cluster totals,
//! then accumulate the between-cluster variability within each stratum with
//! the n_h/(n_h - 1) finite-sample factor. A stratum with a single sampled
//! cluster has no between-cluster contrast; it contributes nothing to the
//! sum and is counted so callers can flag the estimate.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::design::SurveyDesign;

pub(crate) struct VarianceEstimate {
    pub variance: f64,
    /// Strata excluded from the sum for having fewer than two clusters.
    pub strata_dropped: usize,
}

/// Variance of the weighted total of `scores` under the design.
///
/// `scores` must have one entry per design row; rows outside the domain of
/// interest carry zero.
pub(crate) fn clustered_variance(
    design: &SurveyDesign,
    scores: ArrayView1<f64>,
) -> VarianceEstimate {
    debug_assert_eq!(scores.len(), design.len());

    let n_clusters = design.n_clusters();
    let n_strata = design.n_strata();

    let mut cluster_totals = vec![0.0f64; n_clusters];
    for (row, &cluster) in design.row_cluster().iter().enumerate() {
        cluster_totals[cluster as usize] += scores[row];
    }

    let mut stratum_sums = vec![0.0f64; n_strata];
    let mut stratum_sums_sq = vec![0.0f64; n_strata];
    for (cluster, &h) in design.cluster_stratum().iter().enumerate() {
        let total = cluster_totals[cluster];
        stratum_sums[h as usize] += total;
        stratum_sums_sq[h as usize] += total * total;
    }

    let mut variance = 0.0;
    let mut strata_dropped = 0usize;
    for (h, &count) in design.stratum_cluster_counts().iter().enumerate() {
        if count < 2 {
            strata_dropped += 1;
            continue;
        }
        let n_h = f64::from(count);
        let sum = stratum_sums[h];
        // Centered sum of squares; clamp the floating-point residue.
        let ss = (stratum_sums_sq[h] - sum * sum / n_h).max(0.0);
        variance += n_h / (n_h - 1.0) * ss;
    }

    VarianceEstimate {
        variance,
        strata_dropped,
    }
}

/// Stratified-cluster sum of outer products of per-cluster score vectors,
/// centered within each stratum — the "meat" of a sandwich variance.
///
/// `scores` is row-per-observation, column-per-coefficient; rows outside the
/// fitted subset carry zero vectors.
pub(crate) fn clustered_outer_product(
    design: &SurveyDesign,
    scores: ArrayView2<f64>,
) -> (Array2<f64>, usize) {
    debug_assert_eq!(scores.nrows(), design.len());

    let p = scores.ncols();
    let n_clusters = design.n_clusters();
    let n_strata = design.n_strata();

    let mut cluster_totals = Array2::<f64>::zeros((n_clusters, p));
    for (row, &cluster) in design.row_cluster().iter().enumerate() {
        let mut target = cluster_totals.row_mut(cluster as usize);
        target += &scores.row(row);
    }

    // Group clusters by their owning stratum once, then center within each.
    let mut clusters_of: Vec<Vec<usize>> = vec![Vec::new(); n_strata];
    for (cluster, &h) in design.cluster_stratum().iter().enumerate() {
        clusters_of[h as usize].push(cluster);
    }

    let mut meat = Array2::<f64>::zeros((p, p));
    let mut strata_dropped = 0usize;
    for members in &clusters_of {
        if members.len() < 2 {
            strata_dropped += 1;
            continue;
        }
        let n_h = members.len() as f64;
        let mut mean = Array1::<f64>::zeros(p);
        for &cluster in members {
            mean += &cluster_totals.row(cluster);
        }
        mean /= n_h;

        let factor = n_h / (n_h - 1.0);
        for &cluster in members {
            let centered = &cluster_totals.row(cluster) - &mean;
            for j in 0..p {
                for k in 0..p {
                    meat[[j, k]] += factor * centered[j] * centered[k];
                }
            }
        }
    }

    (meat, strata_dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn design_2x2() -> SurveyDesign {
        SurveyDesign::new(
            &["h1", "h1", "h2", "h2"],
            &["a", "b", "c", "d"],
            &[1.0; 4],
        )
        .unwrap()
    }

    #[test]
    fn matches_hand_computed_two_strata() {
        let design = design_2x2();
        let scores = array![1.0, 3.0, 2.0, 2.0];
        // Stratum h1: totals 1 and 3, mean 2, ss = 2, factor 2 -> 4.
        // Stratum h2: totals 2 and 2, ss = 0.
        let est = clustered_variance(&design, scores.view());
        assert_abs_diff_eq!(est.variance, 4.0, epsilon = 1e-12);
        assert_eq!(est.strata_dropped, 0);
    }

    #[test]
    fn zero_scores_give_zero_variance() {
        let design = design_2x2();
        let scores = Array1::zeros(4);
        let est = clustered_variance(&design, scores.view());
        assert_abs_diff_eq!(est.variance, 0.0, epsilon = 1e-15);
    }

    #[test]
    fn single_cluster_stratum_is_dropped_and_counted() {
        let design = SurveyDesign::new(
            &["h1", "h1", "h2"],
            &["a", "b", "c"],
            &[1.0; 3],
        )
        .unwrap();
        let scores = array![1.0, 3.0, 10.0];
        let est = clustered_variance(&design, scores.view());
        // Only h1 contributes: factor 2 * ss 2 = 4.
        assert_abs_diff_eq!(est.variance, 4.0, epsilon = 1e-12);
        assert_eq!(est.strata_dropped, 1);
    }

    #[test]
    fn outer_product_matches_scalar_engine_on_one_column() {
        let design = design_2x2();
        let scores = array![1.0, 3.0, 2.0, 2.0];
        let matrix = scores.clone().insert_axis(ndarray::Axis(1));
        let (meat, dropped) = clustered_outer_product(&design, matrix.view());
        let scalar = clustered_variance(&design, scores.view());
        assert_abs_diff_eq!(meat[[0, 0]], scalar.variance, epsilon = 1e-12);
        assert_eq!(dropped, scalar.strata_dropped);
    }

    #[test]
    fn outer_product_is_symmetric() {
        let design = design_2x2();
        let scores = array![[1.0, 0.5], [3.0, -1.0], [2.0, 0.0], [2.5, 1.5]];
        let (meat, _) = clustered_outer_product(&design, scores.view());
        assert_abs_diff_eq!(meat[[0, 1]], meat[[1, 0]], epsilon = 1e-12);
    }
}
