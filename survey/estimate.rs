//! # Weighted Tabulation
//!
//! Design-consistent frequency tables for categorical variables: unweighted
//! counts, weighted percentages of the non-missing (sub)population, and
//! linearization-based standard errors from the stratified-cluster engine in
//! `variance`.
//!
//! Percentages are ratio estimates W_L / W of weighted totals, so their
//! standard errors come from the Taylor-linearized score of that ratio: each
//! in-domain observation contributes (w_i / W) * (indicator - p̂), and the
//! between-cluster variability of those scores is accumulated per stratum.
//!
//! Missing values are excluded from numerator and denominator alike — never
//! imputed. A (sub)population whose denominator is empty is an estimation
//! error, not a NaN.

use ndarray::Array1;
use thiserror::Error;

use crate::design::SurveyDesign;
use crate::variable::CategoricalVariable;
use crate::variance::{self, VarianceEstimate};

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("variable '{variable}' has {found} rows but the design has {expected}")]
    LengthMismatch {
        variable: String,
        expected: usize,
        found: usize,
    },

    #[error("no eligible observations for '{variable}' after removing missing values")]
    EmptyDomain { variable: String },

    #[error("no eligible observations for '{variable}' in group '{group}'")]
    EmptyGroup { variable: String, group: String },

    #[error("no eligible observations for level '{level}' of '{variable}'")]
    EmptyLevel { variable: String, level: String },
}

/// Normalization axis for a grouped table.
///
/// `Column` percentages sum to 100 across the variable's levels within each
/// group; `Row` percentages sum to 100 across the groups within each level
/// of the variable. The axis is always an explicit argument — it is never
/// inferred from how the table is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PercentMode {
    Column,
    Row,
}

/// One cell of a summary table. Immutable, derived, safe to discard after
/// reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedEstimate {
    pub level: String,
    pub group: Option<String>,
    /// Unweighted count of contributing observations.
    pub n_unweighted: u64,
    /// Weighted percentage of the (sub)population, on the 0–100 scale.
    pub percent: f64,
    /// Linearized standard error of `percent`.
    pub std_error: f64,
    /// True when one or more strata were excluded from the variance sum for
    /// having fewer than two sampled clusters.
    pub precision_flag: bool,
}

/// All cells from one tabulation call, in declared level/group order.
#[derive(Debug, Clone)]
pub struct SummaryTable {
    pub variable: String,
    pub group_by: Option<String>,
    pub mode: PercentMode,
    pub estimates: Vec<WeightedEstimate>,
}

/// Weighted one-way frequency table of `variable` under `design`.
pub fn summarize(
    design: &SurveyDesign,
    variable: &CategoricalVariable,
) -> Result<SummaryTable, EstimationError> {
    check_length(design, variable)?;

    let in_domain: Vec<bool> = variable.codes().iter().map(|c| c.is_some()).collect();
    if !in_domain.iter().any(|&d| d) {
        return Err(EstimationError::EmptyDomain {
            variable: variable.name().to_string(),
        });
    }

    let mut estimates = Vec::with_capacity(variable.n_levels());
    for (index, level) in variable.levels().iter().enumerate() {
        let in_level: Vec<bool> = variable
            .codes()
            .iter()
            .map(|c| *c == Some(index as u32))
            .collect();
        let cell = ratio_cell(design, &in_domain, &in_level);
        estimates.push(WeightedEstimate {
            level: level.clone(),
            group: None,
            n_unweighted: cell.n_unweighted,
            percent: cell.percent,
            std_error: cell.std_error,
            precision_flag: cell.precision_flag,
        });
    }

    log::debug!(
        "summarized '{}': {} levels over {} observed rows",
        variable.name(),
        variable.n_levels(),
        variable.n_observed()
    );

    Ok(SummaryTable {
        variable: variable.name().to_string(),
        group_by: None,
        mode: PercentMode::Column,
        estimates,
    })
}

/// Weighted cross-tabulation of `variable` by `group`.
///
/// Observations missing on either variable are excluded from every cell.
/// With `PercentMode::Column` the denominator is the group's observed
/// subpopulation; with `PercentMode::Row` it is the level's observed
/// subpopulation, so percentages for one level sum to 100 across groups.
pub fn summarize_by(
    design: &SurveyDesign,
    variable: &CategoricalVariable,
    group: &CategoricalVariable,
    mode: PercentMode,
) -> Result<SummaryTable, EstimationError> {
    check_length(design, variable)?;
    check_length(design, group)?;

    let observed: Vec<bool> = variable
        .codes()
        .iter()
        .zip(group.codes())
        .map(|(v, g)| v.is_some() && g.is_some())
        .collect();

    let mut estimates = Vec::new();
    match mode {
        PercentMode::Column => {
            for (g_index, g_level) in group.levels().iter().enumerate() {
                let in_domain: Vec<bool> = observed
                    .iter()
                    .zip(group.codes())
                    .map(|(&obs, g)| obs && *g == Some(g_index as u32))
                    .collect();
                if !in_domain.iter().any(|&d| d) {
                    return Err(EstimationError::EmptyGroup {
                        variable: variable.name().to_string(),
                        group: g_level.clone(),
                    });
                }
                for (v_index, v_level) in variable.levels().iter().enumerate() {
                    let in_level: Vec<bool> = in_domain
                        .iter()
                        .zip(variable.codes())
                        .map(|(&dom, v)| dom && *v == Some(v_index as u32))
                        .collect();
                    let cell = ratio_cell(design, &in_domain, &in_level);
                    estimates.push(WeightedEstimate {
                        level: v_level.clone(),
                        group: Some(g_level.clone()),
                        n_unweighted: cell.n_unweighted,
                        percent: cell.percent,
                        std_error: cell.std_error,
                        precision_flag: cell.precision_flag,
                    });
                }
            }
        }
        PercentMode::Row => {
            for (v_index, v_level) in variable.levels().iter().enumerate() {
                let in_domain: Vec<bool> = observed
                    .iter()
                    .zip(variable.codes())
                    .map(|(&obs, v)| obs && *v == Some(v_index as u32))
                    .collect();
                if !in_domain.iter().any(|&d| d) {
                    return Err(EstimationError::EmptyLevel {
                        variable: variable.name().to_string(),
                        level: v_level.clone(),
                    });
                }
                for (g_index, g_level) in group.levels().iter().enumerate() {
                    let in_cell: Vec<bool> = in_domain
                        .iter()
                        .zip(group.codes())
                        .map(|(&dom, g)| dom && *g == Some(g_index as u32))
                        .collect();
                    let cell = ratio_cell(design, &in_domain, &in_cell);
                    estimates.push(WeightedEstimate {
                        level: v_level.clone(),
                        group: Some(g_level.clone()),
                        n_unweighted: cell.n_unweighted,
                        percent: cell.percent,
                        std_error: cell.std_error,
                        precision_flag: cell.precision_flag,
                    });
                }
            }
        }
    }

    Ok(SummaryTable {
        variable: variable.name().to_string(),
        group_by: Some(group.name().to_string()),
        mode,
        estimates,
    })
}

struct RatioCell {
    n_unweighted: u64,
    percent: f64,
    std_error: f64,
    precision_flag: bool,
}

/// Percentage of the `in_domain` population falling in `in_numerator`, with
/// its linearized standard error. `in_numerator` must be a subset of
/// `in_domain`; callers guarantee the domain is non-empty.
fn ratio_cell(design: &SurveyDesign, in_domain: &[bool], in_numerator: &[bool]) -> RatioCell {
    let weights = design.weights();

    let mut denominator = 0.0;
    let mut numerator = 0.0;
    let mut n_unweighted = 0u64;
    for row in 0..design.len() {
        if !in_domain[row] {
            continue;
        }
        denominator += weights[row];
        if in_numerator[row] {
            numerator += weights[row];
            n_unweighted += 1;
        }
    }
    // Weights are strictly positive, so a zero denominator means an empty
    // domain; callers reject that before building cells.
    debug_assert!(denominator > 0.0);

    let proportion = numerator / denominator;

    let mut scores = Array1::<f64>::zeros(design.len());
    for row in 0..design.len() {
        if !in_domain[row] {
            continue;
        }
        let indicator = if in_numerator[row] { 1.0 } else { 0.0 };
        scores[row] = weights[row] / denominator * (indicator - proportion);
    }

    let VarianceEstimate {
        variance,
        strata_dropped,
    } = variance::clustered_variance(design, scores.view());

    RatioCell {
        n_unweighted,
        percent: 100.0 * proportion,
        std_error: 100.0 * variance.sqrt(),
        precision_flag: strata_dropped > 0,
    }
}

fn check_length(
    design: &SurveyDesign,
    variable: &CategoricalVariable,
) -> Result<(), EstimationError> {
    if variable.len() != design.len() {
        return Err(EstimationError::LengthMismatch {
            variable: variable.name().to_string(),
            expected: design.len(),
            found: variable.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn uniform_design(n: usize) -> SurveyDesign {
        // Two strata, three clusters each, rows dealt round-robin.
        let strata: Vec<String> = (0..n).map(|i| format!("h{}", i % 2 + 1)).collect();
        let clusters: Vec<String> = (0..n).map(|i| format!("c{}", i % 6 + 1)).collect();
        let weights = vec![1.0; n];
        SurveyDesign::new(&strata, &clusters, &weights).unwrap()
    }

    fn binary(name: &str, codes: Vec<Option<u32>>) -> CategoricalVariable {
        CategoricalVariable::new(
            name,
            vec!["Yes".to_string(), "No".to_string()],
            codes,
        )
        .unwrap()
    }

    #[test]
    fn percentages_sum_to_one_hundred() {
        let design = uniform_design(12);
        let codes = (0..12).map(|i| Some(u32::from(i % 3 == 0))).collect();
        let variable = binary("flag", codes);
        let table = summarize(&design, &variable).unwrap();
        let total: f64 = table.estimates.iter().map(|e| e.percent).sum();
        assert_abs_diff_eq!(total, 100.0, epsilon = 1e-9);
    }

    #[test]
    fn unweighted_counts_cover_non_missing_rows() {
        let design = uniform_design(10);
        let codes = vec![
            Some(0),
            Some(1),
            None,
            Some(0),
            Some(0),
            None,
            Some(1),
            Some(1),
            Some(0),
            None,
        ];
        let variable = binary("flag", codes);
        let table = summarize(&design, &variable).unwrap();
        let n_total: u64 = table.estimates.iter().map(|e| e.n_unweighted).sum();
        assert_eq!(n_total as usize, variable.n_observed());
    }

    #[test]
    fn missing_rows_shift_the_denominator() {
        let design = uniform_design(8);
        // 4 Yes, 2 No, 2 missing: 66.67% Yes of the observed population.
        let codes = vec![
            Some(0),
            Some(0),
            Some(0),
            Some(0),
            Some(1),
            Some(1),
            None,
            None,
        ];
        let variable = binary("flag", codes);
        let table = summarize(&design, &variable).unwrap();
        assert_abs_diff_eq!(table.estimates[0].percent, 200.0 / 3.0, epsilon = 1e-9);
        assert_eq!(table.estimates[0].n_unweighted, 4);
    }

    #[test]
    fn all_missing_variable_is_an_estimation_error() {
        let design = uniform_design(6);
        let variable = binary("flag", vec![None; 6]);
        let err = summarize(&design, &variable).unwrap_err();
        assert!(matches!(err, EstimationError::EmptyDomain { .. }));
    }

    #[test]
    fn empty_group_level_is_an_estimation_error() {
        let design = uniform_design(6);
        let variable = binary("flag", vec![Some(0), Some(1), Some(0), Some(1), Some(0), Some(1)]);
        // Group declares a level that never occurs.
        let group = CategoricalVariable::new(
            "region",
            vec!["North".to_string(), "South".to_string()],
            vec![Some(0); 6],
        )
        .unwrap();
        let err = summarize_by(&design, &variable, &group, PercentMode::Column).unwrap_err();
        assert!(matches!(
            err,
            EstimationError::EmptyGroup { group, .. } if group == "South"
        ));
    }

    #[test]
    fn row_mode_sums_to_one_hundred_across_groups() {
        let design = uniform_design(12);
        let variable = binary("flag", (0..12).map(|i| Some(u32::from(i % 2 == 0))).collect());
        let group = CategoricalVariable::new(
            "region",
            vec!["North".to_string(), "South".to_string()],
            (0..12).map(|i| Some(u32::from(i < 7))).collect(),
        )
        .unwrap();
        let table = summarize_by(&design, &variable, &group, PercentMode::Row).unwrap();
        for level in variable.levels() {
            let row_total: f64 = table
                .estimates
                .iter()
                .filter(|e| &e.level == level)
                .map(|e| e.percent)
                .sum();
            assert_abs_diff_eq!(row_total, 100.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn column_mode_sums_to_one_hundred_within_groups() {
        let design = uniform_design(12);
        let variable = binary("flag", (0..12).map(|i| Some(u32::from(i % 3 == 0))).collect());
        let group = CategoricalVariable::new(
            "region",
            vec!["North".to_string(), "South".to_string()],
            (0..12).map(|i| Some(u32::from(i < 5))).collect(),
        )
        .unwrap();
        let table = summarize_by(&design, &variable, &group, PercentMode::Column).unwrap();
        for g_level in group.levels() {
            let column_total: f64 = table
                .estimates
                .iter()
                .filter(|e| e.group.as_deref() == Some(g_level.as_str()))
                .map(|e| e.percent)
                .sum();
            assert_abs_diff_eq!(column_total, 100.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn summarize_is_deterministic() {
        let design = uniform_design(12);
        let variable = binary("flag", (0..12).map(|i| Some(u32::from(i % 3 == 0))).collect());
        let first = summarize(&design, &variable).unwrap();
        let second = summarize(&design, &variable).unwrap();
        assert_eq!(first.estimates, second.estimates);
    }

    #[test]
    fn single_cluster_stratum_sets_the_precision_flag() {
        let design = SurveyDesign::new(
            &["h1", "h1", "h1", "h1", "h2"],
            &["a", "a", "b", "b", "c"],
            &[1.0; 5],
        )
        .unwrap();
        let variable = binary(
            "flag",
            vec![Some(0), Some(1), Some(0), Some(1), Some(0)],
        );
        let table = summarize(&design, &variable).unwrap();
        assert!(table.estimates.iter().all(|e| e.precision_flag));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let design = uniform_design(6);
        let variable = binary("flag", vec![Some(0); 5]);
        let err = summarize(&design, &variable).unwrap_err();
        assert!(matches!(err, EstimationError::LengthMismatch { .. }));
    }
}
