//! # Weighted Logistic Regression
//!
//! Pseudo-maximum-likelihood fit of a binomial model with a logit link,
//! where each observation's contribution to the score and information is
//! scaled by its survey weight. Coefficients come from iteratively
//! reweighted least squares; variance comes from a sandwich estimator whose
//! "bread" is the inverse weighted Fisher information at convergence and
//! whose "meat" is the stratified-cluster aggregation of per-cluster score
//! sums — the same engine the tabulation standard errors use.
//!
//! Wald tests use a Student-t reference with design degrees of freedom
//! (clusters minus strata). A fit that fails to converge, or that runs away
//! toward an unbounded linear predictor (perfect separation), is an error;
//! no partial coefficients are ever returned.

use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::{Inverse, Solve};
use statrs::distribution::{ContinuousCDF, StudentsT};
use thiserror::Error;

use crate::design::{DesignError, SurveyDesign};
use crate::variable::{CategoricalVariable, NumericVariable};
use crate::variance;

const PROB_EPS: f64 = 1e-8;
const MIN_MU_VARIANCE: f64 = 1e-10;
/// |eta| beyond this puts mu within ~1e-13 of 0 or 1; the likelihood has no
/// finite maximizer and the iterates are running away.
const MAX_STABLE_ETA: f64 = 30.0;

#[derive(Error, Debug)]
pub enum ConvergenceError {
    #[error(
        "IRLS did not converge within {max_iterations} iterations; last deviance change was {last_change:.6e}"
    )]
    MaxIterationsReached {
        max_iterations: usize,
        last_change: f64,
    },

    #[error(
        "IRLS became unstable at iteration {iteration} (|linear predictor| reached {max_abs_eta:.1}); the outcome may be perfectly separated"
    )]
    Unstable { iteration: usize, max_abs_eta: f64 },
}

#[derive(Error, Debug)]
pub enum FitError {
    #[error(transparent)]
    Design(#[from] DesignError),

    #[error(transparent)]
    Convergence(#[from] ConvergenceError),

    #[error("outcome '{variable}' must have exactly two levels; it declares {found}")]
    NonBinaryOutcome { variable: String, found: usize },

    #[error("'{level}' is not a declared level of '{variable}'")]
    UnknownReferenceLevel { variable: String, level: String },

    #[error("variable '{variable}' has {found} rows but the design has {expected}")]
    LengthMismatch {
        variable: String,
        expected: usize,
        found: usize,
    },

    #[error("no complete cases remain for outcome '{outcome}' after removing missing values")]
    NoCompleteCases { outcome: String },

    #[error("weighted least squares solve failed; the model may be collinear: {0}")]
    LinearSystemSolveFailed(#[from] ndarray_linalg::error::LinalgError),
}

/// One predictor term of the model.
///
/// A categorical term expands into one indicator column per non-reference
/// level, in declared level order. The reference defaults to the first
/// declared level.
#[derive(Debug, Clone, Copy)]
pub enum ModelTerm<'a> {
    Categorical {
        variable: &'a CategoricalVariable,
        reference: Option<&'a str>,
    },
    Numeric(&'a NumericVariable),
}

#[derive(Debug, Clone)]
pub struct LogisticConfig {
    pub convergence_tolerance: f64,
    pub max_iterations: usize,
}

impl Default for LogisticConfig {
    fn default() -> Self {
        Self {
            convergence_tolerance: 1e-8,
            max_iterations: 25,
        }
    }
}

/// One fitted coefficient: log-odds estimate, robust standard error, odds
/// ratio, and two-sided Wald p-value.
#[derive(Debug, Clone)]
pub struct CoefficientEstimate {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
    pub odds_ratio: f64,
    pub p_value: f64,
}

/// Immutable result of a converged fit.
#[derive(Debug, Clone)]
pub struct RegressionFit {
    pub terms: Vec<CoefficientEstimate>,
    /// Design degrees of freedom (clusters minus strata) behind the Wald
    /// reference distribution.
    pub df: f64,
    /// Complete cases contributing to the fit.
    pub n_used: usize,
    pub iterations: usize,
    pub log_likelihood: f64,
    /// True when one or more strata were excluded from the sandwich "meat"
    /// for having fewer than two sampled clusters.
    pub precision_flag: bool,
}

/// Fits `outcome ~ predictors` under the design.
///
/// `outcome_reference` selects the level coded 0; it defaults to the first
/// declared level, so the fitted log-odds are for the other level.
/// Observations missing on the outcome or any predictor are excluded from
/// this model only (complete-case analysis per model, not per dataset).
pub fn fit(
    design: &SurveyDesign,
    outcome: &CategoricalVariable,
    outcome_reference: Option<&str>,
    predictors: &[ModelTerm<'_>],
    config: &LogisticConfig,
) -> Result<RegressionFit, FitError> {
    design.require_replication()?;
    let df = design.degrees_of_freedom() as f64;

    if outcome.n_levels() != 2 {
        return Err(FitError::NonBinaryOutcome {
            variable: outcome.name().to_string(),
            found: outcome.n_levels(),
        });
    }
    check_length(design, outcome.name(), outcome.len())?;

    let reference_index = resolve_reference(outcome, outcome_reference)?;
    let success_index = 1 - reference_index;

    // Resolve predictor layout up front: names, column count, and each
    // term's reference level.
    let mut columns: Vec<ColumnSpec<'_>> = vec![ColumnSpec::Intercept];
    let mut names: Vec<String> = vec!["intercept".to_string()];
    for term in predictors {
        match *term {
            ModelTerm::Categorical {
                variable,
                reference,
            } => {
                check_length(design, variable.name(), variable.len())?;
                let term_reference = resolve_reference(variable, reference)?;
                for (index, level) in variable.levels().iter().enumerate() {
                    if index as u32 == term_reference {
                        continue;
                    }
                    columns.push(ColumnSpec::Indicator {
                        variable,
                        level: index as u32,
                    });
                    names.push(format!("{}={}", variable.name(), level));
                }
            }
            ModelTerm::Numeric(variable) => {
                check_length(design, variable.name(), variable.len())?;
                columns.push(ColumnSpec::Value(variable));
                names.push(variable.name().to_string());
            }
        }
    }

    // Complete cases: outcome and every predictor observed.
    let complete: Vec<usize> = (0..design.len())
        .filter(|&row| {
            outcome.codes()[row].is_some()
                && predictors.iter().all(|term| match term {
                    ModelTerm::Categorical { variable, .. } => variable.codes()[row].is_some(),
                    ModelTerm::Numeric(variable) => variable.values()[row].is_some(),
                })
        })
        .collect();
    let n_used = complete.len();
    if n_used == 0 {
        return Err(FitError::NoCompleteCases {
            outcome: outcome.name().to_string(),
        });
    }

    let p = columns.len();
    let mut x = Array2::<f64>::zeros((n_used, p));
    let mut y = Array1::<f64>::zeros(n_used);
    let mut w = Array1::<f64>::zeros(n_used);
    for (i, &row) in complete.iter().enumerate() {
        y[i] = if outcome.codes()[row] == Some(success_index) {
            1.0
        } else {
            0.0
        };
        w[i] = design.weights()[row];
        for (j, spec) in columns.iter().enumerate() {
            x[[i, j]] = spec.value(row);
        }
    }

    log::debug!(
        "fitting '{}' on {} complete cases, {} coefficients",
        outcome.name(),
        n_used,
        p
    );

    let converged = irls(&x, &y, &w, config)?;

    // Sandwich variance. Bread: inverse weighted Fisher information at the
    // converged estimate. Meat: stratified-cluster outer products of the
    // per-observation scores w_i (y_i - mu_i) x_i, scattered back onto the
    // full design so cluster membership is respected.
    let bread = converged.information.inv()?;

    let mut scores = Array2::<f64>::zeros((design.len(), p));
    for (i, &row) in complete.iter().enumerate() {
        let residual = w[i] * (y[i] - converged.mu[i]);
        for j in 0..p {
            scores[[row, j]] = residual * x[[i, j]];
        }
    }
    let (meat, strata_dropped) = variance::clustered_outer_product(design, scores.view());
    let covariance = bread.dot(&meat).dot(&bread);

    let reference =
        StudentsT::new(0.0, 1.0, df).map_err(|_| DesignError::InsufficientReplication {
            n_clusters: design.n_clusters(),
            n_strata: design.n_strata(),
        })?;

    let mut terms = Vec::with_capacity(p);
    for (j, name) in names.into_iter().enumerate() {
        let estimate = converged.beta[j];
        let std_error = covariance[[j, j]].max(0.0).sqrt();
        let p_value = if std_error > 0.0 {
            let t = (estimate / std_error).abs();
            2.0 * (1.0 - reference.cdf(t))
        } else {
            f64::NAN
        };
        terms.push(CoefficientEstimate {
            name,
            estimate,
            std_error,
            odds_ratio: estimate.exp(),
            p_value,
        });
    }

    log::info!(
        "fit '{}': {} coefficients, {} iterations, log-likelihood {:.4}",
        outcome.name(),
        p,
        converged.iterations,
        converged.log_likelihood
    );

    Ok(RegressionFit {
        terms,
        df,
        n_used,
        iterations: converged.iterations,
        log_likelihood: converged.log_likelihood,
        precision_flag: strata_dropped > 0,
    })
}

enum ColumnSpec<'a> {
    Intercept,
    Indicator {
        variable: &'a CategoricalVariable,
        level: u32,
    },
    Value(&'a NumericVariable),
}

impl ColumnSpec<'_> {
    /// Design-matrix entry for a complete-case row; callers guarantee the
    /// row is observed on every term.
    fn value(&self, row: usize) -> f64 {
        match self {
            ColumnSpec::Intercept => 1.0,
            ColumnSpec::Indicator { variable, level } => {
                if variable.codes()[row] == Some(*level) {
                    1.0
                } else {
                    0.0
                }
            }
            ColumnSpec::Value(variable) => variable.values()[row].unwrap_or(0.0),
        }
    }
}

struct ConvergedFit {
    beta: Array1<f64>,
    mu: Array1<f64>,
    /// X' W X with the final IRLS weights.
    information: Array2<f64>,
    iterations: usize,
    log_likelihood: f64,
}

fn irls(
    x: &Array2<f64>,
    y: &Array1<f64>,
    prior_weights: &Array1<f64>,
    config: &LogisticConfig,
) -> Result<ConvergedFit, FitError> {
    let p = x.ncols();
    let mut beta = Array1::<f64>::zeros(p);
    let mut eta = x.dot(&beta);
    let mut last_deviance = deviance(y, &sigmoid(&eta), prior_weights);
    let mut last_change = f64::NAN;

    for iteration in 1..=config.max_iterations {
        let mu = sigmoid(&eta);
        // Working weights and response for the logit link: W = w mu(1-mu),
        // z = eta + (y - mu) / (mu(1-mu)).
        let mu_variance = mu.mapv(|m| (m * (1.0 - m)).max(MIN_MU_VARIANCE));
        let irls_weights = prior_weights * &mu_variance;
        let z = &eta + &((y - &mu) / &mu_variance);

        let weighted_x = x * &irls_weights.view().insert_axis(Axis(1));
        let information = x.t().dot(&weighted_x);
        let rhs = weighted_x.t().dot(&z);
        beta = information.solve_into(rhs)?;
        eta = x.dot(&beta);

        let max_abs_eta = eta.iter().fold(0.0f64, |acc, &e| acc.max(e.abs()));
        if !max_abs_eta.is_finite() || max_abs_eta > MAX_STABLE_ETA {
            return Err(ConvergenceError::Unstable {
                iteration,
                max_abs_eta,
            }
            .into());
        }

        let mu_new = sigmoid(&eta);
        let new_deviance = deviance(y, &mu_new, prior_weights);
        last_change = (last_deviance - new_deviance).abs();
        log::debug!(
            "IRLS iteration {iteration}: deviance {new_deviance:.6e}, change {last_change:.3e}"
        );

        if last_change < config.convergence_tolerance * (new_deviance.abs() + 0.1) {
            let mu_variance = mu_new.mapv(|m| (m * (1.0 - m)).max(MIN_MU_VARIANCE));
            let irls_weights = prior_weights * &mu_variance;
            let weighted_x = x * &irls_weights.view().insert_axis(Axis(1));
            let information = x.t().dot(&weighted_x);
            return Ok(ConvergedFit {
                beta,
                mu: mu_new,
                information,
                iterations: iteration,
                log_likelihood: -new_deviance / 2.0,
            });
        }
        last_deviance = new_deviance;
    }

    Err(ConvergenceError::MaxIterationsReached {
        max_iterations: config.max_iterations,
        last_change,
    }
    .into())
}

fn sigmoid(eta: &Array1<f64>) -> Array1<f64> {
    eta.mapv(|e| {
        let mu = 1.0 / (1.0 + (-e.clamp(-700.0, 700.0)).exp());
        mu.clamp(PROB_EPS, 1.0 - PROB_EPS)
    })
}

/// Weighted binomial deviance, -2 times the weighted log-likelihood up to
/// the saturated-model constant (zero for 0/1 outcomes).
fn deviance(y: &Array1<f64>, mu: &Array1<f64>, weights: &Array1<f64>) -> f64 {
    let total = ndarray::Zip::from(y)
        .and(mu)
        .and(weights)
        .fold(0.0, |acc, &yi, &mui, &wi| {
            let mui = mui.clamp(PROB_EPS, 1.0 - PROB_EPS);
            let term = if yi > 0.5 { -mui.ln() } else { -(1.0 - mui).ln() };
            acc + wi * term
        });
    2.0 * total
}

fn resolve_reference(
    variable: &CategoricalVariable,
    requested: Option<&str>,
) -> Result<u32, FitError> {
    match requested {
        None => Ok(0),
        Some(level) => variable
            .level_index(level)
            .ok_or_else(|| FitError::UnknownReferenceLevel {
                variable: variable.name().to_string(),
                level: level.to_string(),
            }),
    }
}

fn check_length(design: &SurveyDesign, variable: &str, found: usize) -> Result<(), FitError> {
    if found != design.len() {
        return Err(FitError::LengthMismatch {
            variable: variable.to_string(),
            expected: design.len(),
            found,
        });
    }
    Ok(())
}
