//! Batch tabulation with per-table error isolation.
//!
//! An analysis run typically produces a stack of tables from one design. A
//! degenerate subgroup in one of them is not a reason to lose the others, so
//! the batch runner returns one result per request and never short-circuits.
//! Requests share only the read-only design and variables, so they fan out
//! across threads.

use rayon::prelude::*;

use crate::design::SurveyDesign;
use crate::estimate::{self, EstimationError, PercentMode, SummaryTable};
use crate::variable::CategoricalVariable;

/// One tabulation request.
#[derive(Debug, Clone, Copy)]
pub enum TableSpec<'a> {
    Overall {
        variable: &'a CategoricalVariable,
    },
    By {
        variable: &'a CategoricalVariable,
        group: &'a CategoricalVariable,
        mode: PercentMode,
    },
}

impl TableSpec<'_> {
    fn variable_name(&self) -> &str {
        match self {
            TableSpec::Overall { variable } | TableSpec::By { variable, .. } => variable.name(),
        }
    }
}

/// Runs every request, in parallel, preserving request order in the output.
/// Failed requests surface their `EstimationError` in place.
pub fn tabulate_all(
    design: &SurveyDesign,
    specs: &[TableSpec<'_>],
) -> Vec<Result<SummaryTable, EstimationError>> {
    specs
        .par_iter()
        .map(|spec| {
            let result = match *spec {
                TableSpec::Overall { variable } => estimate::summarize(design, variable),
                TableSpec::By {
                    variable,
                    group,
                    mode,
                } => estimate::summarize_by(design, variable, group, mode),
            };
            if let Err(err) = &result {
                log::warn!("table for '{}' skipped: {err}", spec.variable_name());
            }
            result
        })
        .collect()
}
