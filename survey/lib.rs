pub mod batch;
pub mod data;
pub mod design;
pub mod estimate;
pub mod logistic;
pub mod recode;
pub mod variable;

mod variance;

pub use batch::{TableSpec, tabulate_all};
pub use data::{Column, DataError, Dataset, FieldKind, FieldSpec};
pub use design::{DesignError, SurveyDesign};
pub use estimate::{EstimationError, PercentMode, SummaryTable, WeightedEstimate};
pub use logistic::{
    CoefficientEstimate, ConvergenceError, FitError, LogisticConfig, ModelTerm, RegressionFit,
};
pub use recode::{RecodeConfig, RecodeError, RecodeMapping, RecodeRule, UnmatchedPolicy};
pub use variable::{CategoricalVariable, NumericVariable, VariableError};
