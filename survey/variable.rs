//! Typed analysis variables.
//!
//! A `CategoricalVariable` carries its level labels as a declared, ordered
//! list fixed at construction time. Level order is meaningful: it determines
//! the row order of summary tables and the default reference level of a
//! regression term, so it is never inferred from the order values happen to
//! appear in the data.

use ahash::AHashMap;
use thiserror::Error;

use crate::data::Column;

#[derive(Error, Debug)]
pub enum VariableError {
    #[error("variable '{variable}' declares no levels")]
    NoLevels { variable: String },

    #[error("variable '{variable}' declares duplicate level '{level}'")]
    DuplicateLevel { variable: String, level: String },

    #[error("value '{value}' at row {row} of '{variable}' is not a declared level")]
    UndeclaredValue {
        variable: String,
        value: String,
        row: usize,
    },

    #[error("level code {code} at row {row} of '{variable}' is out of range ({n_levels} levels)")]
    CodeOutOfRange {
        variable: String,
        code: u32,
        row: usize,
        n_levels: usize,
    },

    #[error("column for '{variable}' holds text; numeric variables require a numeric column")]
    NotNumeric { variable: String },
}

/// A named partition of observations into exclusive, labeled levels.
///
/// `codes[i]` indexes into `levels`; `None` marks a missing observation,
/// which every estimation routine excludes rather than imputes.
#[derive(Debug, Clone)]
pub struct CategoricalVariable {
    name: String,
    levels: Vec<String>,
    codes: Vec<Option<u32>>,
}

impl CategoricalVariable {
    pub fn new(
        name: impl Into<String>,
        levels: Vec<String>,
        codes: Vec<Option<u32>>,
    ) -> Result<Self, VariableError> {
        let name = name.into();
        validate_levels(&name, &levels)?;
        for (row, code) in codes.iter().enumerate() {
            if let Some(c) = code
                && *c as usize >= levels.len()
            {
                return Err(VariableError::CodeOutOfRange {
                    variable: name,
                    code: *c,
                    row,
                    n_levels: levels.len(),
                });
            }
        }
        Ok(Self {
            name,
            levels,
            codes,
        })
    }

    /// Builds a variable from per-row labels, requiring every non-missing
    /// label to be one of the declared levels.
    pub fn from_labels<S: AsRef<str>>(
        name: impl Into<String>,
        levels: Vec<String>,
        labels: &[Option<S>],
    ) -> Result<Self, VariableError> {
        let name = name.into();
        validate_levels(&name, &levels)?;
        let index: AHashMap<&str, u32> = levels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.as_str(), i as u32))
            .collect();
        let mut codes = Vec::with_capacity(labels.len());
        for (row, label) in labels.iter().enumerate() {
            match label {
                None => codes.push(None),
                Some(l) => match index.get(l.as_ref()) {
                    Some(&c) => codes.push(Some(c)),
                    None => {
                        return Err(VariableError::UndeclaredValue {
                            variable: name,
                            value: l.as_ref().to_string(),
                            row,
                        });
                    }
                },
            }
        }
        Ok(Self {
            name,
            levels,
            codes,
        })
    }

    /// Builds a variable from a dataset column. Numeric cells are rendered
    /// with [`Column::label_at`] so integer-valued codes match text levels
    /// like `"1"`.
    pub fn from_column(
        name: impl Into<String>,
        levels: Vec<String>,
        column: &Column,
    ) -> Result<Self, VariableError> {
        let labels: Vec<Option<String>> = (0..column.len()).map(|row| column.label_at(row)).collect();
        Self::from_labels(name, levels, &labels)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn codes(&self) -> &[Option<u32>] {
        &self.codes
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    /// Count of observations with a non-missing value.
    pub fn n_observed(&self) -> usize {
        self.codes.iter().filter(|c| c.is_some()).count()
    }

    pub fn level_index(&self, label: &str) -> Option<u32> {
        self.levels
            .iter()
            .position(|l| l == label)
            .map(|i| i as u32)
    }
}

/// A numeric covariate. `None` marks a missing observation.
#[derive(Debug, Clone)]
pub struct NumericVariable {
    name: String,
    values: Vec<Option<f64>>,
}

impl NumericVariable {
    pub fn new(name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        // Non-finite measurements carry no analytic information; fold them
        // into the missing category.
        let values = values
            .into_iter()
            .map(|v| v.filter(|x| x.is_finite()))
            .collect();
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn from_column(name: impl Into<String>, column: &Column) -> Result<Self, VariableError> {
        let name = name.into();
        match column {
            Column::Numeric(values) => Ok(Self::new(name, values.clone())),
            Column::Text(_) => Err(VariableError::NotNumeric { variable: name }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn validate_levels(name: &str, levels: &[String]) -> Result<(), VariableError> {
    if levels.is_empty() {
        return Err(VariableError::NoLevels {
            variable: name.to_string(),
        });
    }
    let mut seen: AHashMap<&str, ()> = AHashMap::with_capacity(levels.len());
    for level in levels {
        if seen.insert(level.as_str(), ()).is_some() {
            return Err(VariableError::DuplicateLevel {
                variable: name.to_string(),
                level: level.clone(),
            });
        }
    }
    Ok(())
}
