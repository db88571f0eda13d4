//! # Declared Value Recoding
//!
//! Raw survey extracts carry coded values (`1`, `2`, `7`, `9`) that analyses
//! read as labeled categories. Those code-to-label tables are data, not
//! code: each variable's mapping is declared once — in TOML or directly as a
//! `RecodeMapping` — and applied by a single routine, instead of living as
//! inline conditionals at every use site.
//!
//! A mapping must say what happens to a code it does not recognize. There is
//! no implicit fallback: `error` rejects the dataset, `pass_through` keeps
//! the raw code as a visible extra category, and `missing` treats it as
//! nonresponse. The configuration default is `error`.
//!
//! ```toml
//! [[mappings]]
//! variable = "sex"
//! levels = ["Male", "Female"]
//! unmatched = "missing"
//! rules = [
//!     { code = "1", label = "Male" },
//!     { code = "2", label = "Female" },
//! ]
//! ```

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::Column;
use crate::variable::{CategoricalVariable, VariableError};

#[derive(Error, Debug)]
pub enum RecodeError {
    #[error("failed to parse recode configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("mapping for '{variable}' declares no output levels")]
    EmptyLevels { variable: String },

    #[error("mapping for '{variable}' repeats raw code '{code}'")]
    DuplicateCode { variable: String, code: String },

    #[error("rule '{code}' -> '{label}' of '{variable}' targets an undeclared level")]
    UndeclaredLabel {
        variable: String,
        code: String,
        label: String,
    },

    #[error("unrecognized code '{code}' at row {row} of '{variable}'")]
    UnmatchedCode {
        variable: String,
        code: String,
        row: usize,
    },

    #[error(transparent)]
    Variable(#[from] VariableError),
}

/// What to do with a raw code no rule matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedPolicy {
    /// Reject the dataset. The default: an unexpected code is a
    /// data-quality problem until someone declares otherwise.
    #[default]
    Error,
    /// Keep the raw code as its own category, appended after the declared
    /// levels so it can never silently reorder a report.
    PassThrough,
    /// Treat the code as nonresponse.
    Missing,
}

/// One raw-code-to-label rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecodeRule {
    pub code: String,
    pub label: String,
}

/// The declared mapping for one variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecodeMapping {
    pub variable: String,
    /// Output levels in report order.
    pub levels: Vec<String>,
    pub rules: Vec<RecodeRule>,
    #[serde(default)]
    pub unmatched: UnmatchedPolicy,
}

/// A set of mappings, typically deserialized from one TOML document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecodeConfig {
    #[serde(default)]
    pub mappings: Vec<RecodeMapping>,
}

impl RecodeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, RecodeError> {
        let config: Self = toml::from_str(text)?;
        for mapping in &config.mappings {
            mapping.validate()?;
        }
        Ok(config)
    }

    pub fn mapping(&self, variable: &str) -> Option<&RecodeMapping> {
        self.mappings.iter().find(|m| m.variable == variable)
    }
}

impl RecodeMapping {
    /// Checks the mapping's internal consistency: non-empty levels, unique
    /// codes, and every rule targeting a declared level.
    pub fn validate(&self) -> Result<(), RecodeError> {
        if self.levels.is_empty() {
            return Err(RecodeError::EmptyLevels {
                variable: self.variable.clone(),
            });
        }
        let mut seen: AHashMap<&str, ()> = AHashMap::with_capacity(self.rules.len());
        for rule in &self.rules {
            if seen.insert(rule.code.as_str(), ()).is_some() {
                return Err(RecodeError::DuplicateCode {
                    variable: self.variable.clone(),
                    code: rule.code.clone(),
                });
            }
            if !self.levels.contains(&rule.label) {
                return Err(RecodeError::UndeclaredLabel {
                    variable: self.variable.clone(),
                    code: rule.code.clone(),
                    label: rule.label.clone(),
                });
            }
        }
        Ok(())
    }

    /// Applies the mapping to a raw column, producing a categorical variable
    /// with this mapping's declared level order. Missing cells stay missing.
    pub fn apply(&self, column: &Column) -> Result<CategoricalVariable, RecodeError> {
        self.validate()?;

        let rule_table: AHashMap<&str, &str> = self
            .rules
            .iter()
            .map(|r| (r.code.as_str(), r.label.as_str()))
            .collect();

        let mut levels = self.levels.clone();
        let mut level_index: AHashMap<String, u32> = levels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.clone(), i as u32))
            .collect();

        let mut codes: Vec<Option<u32>> = Vec::with_capacity(column.len());
        for row in 0..column.len() {
            let raw = match column.label_at(row) {
                None => {
                    codes.push(None);
                    continue;
                }
                Some(raw) => raw,
            };
            match rule_table.get(raw.as_str()) {
                Some(label) => codes.push(Some(level_index[*label])),
                None => match self.unmatched {
                    UnmatchedPolicy::Error => {
                        return Err(RecodeError::UnmatchedCode {
                            variable: self.variable.clone(),
                            code: raw,
                            row,
                        });
                    }
                    UnmatchedPolicy::Missing => codes.push(None),
                    UnmatchedPolicy::PassThrough => {
                        let next = levels.len() as u32;
                        let index = *level_index.entry(raw.clone()).or_insert_with(|| {
                            levels.push(raw.clone());
                            next
                        });
                        codes.push(Some(index));
                    }
                },
            }
        }

        if self.unmatched == UnmatchedPolicy::PassThrough && levels.len() > self.levels.len() {
            log::warn!(
                "'{}': {} unmapped code(s) kept as extra categories",
                self.variable,
                levels.len() - self.levels.len()
            );
        }

        Ok(CategoricalVariable::new(
            self.variable.clone(),
            levels,
            codes,
        )?)
    }
}
