//! # Dataset Loading and Validation
//!
//! This module is the entry point for user-provided data. It reads a
//! delimited text extract with the Polars CSV reader, validates that every
//! requested column is present and readable as its declared kind, and hands
//! the rest of the crate a plain columnar `Dataset` — the estimation core
//! never touches a DataFrame.
//!
//! Unlike the design fields, analysis columns may contain missing values;
//! they are preserved as `None` rather than rejected, because missingness is
//! part of the analysis (every estimator excludes, never imputes). Failures
//! here are assumed to be user-input errors, so `DataError` messages name
//! the offending column.

use std::fs::File;
use std::path::Path;

use polars::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("the required column '{0}' was not found in the input file")]
    ColumnNotFound(String),

    #[error("column '{column}' could not be read as {expected} (found type: {found})")]
    ColumnWrongType {
        column: String,
        expected: &'static str,
        found: String,
    },

    #[error("non-finite value at row {row} of numeric column '{column}'")]
    NonFiniteValue { column: String, row: usize },

    #[error("columns have mismatched lengths: '{column}' has {found} rows, expected {expected}")]
    ColumnLengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("duplicate column name '{0}'")]
    DuplicateColumn(String),
}

/// Declared kind of a requested column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Numeric,
    Text,
}

/// One column request for the loader.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn numeric(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Numeric,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Text,
        }
    }
}

/// A validated column; `None` marks a missing cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(v) => v.len(),
            Column::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cell rendered as a label. Integer-valued numeric cells print without
    /// a fractional part so raw codes like `1.0` match rules written as
    /// `"1"`.
    pub fn label_at(&self, row: usize) -> Option<String> {
        match self {
            Column::Text(values) => values.get(row)?.clone(),
            Column::Numeric(values) => {
                let value = (*values.get(row)?)?;
                if value.fract() == 0.0 && value.abs() < 1e15 {
                    Some(format!("{}", value as i64))
                } else {
                    Some(format!("{value}"))
                }
            }
        }
    }
}

/// A columnar snapshot of the input table.
#[derive(Debug, Clone)]
pub struct Dataset {
    n_rows: usize,
    columns: Vec<(String, Column)>,
}

impl Dataset {
    /// Assembles a dataset from named columns, validating consistent
    /// lengths and unique names.
    pub fn new(columns: Vec<(String, Column)>) -> Result<Self, DataError> {
        let n_rows = columns.first().map_or(0, |(_, c)| c.len());
        let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for (name, column) in &columns {
            if !seen.insert(name.as_str()) {
                return Err(DataError::DuplicateColumn(name.clone()));
            }
            if column.len() != n_rows {
                return Err(DataError::ColumnLengthMismatch {
                    column: name.clone(),
                    expected: n_rows,
                    found: column.len(),
                });
            }
        }
        Ok(Self { n_rows, columns })
    }

    /// Reads the requested columns from a delimited text file.
    pub fn load_delimited(
        path: &Path,
        separator: u8,
        fields: &[FieldSpec],
    ) -> Result<Self, DataError> {
        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(separator)),
            )
            .finish()?;

        log::info!(
            "loaded {} rows x {} columns from {}",
            df.height(),
            df.width(),
            path.display()
        );

        let present: std::collections::HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();

        let mut columns = Vec::with_capacity(fields.len());
        for field in fields {
            if !present.contains(&field.name) {
                return Err(DataError::ColumnNotFound(field.name.clone()));
            }
            let column = match field.kind {
                FieldKind::Numeric => Column::Numeric(extract_numeric(&df, &field.name)?),
                FieldKind::Text => Column::Text(extract_text(&df, &field.name)?),
            };
            columns.push((field.name.clone(), column));
        }

        Self::new(columns)
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }
}

fn extract_numeric(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, DataError> {
    let series = df.column(name)?;
    let nulls_before = series.null_count();
    let casted = series
        .cast(&DataType::Float64)
        .map_err(|_| DataError::ColumnWrongType {
            column: name.to_string(),
            expected: "f64 (numeric)",
            found: format!("{:?}", series.dtype()),
        })?;

    // A non-strict cast turns unparseable cells into nulls; any increase
    // means the column holds non-numeric data.
    if casted.null_count() > nulls_before {
        return Err(DataError::ColumnWrongType {
            column: name.to_string(),
            expected: "f64 (numeric)",
            found: format!("{:?}", series.dtype()),
        });
    }

    let chunked = casted.f64()?.rechunk();
    let values: Vec<Option<f64>> = chunked.iter().collect();
    for (row, value) in values.iter().enumerate() {
        if let Some(v) = value
            && !v.is_finite()
        {
            return Err(DataError::NonFiniteValue {
                column: name.to_string(),
                row,
            });
        }
    }
    Ok(values)
}

fn extract_text(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, DataError> {
    let series = df.column(name)?;
    let casted = series
        .cast(&DataType::String)
        .map_err(|_| DataError::ColumnWrongType {
            column: name.to_string(),
            expected: "text",
            found: format!("{:?}", series.dtype()),
        })?;
    let chunked = casted.str()?.rechunk();
    Ok(chunked
        .iter()
        .map(|value| {
            value.and_then(|s| {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
        })
        .collect())
}
