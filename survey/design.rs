//! # Sampling Design
//!
//! `SurveyDesign` is the immutable binding of a dataset to its sampling
//! design: one stratum, one primary sampling unit (cluster), and one final
//! weight per observation. Every estimation routine in this crate reads the
//! design through the accessors here; nothing mutates it after construction.
//!
//! Construction is where all design validation lives. A malformed design is
//! unrecoverable for the analysis run, so every check fails eagerly with a
//! `DesignError` instead of patching in defaults.

use ahash::AHashMap;
use ndarray::Array1;
use thiserror::Error;

use crate::data::{Column, Dataset};

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("survey design has no observations")]
    Empty,

    #[error(
        "design fields have mismatched lengths: {strata} strata, {clusters} clusters, {weights} weights"
    )]
    LengthMismatch {
        strata: usize,
        clusters: usize,
        weights: usize,
    },

    #[error("design field '{field}' was not found in the dataset")]
    FieldNotFound { field: String },

    #[error("weight field '{field}' is not numeric")]
    WeightFieldNotNumeric { field: String },

    #[error(
        "design field '{field}' is missing at row {row}; sampling design fields may not contain missing values"
    )]
    MissingField { field: &'static str, row: usize },

    #[error("weight {value} at row {row} is not a strictly positive finite number")]
    InvalidWeight { row: usize, value: f64 },

    #[error(
        "cluster '{cluster}' appears under stratum '{first}' and stratum '{second}'; a cluster id must nest within a single stratum"
    )]
    AmbiguousNesting {
        cluster: String,
        first: String,
        second: String,
    },

    #[error(
        "design has {n_clusters} clusters across {n_strata} strata; variance estimation requires more clusters than strata"
    )]
    InsufficientReplication {
        n_clusters: usize,
        n_strata: usize,
    },
}

/// Immutable stratified-cluster sampling design.
///
/// Strata and clusters are stored as dense indexes in first-appearance
/// order; the original labels are kept for diagnostics. Clusters are global
/// indexes — each belongs to exactly one stratum, which construction
/// enforces.
#[derive(Debug, Clone)]
pub struct SurveyDesign {
    weights: Array1<f64>,
    row_stratum: Vec<u32>,
    row_cluster: Vec<u32>,
    stratum_labels: Vec<String>,
    cluster_labels: Vec<String>,
    cluster_stratum: Vec<u32>,
    stratum_cluster_counts: Vec<u32>,
}

impl SurveyDesign {
    /// Binds complete per-row design fields. All three slices must have the
    /// same non-zero length.
    pub fn new<S: AsRef<str>>(
        strata: &[S],
        clusters: &[S],
        weights: &[f64],
    ) -> Result<Self, DesignError> {
        let strata: Vec<Option<&str>> = strata.iter().map(|s| Some(s.as_ref())).collect();
        let clusters: Vec<Option<&str>> = clusters.iter().map(|s| Some(s.as_ref())).collect();
        let weights: Vec<Option<f64>> = weights.iter().map(|&w| Some(w)).collect();
        Self::build(&strata, &clusters, &weights)
    }

    /// Binds a dataset to its design fields by column name, per the
    /// `create(rows, stratumField, clusterField, weightField)` contract.
    /// Stratum and cluster ids may live in text or numeric columns; the
    /// weight column must be numeric.
    pub fn from_dataset(
        data: &Dataset,
        stratum_field: &str,
        cluster_field: &str,
        weight_field: &str,
    ) -> Result<Self, DesignError> {
        let stratum_col = require_column(data, stratum_field)?;
        let cluster_col = require_column(data, cluster_field)?;
        let weight_col = require_column(data, weight_field)?;

        let strata: Vec<Option<String>> =
            (0..data.n_rows()).map(|r| stratum_col.label_at(r)).collect();
        let clusters: Vec<Option<String>> =
            (0..data.n_rows()).map(|r| cluster_col.label_at(r)).collect();
        let weights: Vec<Option<f64>> = match weight_col {
            Column::Numeric(values) => values.clone(),
            Column::Text(_) => {
                return Err(DesignError::WeightFieldNotNumeric {
                    field: weight_field.to_string(),
                });
            }
        };

        let strata: Vec<Option<&str>> = strata.iter().map(|s| s.as_deref()).collect();
        let clusters: Vec<Option<&str>> = clusters.iter().map(|s| s.as_deref()).collect();
        Self::build(&strata, &clusters, &weights)
    }

    fn build(
        strata: &[Option<&str>],
        clusters: &[Option<&str>],
        weights: &[Option<f64>],
    ) -> Result<Self, DesignError> {
        if strata.len() != clusters.len() || strata.len() != weights.len() {
            return Err(DesignError::LengthMismatch {
                strata: strata.len(),
                clusters: clusters.len(),
                weights: weights.len(),
            });
        }
        if strata.is_empty() {
            return Err(DesignError::Empty);
        }

        let n = strata.len();
        let mut weight_values = Vec::with_capacity(n);
        for (row, w) in weights.iter().enumerate() {
            match w {
                None => return Err(DesignError::MissingField { field: "weight", row }),
                Some(value) => {
                    if !value.is_finite() || *value <= 0.0 {
                        return Err(DesignError::InvalidWeight { row, value: *value });
                    }
                    weight_values.push(*value);
                }
            }
        }

        let mut stratum_index: AHashMap<String, u32> = AHashMap::new();
        let mut stratum_labels: Vec<String> = Vec::new();
        let mut cluster_index: AHashMap<String, u32> = AHashMap::new();
        let mut cluster_labels: Vec<String> = Vec::new();
        let mut cluster_stratum: Vec<u32> = Vec::new();

        let mut row_stratum = Vec::with_capacity(n);
        let mut row_cluster = Vec::with_capacity(n);

        for row in 0..n {
            let stratum = strata[row]
                .ok_or(DesignError::MissingField { field: "stratum", row })?;
            let cluster = clusters[row]
                .ok_or(DesignError::MissingField { field: "cluster", row })?;

            let h = *stratum_index.entry(stratum.to_string()).or_insert_with(|| {
                stratum_labels.push(stratum.to_string());
                (stratum_labels.len() - 1) as u32
            });

            let c = match cluster_index.get(cluster) {
                Some(&c) => {
                    let owner = cluster_stratum[c as usize];
                    if owner != h {
                        return Err(DesignError::AmbiguousNesting {
                            cluster: cluster.to_string(),
                            first: stratum_labels[owner as usize].clone(),
                            second: stratum_labels[h as usize].clone(),
                        });
                    }
                    c
                }
                None => {
                    let c = cluster_labels.len() as u32;
                    cluster_index.insert(cluster.to_string(), c);
                    cluster_labels.push(cluster.to_string());
                    cluster_stratum.push(h);
                    c
                }
            };

            row_stratum.push(h);
            row_cluster.push(c);
        }

        let mut stratum_cluster_counts = vec![0u32; stratum_labels.len()];
        for &h in &cluster_stratum {
            stratum_cluster_counts[h as usize] += 1;
        }

        log::debug!(
            "survey design bound: {} rows, {} strata, {} clusters",
            n,
            stratum_labels.len(),
            cluster_labels.len()
        );

        Ok(Self {
            weights: Array1::from_vec(weight_values),
            row_stratum,
            row_cluster,
            stratum_labels,
            cluster_labels,
            cluster_stratum,
            stratum_cluster_counts,
        })
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        // Construction rejects empty designs.
        false
    }

    pub fn n_strata(&self) -> usize {
        self.stratum_labels.len()
    }

    pub fn n_clusters(&self) -> usize {
        self.cluster_labels.len()
    }

    pub fn total_weight(&self) -> f64 {
        self.weights.sum()
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    pub fn stratum_labels(&self) -> &[String] {
        &self.stratum_labels
    }

    pub fn cluster_labels(&self) -> &[String] {
        &self.cluster_labels
    }

    /// Design degrees of freedom: clusters minus strata.
    pub fn degrees_of_freedom(&self) -> i64 {
        self.n_clusters() as i64 - self.n_strata() as i64
    }

    /// Errors unless the design carries enough clusters for design-based
    /// variance estimation (clusters > strata).
    pub fn require_replication(&self) -> Result<(), DesignError> {
        if self.degrees_of_freedom() <= 0 {
            return Err(DesignError::InsufficientReplication {
                n_clusters: self.n_clusters(),
                n_strata: self.n_strata(),
            });
        }
        Ok(())
    }

    /// Per-row stratum index, in first-appearance order of `stratum_labels`.
    pub fn row_stratum(&self) -> &[u32] {
        &self.row_stratum
    }

    /// Per-row cluster index, in first-appearance order of `cluster_labels`.
    pub fn row_cluster(&self) -> &[u32] {
        &self.row_cluster
    }

    /// Owning stratum of each cluster.
    pub fn cluster_stratum(&self) -> &[u32] {
        &self.cluster_stratum
    }

    /// Number of sampled clusters in each stratum.
    pub fn stratum_cluster_counts(&self) -> &[u32] {
        &self.stratum_cluster_counts
    }
}

fn require_column<'d>(data: &'d Dataset, field: &str) -> Result<&'d Column, DesignError> {
    data.column(field).ok_or_else(|| DesignError::FieldNotFound {
        field: field.to_string(),
    })
}
